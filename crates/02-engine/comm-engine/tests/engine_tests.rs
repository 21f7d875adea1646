//! Engine lifecycle, memory handles, tag registration and active messages.

mod common;

use std::sync::Arc;
use std::thread;

use comm_engine::{
    Engine, EngineConfig, EngineError, MemHandle, GET_TAG, PUT_TAG,
};
use common::{check_invariants, Counter, Mesh};
use parking_lot::Mutex;
use transport::{Datatype, FabricConfig, LocalFabric, MemRegion, TransportError};

/// A fresh engine holds only the two handshake tags.
#[test]
fn init_registers_handshake_tags() {
    let mut mesh = Mesh::new(1);
    let engine = mesh.rank(0);
    assert!(engine.is_registered(GET_TAG));
    assert!(engine.is_registered(PUT_TAG));

    let stats = engine.slot_stats();
    assert_eq!(stats.static_region_len, 10);
    assert_eq!(stats.static_end, 10);
    assert_eq!(stats.active, 10);
    assert_eq!(stats.capacity, 30);
    assert_eq!(stats.dynamic_capacity, 20);
    assert!(engine.can_accept_more());
    check_invariants(&mesh.engines);
}

/// Retrieval returns exactly what was registered.
#[test]
fn mem_register_round_trip() {
    let mut mesh = Mesh::new(1);
    let engine = mesh.rank(0);
    let region = MemRegion::zeroed(64);

    let (handle, size) = engine.mem_register(region.clone(), Datatype::Float64, 8);
    assert_eq!(size, MemHandle::WIRE_LEN);
    assert_eq!(engine.handle_size(), size);

    let found = engine.mem_retrieve(&handle).unwrap();
    assert!(found.region.ptr_eq(&region));
    assert_eq!(found.datatype, Datatype::Float64);
    assert_eq!(found.count, 8);

    engine.mem_unregister(handle).unwrap();
    assert!(engine.mem_retrieve(&handle).is_none());
    assert!(matches!(
        engine.mem_unregister(handle),
        Err(EngineError::UnknownHandle(_))
    ));
}

/// A second registration of the same tag fails and the first handler stays.
#[test]
fn duplicate_tag_keeps_first_registration() {
    let mut mesh = Mesh::new(2);
    let first = Counter::default();
    let second = Counter::default();

    let hits = first.clone();
    mesh.register_everywhere(2, 16, move |_, _| hits.bump());
    let before = mesh.rank(1).slot_stats();

    let hits = second.clone();
    let err = mesh
        .rank(1)
        .tag_register(2, 64, move |_, _| hits.bump())
        .unwrap_err();
    assert!(matches!(err, EngineError::TagAlreadyRegistered(2)));
    assert_eq!(mesh.rank(1).slot_stats(), before);

    mesh.rank(0).send_active_message(2, 1, b"ping").unwrap();
    mesh.settle(|| first.get() == 1);
    assert_eq!(second.get(), 0);
}

#[test]
fn tags_outside_user_range_are_rejected() {
    let mut mesh = Mesh::new(1);
    let engine = mesh.rank(0);
    let layout = engine.tag_layout().clone();
    assert_eq!(layout.user, 2..12);

    for tag in [GET_TAG, PUT_TAG, layout.user.end, 500] {
        let err = engine.tag_register(tag, 8, |_, _| {}).unwrap_err();
        assert!(
            matches!(err, EngineError::TagOutOfRange { .. } | EngineError::TagAlreadyRegistered(_)),
            "tag {tag}: {err}"
        );
    }
    assert!(matches!(
        engine.tag_unregister(7),
        Err(EngineError::UnknownTag(7))
    ));
    check_invariants(&mesh.engines);
}

/// The persistent receives keep working well past the ring depth.
#[test]
fn persistent_receive_survives_many_messages() {
    const K: u32 = 53;
    let mut mesh = Mesh::new(2);
    let received = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&received);
    mesh.register_everywhere(3, 4, move |_, msg| {
        let mut value = [0u8; 4];
        value.copy_from_slice(msg.payload);
        sink.lock().push((msg.source, u32::from_le_bytes(value)));
    });

    for value in 0..K {
        mesh.rank(0)
            .send_active_message(3, 1, &value.to_le_bytes())
            .unwrap();
    }
    let seen = Arc::clone(&received);
    mesh.settle(|| seen.lock().len() == K as usize);
    mesh.quiesce();

    let mut values: Vec<_> = received.lock().iter().map(|(src, v)| (*src, *v)).collect();
    values.sort();
    let expected: Vec<_> = (0..K).map(|v| (0, v)).collect();
    assert_eq!(values, expected);
}

#[test]
fn active_message_limits() {
    let mut mesh = Mesh::new(2);
    mesh.register_everywhere(4, 8, |_, _| {});

    let err = mesh
        .rank(0)
        .send_active_message(4, 1, &[0; 9])
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::MessageTooLarge {
            tag: 4,
            len: 9,
            max: 8
        }
    ));
    assert!(matches!(
        mesh.rank(0).send_active_message(5, 1, b"x"),
        Err(EngineError::UnknownTag(5))
    ));
    assert!(matches!(
        mesh.rank(0).send_active_message(4, 9, b"x"),
        Err(EngineError::Transport(TransportError::InvalidRank { rank: 9, .. }))
    ));
    assert_eq!(mesh.rank(0).stats().active_messages_sent, 0);
}

/// Static accounting follows live tags; capacity never shrinks.
#[test]
fn slot_accounting_across_register_and_unregister() {
    let mut mesh = Mesh::new(1);
    let engine = mesh.rank(0);
    for tag in 2..5 {
        engine.tag_register(tag, 32, |_, _| {}).unwrap();
    }
    let stats = engine.slot_stats();
    assert_eq!(stats.static_region_len, 25);
    assert_eq!(stats.capacity, 45);

    engine.tag_unregister(3).unwrap();
    let stats = engine.slot_stats();
    assert_eq!(stats.static_region_len, 20);
    assert_eq!(stats.static_end, 25);
    assert_eq!(stats.capacity, 45);
    assert_eq!(stats.dynamic_capacity, 20);

    engine.tag_register(3, 32, |_, _| {}).unwrap();
    let stats = engine.slot_stats();
    assert_eq!(stats.static_region_len, 25);
    assert_eq!(stats.static_end, 30);
    assert_eq!(stats.capacity, 50);
    check_invariants(&mesh.engines);
}

/// A registration that fails while arming its receives leaves no slots
/// behind, and the queued message waits for a receive that fits it.
#[test]
fn failed_registration_rolls_back() {
    let mut mesh = Mesh::new(2);
    mesh.rank(1).tag_register(3, 64, |_, _| {}).unwrap();
    mesh.rank(1).send_active_message(3, 0, &[7; 32]).unwrap();

    let err = mesh.rank(0).tag_register(3, 8, |_, _| {}).unwrap_err();
    assert!(matches!(
        err,
        EngineError::Transport(TransportError::Truncated {
            capacity: 8,
            received: 32
        })
    ));
    assert!(!mesh.rank(0).is_registered(3));
    let stats = mesh.rank(0).slot_stats();
    assert_eq!(stats.static_region_len, 10);
    assert_eq!(stats.static_end, 10);
    check_invariants(&mesh.engines);

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    mesh.rank(0)
        .tag_register(3, 64, move |_, msg| sink.lock().push(msg.payload.to_vec()))
        .unwrap();
    let seen = Arc::clone(&received);
    mesh.settle(|| !seen.lock().is_empty());
    assert_eq!(*received.lock(), vec![vec![7; 32]]);
}

/// A new tag gets its own buffers; the old tag stops delivering.
#[test]
fn unregister_then_register_uses_fresh_buffers() {
    let mut mesh = Mesh::new(2);
    let old_tag = Arc::new(Mutex::new(Vec::<Vec<u8>>::new()));
    let new_tag = Arc::new(Mutex::new(Vec::<Vec<u8>>::new()));

    let sink = Arc::clone(&old_tag);
    mesh.register_everywhere(2, 8, move |_, msg| sink.lock().push(msg.payload.to_vec()));
    mesh.rank(0).send_active_message(2, 1, b"old-data").unwrap();
    let seen = Arc::clone(&old_tag);
    mesh.settle(|| seen.lock().len() == 1);

    mesh.rank(1).tag_unregister(2).unwrap();
    let sink = Arc::clone(&new_tag);
    mesh.register_everywhere(3, 8, move |_, msg| sink.lock().push(msg.payload.to_vec()));

    mesh.rank(0).send_active_message(2, 1, b"stale").unwrap();
    mesh.rank(0).send_active_message(3, 1, b"new").unwrap();
    let seen = Arc::clone(&new_tag);
    mesh.settle(|| seen.lock().len() == 1);
    mesh.quiesce();

    assert_eq!(*old_tag.lock(), vec![b"old-data".to_vec()]);
    assert_eq!(*new_tag.lock(), vec![b"new".to_vec()]);
    check_invariants(&mesh.engines);
}

/// Handlers get the engine back and can send from inside the callback.
#[test]
fn handler_replies_from_callback() {
    let mut mesh = Mesh::new(2);
    let replies = Counter::default();

    let seen = replies.clone();
    mesh.register_everywhere(6, 16, move |engine, msg| {
        if engine.rank() == 1 {
            engine
                .send_active_message(6, msg.source, b"pong")
                .expect("reply");
        } else {
            assert_eq!(msg.payload, b"pong");
            seen.bump();
        }
    });

    for _ in 0..3 {
        mesh.rank(0).send_active_message(6, 1, b"ping").unwrap();
    }
    mesh.settle(|| replies.get() == 3);
}

#[test]
fn progress_and_registration_are_not_reentrant() {
    let mut mesh = Mesh::new(1);
    let outcomes = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&outcomes);
    mesh.rank(0)
        .tag_register(2, 8, move |engine, _| {
            let nested = engine.progress();
            let register = engine.tag_register(9, 8, |_, _| {});
            sink.lock().push((
                matches!(nested, Err(EngineError::Reentrant)),
                matches!(register, Err(EngineError::Reentrant)),
            ));
        })
        .unwrap();

    mesh.rank(0).send_active_message(2, 0, b"self").unwrap();
    let seen = Arc::clone(&outcomes);
    mesh.settle(|| !seen.lock().is_empty());
    assert_eq!(*outcomes.lock(), vec![(true, true)]);
    assert!(!mesh.rank(0).is_registered(9));
}

#[test]
fn sync_is_a_barrier() {
    let endpoints = LocalFabric::endpoints(FabricConfig {
        ranks: 3,
        ..FabricConfig::default()
    });
    let arrived = Counter::default();

    let handles: Vec<_> = endpoints
        .into_iter()
        .map(|endpoint| {
            let arrived = arrived.clone();
            thread::spawn(move || {
                let mut engine = Engine::init(endpoint, EngineConfig::default()).unwrap();
                arrived.bump();
                engine.sync().unwrap();
                assert_eq!(arrived.get(), 3);
                engine.shutdown().unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn tag_upper_bound_defaults_and_limits() {
    let mut endpoints = LocalFabric::endpoints(FabricConfig {
        ranks: 1,
        tag_upper_bound: None,
    });
    let engine = Engine::init(endpoints.remove(0), EngineConfig::default()).unwrap();
    assert_eq!(engine.tag_layout().ephemeral_last, i32::MAX as u32);

    let mut endpoints = LocalFabric::endpoints(FabricConfig {
        ranks: 1,
        tag_upper_bound: Some(8),
    });
    assert!(matches!(
        Engine::init(endpoints.remove(0), EngineConfig::default()),
        Err(EngineError::InvalidConfig(_))
    ));
}

#[test]
fn pack_and_unpack_pass_through() {
    let mut mesh = Mesh::new(1);
    let engine = mesh.rank(0);
    let mut buffer = [0u8; 8];
    let mut position = 0;
    engine.pack(b"abc", &mut buffer, &mut position).unwrap();
    engine.pack(b"de", &mut buffer, &mut position).unwrap();
    assert_eq!(position, 5);
    assert!(matches!(
        engine.pack(b"overflow", &mut buffer, &mut position),
        Err(EngineError::Transport(TransportError::PackOverflow { .. }))
    ));

    let mut out = [0u8; 2];
    let mut position = 3;
    engine.unpack(&buffer, &mut position, &mut out).unwrap();
    assert_eq!(&out, b"de");
}

#[test]
fn shutdown_releases_everything() {
    let mut mesh = Mesh::new(2);
    mesh.register_everywhere(2, 8, |_, _| {});
    let region = MemRegion::zeroed(8);
    let (local, _) = mesh.rank(0).mem_register(region.clone(), Datatype::Byte, 8);
    let (remote, _) = mesh.rank(1).mem_register(region, Datatype::Byte, 8);

    mesh.rank(0)
        .put(
            comm_engine::Transfer {
                local,
                local_displ: 0,
                remote,
                remote_displ: 0,
                size: 8,
                peer: 1,
                remote_completion: comm_engine::CompletionToken::NONE,
                remote_payload: &[],
            },
            |_, _| {},
        )
        .unwrap();

    for engine in mesh.engines.drain(..) {
        engine.shutdown().unwrap();
    }
}
