#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use comm_engine::{ActiveMessage, Engine, EngineConfig};
use transport::{FabricConfig, LocalFabric, MemRegion, Tag};

/// Several engines on one thread, progressed in rank order.
pub struct Mesh {
    pub engines: Vec<Engine>,
}

impl Mesh {
    pub fn new(ranks: usize) -> Self {
        Self::with_config(ranks, EngineConfig::default())
    }

    pub fn with_config(ranks: usize, config: EngineConfig) -> Self {
        let engines = LocalFabric::endpoints(FabricConfig {
            ranks,
            ..FabricConfig::default()
        })
        .into_iter()
        .map(|endpoint| Engine::init(endpoint, config).expect("engine init"))
        .collect();
        Self { engines }
    }

    pub fn rank(&mut self, rank: usize) -> &mut Engine {
        &mut self.engines[rank]
    }

    pub fn progress_all(&mut self) -> usize {
        self.engines
            .iter_mut()
            .map(|engine| engine.progress().expect("progress"))
            .sum()
    }

    /// Progresses every rank until `done` holds.
    pub fn settle(&mut self, done: impl Fn() -> bool) {
        for _ in 0..10_000 {
            self.progress_all();
            check_invariants(&self.engines);
            if done() {
                return;
            }
        }
        panic!("mesh did not settle");
    }

    /// A few extra rounds, to show nothing fires twice.
    pub fn quiesce(&mut self) {
        for _ in 0..8 {
            self.progress_all();
        }
    }

    pub fn register_everywhere<F>(&mut self, tag: Tag, max_len: usize, handler: F)
    where
        F: Fn(&mut Engine, ActiveMessage<'_>) + Clone + Send + Sync + 'static,
    {
        for engine in self.engines.iter_mut() {
            engine
                .tag_register(tag, max_len, handler.clone())
                .expect("tag register");
        }
    }
}

pub fn check_invariants(engines: &[Engine]) {
    for engine in engines {
        let stats = engine.slot_stats();
        assert!(stats.active <= stats.capacity);
        assert!(stats.static_end <= stats.active);
        assert_eq!(
            stats.static_region_len,
            engine.registered_tag_count() * engine.config().slots_per_tag
        );
    }
}

#[derive(Clone, Default)]
pub struct Counter(Arc<AtomicUsize>);

impl Counter {
    pub fn bump(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

pub fn filled(len: usize, value: u8) -> MemRegion {
    MemRegion::from_vec(vec![value; len])
}

pub fn pattern(len: usize, seed: u8) -> MemRegion {
    MemRegion::from_vec((0..len).map(|i| seed.wrapping_add(i as u8)).collect())
}
