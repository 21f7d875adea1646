//! In-process fabric connecting N ranks through channels.
//!
//! Every rank owns a [`LocalEndpoint`] with an unbounded inbox. Sends are
//! eager: the payload is copied into the destination inbox when the send is
//! posted, so send requests complete on the next poll. Receives are matched
//! on `(source, tag)` in posting order; messages that arrive before a matching
//! receive wait in an unexpected queue, preserving per-sender order.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};

use crate::endpoint::{Completion, Completions, Rank, RequestId, Source, Status, Tag, Transport};
use crate::{Span, TransportError, TransportResult};

/// Shape of a local fabric.
#[derive(Clone, Copy, Debug)]
pub struct FabricConfig {
    pub ranks: usize,
    /// Advertised tag upper bound; `None` models a transport that omits it.
    pub tag_upper_bound: Option<Tag>,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            ranks: 2,
            tag_upper_bound: Some(i32::MAX as Tag),
        }
    }
}

pub struct LocalFabric;

impl LocalFabric {
    /// Builds one connected endpoint per rank, indexed by rank.
    pub fn endpoints(config: FabricConfig) -> Vec<LocalEndpoint> {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..config.ranks)
            .map(|_| crossbeam_channel::unbounded())
            .unzip();
        let shared = Arc::new(Shared::new(config.ranks));

        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| LocalEndpoint {
                rank,
                size: config.ranks,
                tag_upper_bound: config.tag_upper_bound,
                peers: senders.clone(),
                inbox,
                shared: Arc::clone(&shared),
                requests: HashMap::new(),
                posted: VecDeque::new(),
                unexpected: VecDeque::new(),
                next_request: 0,
                metrics: EndpointMetrics::default(),
            })
            .collect()
    }

    pub fn pair() -> (LocalEndpoint, LocalEndpoint) {
        let mut endpoints = Self::endpoints(FabricConfig::default()).into_iter();
        match (endpoints.next(), endpoints.next()) {
            (Some(a), Some(b)) => (a, b),
            _ => unreachable!("default fabric has two ranks"),
        }
    }
}

struct Envelope {
    source: Rank,
    tag: Tag,
    data: Vec<u8>,
}

struct BarrierState {
    arrived: usize,
    generation: u64,
}

struct Shared {
    ranks: usize,
    barrier: Mutex<BarrierState>,
    released: Condvar,
}

impl Shared {
    fn new(ranks: usize) -> Self {
        Self {
            ranks,
            barrier: Mutex::new(BarrierState {
                arrived: 0,
                generation: 0,
            }),
            released: Condvar::new(),
        }
    }

    fn wait(&self) {
        let mut state = self.barrier.lock();
        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.ranks {
            state.arrived = 0;
            state.generation = state.generation.wrapping_add(1);
            self.released.notify_all();
            return;
        }
        while state.generation == generation {
            self.released.wait(&mut state);
        }
    }
}

enum RecvPhase {
    Inactive,
    Posted,
    Complete(Status),
}

enum RequestState {
    Send {
        status: Status,
    },
    Recv {
        target: Span,
        source: Source,
        tag: Tag,
        persistent: bool,
        phase: RecvPhase,
    },
}

/// Counters kept by each endpoint.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EndpointMetrics {
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub messages_received: u64,
    pub unexpected_peak: usize,
}

pub struct LocalEndpoint {
    rank: Rank,
    size: usize,
    tag_upper_bound: Option<Tag>,
    peers: Vec<Sender<Envelope>>,
    inbox: Receiver<Envelope>,
    shared: Arc<Shared>,
    requests: HashMap<RequestId, RequestState>,
    posted: VecDeque<RequestId>,
    unexpected: VecDeque<Envelope>,
    next_request: u64,
    metrics: EndpointMetrics,
}

impl LocalEndpoint {
    pub fn metrics(&self) -> EndpointMetrics {
        self.metrics
    }

    /// Requests issued and not yet completed or cancelled.
    pub fn outstanding(&self) -> usize {
        self.requests.len()
    }

    fn allocate(&mut self, state: RequestState) -> RequestId {
        let id = RequestId(self.next_request);
        self.next_request += 1;
        self.requests.insert(id, state);
        id
    }

    fn push(&mut self, data: &[u8], dest: Rank, tag: Tag) -> TransportResult<()> {
        let peer = self.peers.get(dest).ok_or(TransportError::InvalidRank {
            rank: dest,
            size: self.size,
        })?;
        peer.send(Envelope {
            source: self.rank,
            tag,
            data: data.to_vec(),
        })
        .map_err(|_| TransportError::Disconnected { rank: dest })?;
        self.metrics.messages_sent += 1;
        self.metrics.bytes_sent += data.len() as u64;
        Ok(())
    }

    /// Moves everything waiting in the inbox onto posted receives or the
    /// unexpected queue.
    ///
    /// A message too large for its matching receive is kept as unexpected and
    /// the receive stays posted.
    fn pump(&mut self) -> TransportResult<()> {
        while let Ok(envelope) = self.inbox.try_recv() {
            self.metrics.messages_received += 1;
            let matched = self.posted.iter().position(|id| {
                matches!(
                    self.requests.get(id),
                    Some(RequestState::Recv { source, tag, .. })
                        if source.matches(envelope.source) && *tag == envelope.tag
                )
            });
            let Some((pos, id)) =
                matched.and_then(|pos| self.posted.remove(pos).map(|id| (pos, id)))
            else {
                self.queue_unexpected(envelope);
                continue;
            };
            if let Err(err) = self.deliver(id, &envelope) {
                self.posted.insert(pos, id);
                self.queue_unexpected(envelope);
                return Err(err);
            }
        }
        Ok(())
    }

    fn queue_unexpected(&mut self, envelope: Envelope) {
        self.unexpected.push_back(envelope);
        self.metrics.unexpected_peak = self.metrics.unexpected_peak.max(self.unexpected.len());
    }

    /// Arms a receive: matches the oldest unexpected message or queues it.
    ///
    /// On failure the message stays queued and the receive is left inactive.
    fn arm(&mut self, id: RequestId) -> TransportResult<()> {
        let (source, tag) = match self.requests.get_mut(&id) {
            Some(RequestState::Recv {
                source, tag, phase, ..
            }) => {
                *phase = RecvPhase::Posted;
                (*source, *tag)
            }
            _ => return Err(TransportError::UnknownRequest { request: id }),
        };
        let waiting = self
            .unexpected
            .iter()
            .position(|envelope| source.matches(envelope.source) && envelope.tag == tag);
        let Some((pos, envelope)) =
            waiting.and_then(|pos| self.unexpected.remove(pos).map(|envelope| (pos, envelope)))
        else {
            self.posted.push_back(id);
            return Ok(());
        };
        if let Err(err) = self.deliver(id, &envelope) {
            self.unexpected.insert(pos, envelope);
            if let Some(RequestState::Recv { phase, .. }) = self.requests.get_mut(&id) {
                *phase = RecvPhase::Inactive;
            }
            return Err(err);
        }
        Ok(())
    }

    fn deliver(&mut self, id: RequestId, envelope: &Envelope) -> TransportResult<()> {
        match self.requests.get_mut(&id) {
            Some(RequestState::Recv { target, phase, .. }) => {
                let len = target.fill_from(&envelope.data)?;
                *phase = RecvPhase::Complete(Status {
                    peer: envelope.source,
                    tag: envelope.tag,
                    len,
                });
                Ok(())
            }
            _ => Err(TransportError::UnknownRequest { request: id }),
        }
    }

    fn check_rank(&self, rank: Rank) -> TransportResult<()> {
        if rank < self.size {
            Ok(())
        } else {
            Err(TransportError::InvalidRank {
                rank,
                size: self.size,
            })
        }
    }
}

impl Transport for LocalEndpoint {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn tag_upper_bound(&self) -> Option<Tag> {
        self.tag_upper_bound
    }

    fn isend(&mut self, data: &[u8], dest: Rank, tag: Tag) -> TransportResult<RequestId> {
        self.push(data, dest, tag)?;
        Ok(self.allocate(RequestState::Send {
            status: Status {
                peer: dest,
                tag,
                len: data.len(),
            },
        }))
    }

    fn irecv(&mut self, target: Span, source: Source, tag: Tag) -> TransportResult<RequestId> {
        if let Source::Rank(rank) = source {
            self.check_rank(rank)?;
        }
        self.pump()?;
        let id = self.allocate(RequestState::Recv {
            target,
            source,
            tag,
            persistent: false,
            phase: RecvPhase::Inactive,
        });
        if let Err(err) = self.arm(id) {
            self.requests.remove(&id);
            return Err(err);
        }
        Ok(id)
    }

    fn recv_init(&mut self, target: Span, source: Source, tag: Tag) -> TransportResult<RequestId> {
        if let Source::Rank(rank) = source {
            self.check_rank(rank)?;
        }
        Ok(self.allocate(RequestState::Recv {
            target,
            source,
            tag,
            persistent: true,
            phase: RecvPhase::Inactive,
        }))
    }

    fn start(&mut self, request: RequestId) -> TransportResult<()> {
        match self.requests.get(&request) {
            Some(RequestState::Recv {
                persistent: true,
                phase: RecvPhase::Inactive,
                ..
            }) => {
                self.pump()?;
                self.arm(request)
            }
            Some(RequestState::Recv {
                persistent: true, ..
            }) => Ok(()),
            _ => Err(TransportError::UnknownRequest { request }),
        }
    }

    fn test_some(&mut self, requests: &mut [Option<RequestId>]) -> TransportResult<Completions> {
        self.pump()?;
        let mut completions = Completions::new();
        for (index, entry) in requests.iter_mut().enumerate() {
            let Some(id) = *entry else {
                continue;
            };
            let (status, keep) = match self.requests.get_mut(&id) {
                Some(RequestState::Send { status }) => (*status, false),
                Some(RequestState::Recv {
                    phase, persistent, ..
                }) => match *phase {
                    RecvPhase::Complete(status) => {
                        if *persistent {
                            *phase = RecvPhase::Inactive;
                        }
                        (status, *persistent)
                    }
                    RecvPhase::Inactive | RecvPhase::Posted => continue,
                },
                None => return Err(TransportError::UnknownRequest { request: id }),
            };
            if !keep {
                self.requests.remove(&id);
                *entry = None;
            }
            completions.push(Completion { index, status });
        }
        Ok(completions)
    }

    fn cancel(&mut self, request: RequestId) -> TransportResult<()> {
        self.requests
            .remove(&request)
            .ok_or(TransportError::UnknownRequest { request })?;
        self.posted.retain(|id| *id != request);
        Ok(())
    }

    fn send(&mut self, data: &[u8], dest: Rank, tag: Tag) -> TransportResult<()> {
        self.push(data, dest, tag)
    }

    fn barrier(&mut self) -> TransportResult<()> {
        self.shared.wait();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemRegion;

    fn poll_until_complete(
        endpoint: &mut LocalEndpoint,
        requests: &mut [Option<RequestId>],
    ) -> Completions {
        let mut all = Completions::new();
        for _ in 0..16 {
            all.extend(endpoint.test_some(requests).unwrap());
            if requests.iter().all(Option::is_none) {
                break;
            }
        }
        all
    }

    #[test]
    fn send_completes_and_frees() {
        let (mut a, mut b) = LocalFabric::pair();
        let id = a.isend(&[1, 2, 3], 1, 7).unwrap();
        let mut requests = [Some(id)];
        let done = a.test_some(&mut requests).unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(
            done[0].status,
            Status {
                peer: 1,
                tag: 7,
                len: 3
            }
        );
        assert_eq!(requests, [None]);
        assert_eq!(a.outstanding(), 0);

        let region = MemRegion::zeroed(8);
        let recv = b.irecv(region.full_span(), Source::Rank(0), 7).unwrap();
        let mut requests = [Some(recv)];
        let done = poll_until_complete(&mut b, &mut requests);
        assert_eq!(done[0].status.len, 3);
        assert_eq!(&region.to_vec()[..3], &[1, 2, 3]);
    }

    #[test]
    fn receive_matches_on_tag_not_arrival() {
        let (mut a, mut b) = LocalFabric::pair();
        a.send(b"first", 1, 10).unwrap();
        a.send(b"second", 1, 11).unwrap();

        let on_11 = MemRegion::zeroed(16);
        let on_10 = MemRegion::zeroed(16);
        let r11 = b.irecv(on_11.full_span(), Source::Any, 11).unwrap();
        let r10 = b.irecv(on_10.full_span(), Source::Any, 10).unwrap();
        let mut requests = [Some(r11), Some(r10)];
        let done = poll_until_complete(&mut b, &mut requests);

        assert_eq!(done.len(), 2);
        assert_eq!(&on_11.to_vec()[..6], b"second");
        assert_eq!(&on_10.to_vec()[..5], b"first");
        assert_eq!(b.metrics().unexpected_peak, 2);
    }

    #[test]
    fn same_tag_messages_keep_sender_order() {
        let (mut a, mut b) = LocalFabric::pair();
        for value in 0u8..4 {
            a.send(&[value], 1, 3).unwrap();
        }
        let mut seen = Vec::new();
        for _ in 0..4 {
            let region = MemRegion::zeroed(1);
            let id = b.irecv(region.full_span(), Source::Rank(0), 3).unwrap();
            let mut requests = [Some(id)];
            poll_until_complete(&mut b, &mut requests);
            seen.push(region.to_vec()[0]);
        }
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[test]
    fn persistent_receive_rearms_in_place() {
        let (mut a, mut b) = LocalFabric::pair();
        let region = MemRegion::zeroed(4);
        let id = b.recv_init(region.full_span(), Source::Any, 2).unwrap();
        let mut requests = [Some(id)];

        assert!(b.test_some(&mut requests).unwrap().is_empty());
        b.start(id).unwrap();

        for round in 0u8..3 {
            a.send(&[round; 4], 1, 2).unwrap();
            let done = b.test_some(&mut requests).unwrap();
            assert_eq!(done.len(), 1);
            assert_eq!(requests, [Some(id)]);
            assert_eq!(region.to_vec(), vec![round; 4]);

            // Inactive until restarted.
            a.send(&[9; 4], 1, 2).unwrap();
            assert!(b.test_some(&mut requests).unwrap().is_empty());
            b.start(id).unwrap();
            let done = b.test_some(&mut requests).unwrap();
            assert_eq!(done.len(), 1);
            b.start(id).unwrap();
        }
    }

    #[test]
    fn oversized_message_is_truncation_error() {
        let (mut a, mut b) = LocalFabric::pair();
        a.send(&[0; 8], 1, 1).unwrap();
        let region = MemRegion::zeroed(4);
        let err = b.irecv(region.full_span(), Source::Any, 1).unwrap_err();
        assert_eq!(
            err,
            TransportError::Truncated {
                capacity: 4,
                received: 8
            }
        );
        assert_eq!(b.outstanding(), 0);

        let fits = MemRegion::zeroed(8);
        let id = b.irecv(fits.full_span(), Source::Any, 1).unwrap();
        let mut requests = [Some(id)];
        assert_eq!(poll_until_complete(&mut b, &mut requests).len(), 1);
        assert_eq!(b.outstanding(), 0);
    }

    #[test]
    fn oversized_arrival_keeps_receive_posted() {
        let (mut a, mut b) = LocalFabric::pair();
        let small = MemRegion::zeroed(4);
        let id = b.irecv(small.full_span(), Source::Any, 6).unwrap();
        a.send(&[9; 8], 1, 6).unwrap();
        let mut requests = [Some(id)];
        assert!(matches!(
            b.test_some(&mut requests),
            Err(TransportError::Truncated { .. })
        ));

        a.send(&[1, 2], 1, 6).unwrap();
        let done = poll_until_complete(&mut b, &mut requests);
        assert_eq!(done[0].status.len, 2);
        assert_eq!(small.to_vec(), vec![1, 2, 0, 0]);

        let large = MemRegion::zeroed(8);
        let id = b.irecv(large.full_span(), Source::Any, 6).unwrap();
        let mut requests = [Some(id)];
        assert_eq!(poll_until_complete(&mut b, &mut requests).len(), 1);
        assert_eq!(large.to_vec(), vec![9; 8]);
    }

    #[test]
    fn cancel_removes_posted_receive() {
        let (mut a, mut b) = LocalFabric::pair();
        let region = MemRegion::zeroed(4);
        let id = b.irecv(region.full_span(), Source::Any, 5).unwrap();
        b.cancel(id).unwrap();
        assert!(matches!(
            b.cancel(id),
            Err(TransportError::UnknownRequest { .. })
        ));

        a.send(&[1], 1, 5).unwrap();
        let mut requests: [Option<RequestId>; 0] = [];
        b.test_some(&mut requests).unwrap();
        assert_eq!(region.to_vec(), vec![0; 4]);
        assert_eq!(b.outstanding(), 0);
    }

    #[test]
    fn invalid_rank_is_rejected() {
        let (mut a, _b) = LocalFabric::pair();
        assert_eq!(
            a.send(&[0], 5, 0),
            Err(TransportError::InvalidRank { rank: 5, size: 2 })
        );
    }

    #[test]
    fn pack_round_trip_tracks_position() {
        let (a, _b) = LocalFabric::pair();
        let mut buffer = [0u8; 6];
        let mut position = 0;
        a.pack(&[1, 2], &mut buffer, &mut position).unwrap();
        a.pack(&[3, 4, 5], &mut buffer, &mut position).unwrap();
        assert_eq!(position, 5);
        assert!(a.pack(&[6, 7], &mut buffer, &mut position).is_err());

        let mut position = 2;
        let mut out = [0u8; 3];
        a.unpack(&buffer, &mut position, &mut out).unwrap();
        assert_eq!(out, [3, 4, 5]);
        assert_eq!(position, 5);
    }
}
