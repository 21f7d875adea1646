use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use comm_engine::{
    CompletionToken, Engine, EngineConfig, EngineResult, MemHandle, ServiceEngine, Transfer,
    FIRST_USER_TAG,
};
use parking_lot::Mutex;
use tracing::{debug, warn};
use transport::{Datatype, MemRegion, Rank, Tag, Transport};

use crate::config::ScenarioKind;
use crate::stats::StatsSink;
use crate::{expected_payload, wrapping_add};

/// User tag carrying encoded memory handles between partners.
pub const HANDLE_TAG: Tag = FIRST_USER_TAG;

/// Counters written from engine callbacks.
#[derive(Default)]
struct Tally {
    peer_handle: Mutex<Option<MemHandle>>,
    arrivals: AtomicU32,
    local_done: AtomicU32,
}

/// One rank's side of a scenario, driven by polling.
pub struct RankScenario<S> {
    engine: Engine,
    stats: S,
    kind: ScenarioKind,
    partner: Option<Rank>,
    tally: Arc<Tally>,
    arrival: CompletionToken,
    outbound: MemHandle,
    inbound: MemRegion,
    issued: u32,
    finished: bool,
}

impl<S> RankScenario<S>
where
    S: StatsSink,
{
    /// Sets up the engine and ships this rank's landing handle to its partner.
    pub fn new(
        transport: impl Transport + 'static,
        config: EngineConfig,
        kind: ScenarioKind,
        stats: S,
    ) -> EngineResult<Self> {
        let mut engine = Engine::init(transport, config)?;
        let rank = engine.rank();
        let partner = Some(rank ^ 1).filter(|peer| *peer < engine.size());
        let tally = Arc::new(Tally::default());

        let sink = Arc::clone(&tally);
        engine.tag_register(HANDLE_TAG, MemHandle::WIRE_LEN, move |_, msg| {
            match MemHandle::decode(msg.payload) {
                Some(handle) => *sink.peer_handle.lock() = Some(handle),
                None => warn!(source = msg.source, "undecodable memory handle"),
            }
        })?;
        let sink = Arc::clone(&tally);
        let arrival = engine.register_completion(move |_, _| {
            sink.arrivals.fetch_add(1, Ordering::Relaxed);
        });

        let bytes = kind.bytes();
        let (outbound, _) = engine.mem_register(
            MemRegion::from_vec(expected_payload(rank, bytes)),
            Datatype::Byte,
            bytes,
        );
        let inbound = MemRegion::zeroed(bytes);
        let (landing, _) = engine.mem_register(inbound.clone(), Datatype::Byte, bytes);
        if let Some(peer) = partner {
            engine.send_active_message(HANDLE_TAG, peer, &landing.encode())?;
        }
        debug!(rank, ?partner, scenario = kind.name(), "scenario rank ready");

        Ok(Self {
            engine,
            stats,
            kind,
            partner,
            tally,
            arrival,
            outbound,
            inbound,
            issued: 0,
            finished: false,
        })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Hands the engine back, e.g. to synchronise and shut down.
    pub fn into_engine(self) -> Engine {
        self.engine
    }

    fn initiates(&self) -> bool {
        self.engine.rank() % 2 == 0
    }

    fn issue_put(&mut self, peer: Rank, remote: MemHandle) -> EngineResult<()> {
        if !self.engine.can_accept_more() {
            self.stats
                .with_stats(|s| s.overflow_waits = wrapping_add(s.overflow_waits, 1));
        }
        let tally = Arc::clone(&self.tally);
        let bytes = self.kind.bytes();
        self.engine.put(
            Transfer {
                local: self.outbound,
                local_displ: 0,
                remote,
                remote_displ: 0,
                size: bytes,
                peer,
                remote_completion: self.arrival,
                remote_payload: &[],
            },
            move |_, _| {
                tally.local_done.fetch_add(1, Ordering::Relaxed);
            },
        )?;
        self.issued += 1;
        self.stats.with_stats(|s| {
            s.puts_issued = wrapping_add(s.puts_issued, 1);
            s.bytes_sent += bytes as u64;
        });
        Ok(())
    }

    fn step(&mut self) -> EngineResult<usize> {
        let Some(peer) = self.partner else {
            self.finish(false);
            return Ok(0);
        };
        let Some(remote) = *self.tally.peer_handle.lock() else {
            return Ok(0);
        };
        let arrivals = self.tally.arrivals.load(Ordering::Relaxed);
        let local_done = self.tally.local_done.load(Ordering::Relaxed);
        let initiates = self.initiates();
        let mut work = 0;

        match self.kind {
            ScenarioKind::PingPong { rounds, .. } => {
                let due = if initiates {
                    self.issued < rounds && self.issued == arrivals
                } else {
                    self.issued < arrivals
                };
                if due {
                    self.issue_put(peer, remote)?;
                    work += 1;
                }
                if self.issued == rounds && local_done == rounds && arrivals == rounds {
                    self.finish(true);
                }
            }
            ScenarioKind::Burst { transfers, .. } => {
                if initiates {
                    while self.issued < transfers {
                        self.issue_put(peer, remote)?;
                        work += 1;
                    }
                    if local_done == transfers {
                        self.finish(false);
                    }
                } else if arrivals == transfers {
                    self.finish(true);
                }
            }
        }
        Ok(work)
    }

    fn finish(&mut self, check_inbound: bool) {
        if self.finished {
            return;
        }
        self.finished = true;
        let corrupt = match (check_inbound, self.partner) {
            (true, Some(peer)) => {
                let expected = expected_payload(peer, self.kind.bytes());
                u32::from(self.inbound.to_vec() != expected)
            }
            _ => 0,
        };
        debug!(rank = self.engine.rank(), issued = self.issued, corrupt, "scenario finished");
        self.stats.with_stats(|s| {
            s.corrupt_payloads += corrupt;
            s.finished = true;
        });
    }
}

impl<S> ServiceEngine for RankScenario<S>
where
    S: StatsSink,
{
    fn poll(&mut self) -> EngineResult<usize> {
        let mut work = self.engine.progress()?;
        if !self.finished {
            work += self.step()?;
        }
        let arrivals = self.tally.arrivals.load(Ordering::Relaxed);
        let local_done = self.tally.local_done.load(Ordering::Relaxed);
        self.stats.with_stats(|s| {
            s.remote_completions = arrivals;
            s.local_completions = local_done;
        });
        Ok(work)
    }

    fn name(&self) -> &'static str {
        self.kind.name()
    }

    fn is_finished(&self) -> bool {
        self.finished
    }
}
