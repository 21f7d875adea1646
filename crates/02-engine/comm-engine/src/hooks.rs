use transport::{Rank, Tag};

/// Which half of the rendezvous a handshake starts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferKind {
    Put,
    Get,
}

/// Fixed instrumentation points of the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommEvent {
    PutStarted { peer: Rank, tag: Tag, size: usize },
    GetStarted { peer: Rank, tag: Tag, size: usize },
    HandshakeReceived { peer: Rank, tag: Tag, kind: TransferKind },
    Overflowed { queued: usize },
    Drained { count: usize },
    LocalCompletion { peer: Rank, size: usize },
    RemoteCompletion { peer: Rank, tag: Tag, bytes: usize },
}

pub type Hook = Box<dyn FnMut(&CommEvent) + Send>;

/// Side-effecting observers invoked in registration order.
#[derive(Default)]
pub struct Hooks {
    hooks: Vec<Hook>,
}

impl Hooks {
    pub fn add(&mut self, hook: impl FnMut(&CommEvent) + Send + 'static) {
        self.hooks.push(Box::new(hook));
    }

    pub fn emit(&mut self, event: CommEvent) {
        for hook in self.hooks.iter_mut() {
            hook(&event);
        }
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

/// Running counters of one engine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub callbacks_fired: u64,
    pub active_messages_sent: u64,
    pub handshakes_sent: u64,
    pub handshakes_received: u64,
    pub overflowed: u64,
    pub drained: u64,
}
