//! Callback signatures and the per-slot callback records.

use std::sync::Arc;

use transport::{Rank, Span, Tag};

use crate::mem::MemHandle;
use crate::Engine;

/// A message delivered on a registered tag.
#[derive(Clone, Copy, Debug)]
pub struct ActiveMessage<'a> {
    pub tag: Tag,
    pub source: Rank,
    pub payload: &'a [u8],
}

/// Passed to the initiator once its side of a put or get has completed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OneSidedCompletion {
    pub local: MemHandle,
    pub local_displ: usize,
    pub remote: MemHandle,
    pub remote_displ: usize,
    pub size: usize,
    pub peer: Rank,
}

/// Passed to the target once its side of a put or get has completed.
#[derive(Clone, Copy, Debug)]
pub struct RemoteCompletion<'a> {
    /// Ephemeral tag the transfer ran on.
    pub tag: Tag,
    pub peer: Rank,
    /// Bytes received (put) or sent (get) by the target.
    pub bytes: usize,
    /// Payload forwarded by the initiator with the handshake.
    pub payload: &'a [u8],
}

pub type AmHandler = Arc<dyn Fn(&mut Engine, ActiveMessage<'_>) + Send + Sync>;
pub type LocalCompletion = Box<dyn FnOnce(&mut Engine, OneSidedCompletion) + Send>;
pub type RemoteHandler = Arc<dyn Fn(&mut Engine, RemoteCompletion<'_>) + Send + Sync>;

/// Names a remote-completion handler registered on the target engine.
///
/// Tokens are handed out sequentially from 1, so engines that register their
/// handlers in the same order agree on every token.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CompletionToken(pub u64);

impl CompletionToken {
    /// No notification on the target side.
    pub const NONE: CompletionToken = CompletionToken(0);

    pub fn is_none(self) -> bool {
        self == Self::NONE
    }
}

#[derive(Default)]
pub(crate) struct CompletionRegistry {
    handlers: Vec<RemoteHandler>,
}

impl CompletionRegistry {
    pub(crate) fn register(&mut self, handler: RemoteHandler) -> CompletionToken {
        self.handlers.push(handler);
        CompletionToken(self.handlers.len() as u64)
    }

    pub(crate) fn get(&self, token: CompletionToken) -> Option<RemoteHandler> {
        let index = usize::try_from(token.0).ok()?.checked_sub(1)?;
        self.handlers.get(index).cloned()
    }
}

/// Who handles messages on a tag.
#[derive(Clone)]
pub(crate) enum TagHandler {
    PutHandshake,
    GetHandshake,
    User(AmHandler),
}

/// What to run when the request in a slot completes.
pub(crate) enum CallbackRecord {
    /// Persistent receive on a registered tag; `buffer` is its ring entry.
    ActiveMessage {
        tag: Tag,
        handler: TagHandler,
        buffer: Span,
    },
    /// Initiator side of a put or get.
    OneSided {
        callback: LocalCompletion,
        completion: OneSidedCompletion,
    },
    /// Target side of a put or get, reported like an active message.
    MimicActiveMessage {
        handler: Option<RemoteHandler>,
        payload: Vec<u8>,
        peer: Rank,
    },
}
