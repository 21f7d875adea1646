//! Put/get rendezvous.
//!
//! The initiator picks an ephemeral tag, ships it to the target in a
//! handshake on the internal put or get tag, and immediately posts its half
//! of the bulk transfer on that tag. The target posts the matching half when
//! its progress loop delivers the handshake. Each side completes on its own.

use tracing::trace;
use transport::{Rank, Source};

use crate::callback::{
    ActiveMessage, CallbackRecord, CompletionToken, LocalCompletion, OneSidedCompletion,
};
use crate::error::{EngineError, EngineResult};
use crate::handshake::{HandshakeHeader, HEADER_LEN};
use crate::hooks::{CommEvent, TransferKind};
use crate::mem::MemHandle;
use crate::overflow::Pending;
use crate::tag::{GET_TAG, PUT_TAG};
use crate::Engine;

/// Parameters of a put or get.
///
/// The initiator moves `local_displ..local_displ + size` of its region. The
/// target always uses the whole registered extent of `remote`, so a put needs
/// `size` no larger than that extent and a get needs `size` at least as
/// large.
#[derive(Clone, Copy, Debug)]
pub struct Transfer<'a> {
    pub local: MemHandle,
    pub local_displ: usize,
    pub remote: MemHandle,
    pub remote_displ: usize,
    pub size: usize,
    pub peer: Rank,
    /// Handler the target runs on its completion, if any.
    pub remote_completion: CompletionToken,
    /// Bytes handed to the target's completion handler.
    pub remote_payload: &'a [u8],
}

impl TransferKind {
    fn handshake_tag(self) -> transport::Tag {
        match self {
            TransferKind::Put => PUT_TAG,
            TransferKind::Get => GET_TAG,
        }
    }
}

impl Engine {
    /// Writes local bytes into the peer's registered region.
    pub fn put(
        &mut self,
        transfer: Transfer<'_>,
        on_local: impl FnOnce(&mut Engine, OneSidedCompletion) + Send + 'static,
    ) -> EngineResult<()> {
        self.start_transfer(TransferKind::Put, transfer, Box::new(on_local))
    }

    /// Reads the peer's registered region into local memory.
    pub fn get(
        &mut self,
        transfer: Transfer<'_>,
        on_local: impl FnOnce(&mut Engine, OneSidedCompletion) + Send + 'static,
    ) -> EngineResult<()> {
        self.start_transfer(TransferKind::Get, transfer, Box::new(on_local))
    }

    fn start_transfer(
        &mut self,
        kind: TransferKind,
        transfer: Transfer<'_>,
        callback: LocalCompletion,
    ) -> EngineResult<()> {
        let span = self
            .handles
            .get(transfer.local.token)
            .ok_or(EngineError::UnknownHandle(transfer.local.token.0))?
            .span(transfer.local_displ, transfer.size)?;

        let handshake_tag = kind.handshake_tag();
        self.check_message_len(handshake_tag, HEADER_LEN + transfer.remote_payload.len())?;

        let tag = self.ephemeral.next();
        let handshake = HandshakeHeader {
            tag,
            initiator: transfer.local.token,
            target: transfer.remote.token,
            completion: transfer.remote_completion,
        }
        .encode_with(transfer.remote_payload);
        self.send_active_message(handshake_tag, transfer.peer, &handshake)?;
        self.stats.handshakes_sent += 1;

        let (peer, size) = (transfer.peer, transfer.size);
        trace!(?kind, peer, tag, size, "handshake emitted");
        self.hooks.emit(match kind {
            TransferKind::Put => CommEvent::PutStarted { peer, tag, size },
            TransferKind::Get => CommEvent::GetStarted { peer, tag, size },
        });

        let pending = match kind {
            TransferKind::Put => Pending::DeferredSend {
                data: span,
                dest: peer,
                tag,
            },
            TransferKind::Get => {
                Pending::Posted(self.transport.irecv(span, Source::Rank(peer), tag)?)
            }
        };
        let record = CallbackRecord::OneSided {
            callback,
            completion: OneSidedCompletion {
                local: transfer.local,
                local_displ: transfer.local_displ,
                remote: transfer.remote,
                remote_displ: transfer.remote_displ,
                size,
                peer,
            },
        };
        self.submit(pending, record)
    }

    /// Target half: runs when a handshake arrives on an internal tag.
    pub(crate) fn accept_handshake(
        &mut self,
        kind: TransferKind,
        message: ActiveMessage<'_>,
    ) -> EngineResult<()> {
        let (header, payload) = HandshakeHeader::decode(message.payload)?;
        let peer = message.source;
        self.stats.handshakes_received += 1;
        trace!(?kind, peer, tag = header.tag, "handshake received");

        let span = self
            .handles
            .get(header.target)
            .ok_or_else(|| {
                EngineError::protocol(format!(
                    "{kind:?} from rank {peer} names unknown handle {:#x}",
                    header.target.0
                ))
            })?
            .extent_span()?;
        let handler = if header.completion.is_none() {
            None
        } else {
            Some(self.completions.get(header.completion).ok_or_else(|| {
                EngineError::protocol(format!(
                    "{kind:?} from rank {peer} names unknown completion {}",
                    header.completion.0
                ))
            })?)
        };
        self.hooks.emit(CommEvent::HandshakeReceived {
            peer,
            tag: header.tag,
            kind,
        });

        let pending = match kind {
            TransferKind::Put => {
                Pending::Posted(self.transport.irecv(span, Source::Rank(peer), header.tag)?)
            }
            TransferKind::Get => Pending::DeferredSend {
                data: span,
                dest: peer,
                tag: header.tag,
            },
        };
        let record = CallbackRecord::MimicActiveMessage {
            handler,
            payload: payload.to_vec(),
            peer,
        };
        self.submit(pending, record)
    }
}
