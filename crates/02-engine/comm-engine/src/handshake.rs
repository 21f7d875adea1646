//! Rendezvous handshake message.
//!
//! ```text
//! 0        4        8                16               24               32
//! | tag    | pad    | initiator token | target token   | completion     | payload...
//! ```
//!
//! All fields little-endian.

use transport::Tag;

use crate::callback::CompletionToken;
use crate::error::{EngineError, EngineResult};
use crate::mem::HandleToken;

pub(crate) const HEADER_LEN: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct HandshakeHeader {
    /// Ephemeral tag of the bulk transfer.
    pub(crate) tag: Tag,
    pub(crate) initiator: HandleToken,
    pub(crate) target: HandleToken,
    pub(crate) completion: CompletionToken,
}

impl HandshakeHeader {
    pub(crate) fn encode_with(&self, payload: &[u8]) -> Vec<u8> {
        let mut message = Vec::with_capacity(HEADER_LEN + payload.len());
        message.extend_from_slice(&self.tag.to_le_bytes());
        message.extend_from_slice(&[0u8; 4]);
        message.extend_from_slice(&self.initiator.0.to_le_bytes());
        message.extend_from_slice(&self.target.0.to_le_bytes());
        message.extend_from_slice(&self.completion.0.to_le_bytes());
        message.extend_from_slice(payload);
        message
    }

    /// Splits a received handshake into header and forwarded payload.
    pub(crate) fn decode(message: &[u8]) -> EngineResult<(Self, &[u8])> {
        if message.len() < HEADER_LEN {
            return Err(EngineError::protocol(format!(
                "handshake of {} bytes is shorter than its {HEADER_LEN} byte header",
                message.len()
            )));
        }
        let u64_at = |at: usize| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&message[at..at + 8]);
            u64::from_le_bytes(buf)
        };
        let mut tag = [0u8; 4];
        tag.copy_from_slice(&message[0..4]);
        let header = Self {
            tag: Tag::from_le_bytes(tag),
            initiator: HandleToken(u64_at(8)),
            target: HandleToken(u64_at(16)),
            completion: CompletionToken(u64_at(24)),
        };
        Ok((header, &message[HEADER_LEN..]))
    }
}
