//! Error handling helpers for the transport crate.
//!
//! The transport layer keeps its error surface small: bad request ids, bad
//! ranks, buffer range violations, and truncated receives. None of these are
//! retried; callers propagate them upward.

use std::fmt;

use crate::{Rank, RequestId};

/// Convenience result alias for fallible transport operations.
pub type TransportResult<T, E = TransportError> = Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq)]
/// Errors surfaced by transport endpoints and buffer helpers.
pub enum TransportError {
    /// The request id was never issued by this endpoint or was already freed.
    UnknownRequest { request: RequestId },
    /// Destination or source rank lies outside the fabric.
    InvalidRank { rank: Rank, size: usize },
    /// A byte range does not fit inside its backing region.
    OutOfBounds {
        offset: usize,
        len: usize,
        region_len: usize,
    },
    /// An incoming message is larger than the posted receive buffer.
    Truncated { capacity: usize, received: usize },
    /// The peer endpoint has been dropped.
    Disconnected { rank: Rank },
    /// Packing ran past the end of the output buffer.
    PackOverflow { needed: usize, available: usize },
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::UnknownRequest { request } => {
                write!(f, "unknown or freed request {}", request.0)
            }
            TransportError::InvalidRank { rank, size } => {
                write!(f, "rank {rank} is outside a fabric of {size} ranks")
            }
            TransportError::OutOfBounds {
                offset,
                len,
                region_len,
            } => {
                write!(
                    f,
                    "range {offset}..{} exceeds region of {region_len} bytes",
                    offset + len
                )
            }
            TransportError::Truncated { capacity, received } => {
                write!(
                    f,
                    "message of {received} bytes truncated by receive buffer of {capacity} bytes"
                )
            }
            TransportError::Disconnected { rank } => write!(f, "rank {rank} disconnected"),
            TransportError::PackOverflow { needed, available } => {
                write!(
                    f,
                    "packing needs {needed} bytes but only {available} remain"
                )
            }
        }
    }
}

impl std::error::Error for TransportError {}
