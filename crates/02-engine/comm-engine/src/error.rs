use thiserror::Error;

use transport::{Tag, TransportError};

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("tag {tag} is outside the user range {start}..{end}")]
    TagOutOfRange { tag: Tag, start: Tag, end: Tag },

    #[error("tag {0} is already registered")]
    TagAlreadyRegistered(Tag),

    #[error("tag {0} is not registered")]
    UnknownTag(Tag),

    #[error("memory handle {0:#x} is not registered on this engine")]
    UnknownHandle(u64),

    #[error("message of {len} bytes exceeds the {max} byte limit of tag {tag}")]
    MessageTooLarge { tag: Tag, len: usize, max: usize },

    #[error("invalid engine configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("operation not permitted while progress is running")]
    Reentrant,

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
}

impl EngineError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        EngineError::ProtocolViolation(msg.into())
    }
}
