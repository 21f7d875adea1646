use serde::Deserialize;

use crate::error::{EngineError, EngineResult};

/// Sizing knobs for an [`Engine`](crate::Engine).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Slots available to transient transfers.
    pub dynamic_slots: usize,
    /// Persistent receives posted per registered tag.
    pub slots_per_tag: usize,
    /// Message limit of the two internal handshake tags.
    pub internal_message_len: usize,
    /// Width of the user tag range.
    pub user_tag_count: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dynamic_slots: 20,
            slots_per_tag: 5,
            internal_message_len: 4096,
            user_tag_count: 10,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if self.dynamic_slots == 0 {
            return Err(EngineError::InvalidConfig("dynamic_slots must be non-zero"));
        }
        if self.slots_per_tag == 0 {
            return Err(EngineError::InvalidConfig("slots_per_tag must be non-zero"));
        }
        if self.internal_message_len < crate::handshake::HEADER_LEN {
            return Err(EngineError::InvalidConfig(
                "internal_message_len cannot hold a handshake header",
            ));
        }
        Ok(())
    }
}
