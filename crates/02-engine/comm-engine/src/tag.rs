//! Tag namespace and the registry of persistent-receive tags.
//!
//! Tags `0` and `1` carry get and put handshakes. User tags follow in a fixed
//! block, and everything above it up to the transport's bound is handed out
//! as ephemeral tags for individual transfers.

use std::collections::BTreeMap;
use std::ops::Range;

use transport::{MemRegion, Tag};

use crate::error::{EngineError, EngineResult};
use crate::slots::StaticBlock;

pub const GET_TAG: Tag = 0;
pub const PUT_TAG: Tag = 1;
pub const FIRST_USER_TAG: Tag = 2;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TagLayout {
    pub user: Range<Tag>,
    pub ephemeral_first: Tag,
    pub ephemeral_last: Tag,
}

impl TagLayout {
    pub fn new(user_tag_count: u32, upper_bound: Tag) -> EngineResult<Self> {
        let user_end = FIRST_USER_TAG
            .checked_add(user_tag_count)
            .ok_or(EngineError::InvalidConfig("user tag range overflows"))?;
        if upper_bound < user_end {
            return Err(EngineError::InvalidConfig(
                "tag upper bound leaves no ephemeral tags",
            ));
        }
        Ok(Self {
            user: FIRST_USER_TAG..user_end,
            ephemeral_first: user_end,
            ephemeral_last: upper_bound,
        })
    }
}

/// Wrapping counter over the ephemeral range. Collisions are not detected.
#[derive(Debug)]
pub(crate) struct EphemeralTags {
    next: Tag,
    first: Tag,
    last: Tag,
}

impl EphemeralTags {
    pub(crate) fn new(layout: &TagLayout) -> Self {
        Self {
            next: layout.ephemeral_first,
            first: layout.ephemeral_first,
            last: layout.ephemeral_last,
        }
    }

    pub(crate) fn next(&mut self) -> Tag {
        let tag = self.next;
        self.next = if tag >= self.last { self.first } else { tag + 1 };
        tag
    }
}

pub(crate) struct TagRegistration {
    pub(crate) max_len: usize,
    pub(crate) block: StaticBlock,
    pub(crate) ring: MemRegion,
}

pub(crate) struct TagRegistry {
    layout: TagLayout,
    entries: BTreeMap<Tag, TagRegistration>,
}

impl TagRegistry {
    pub(crate) fn new(layout: TagLayout) -> Self {
        Self {
            layout,
            entries: BTreeMap::new(),
        }
    }

    pub(crate) fn layout(&self) -> &TagLayout {
        &self.layout
    }

    /// User-range checks apply once both handshake tags are in place.
    pub(crate) fn check_available(&self, tag: Tag) -> EngineResult<()> {
        let internal_ready =
            self.entries.contains_key(&GET_TAG) && self.entries.contains_key(&PUT_TAG);
        if internal_ready && !self.layout.user.contains(&tag) {
            return Err(EngineError::TagOutOfRange {
                tag,
                start: self.layout.user.start,
                end: self.layout.user.end,
            });
        }
        if self.entries.contains_key(&tag) {
            return Err(EngineError::TagAlreadyRegistered(tag));
        }
        Ok(())
    }

    pub(crate) fn insert(&mut self, tag: Tag, registration: TagRegistration) {
        self.entries.insert(tag, registration);
    }

    pub(crate) fn remove(&mut self, tag: Tag) -> EngineResult<TagRegistration> {
        self.entries.remove(&tag).ok_or(EngineError::UnknownTag(tag))
    }

    pub(crate) fn get(&self, tag: Tag) -> Option<&TagRegistration> {
        self.entries.get(&tag)
    }

    pub(crate) fn tags(&self) -> Vec<Tag> {
        self.entries.keys().copied().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
