use std::collections::VecDeque;

use transport::{Rank, RequestId, Span, Tag};

use crate::callback::CallbackRecord;

/// Transport side of a transient operation.
pub(crate) enum Pending {
    /// Already issued; only waiting for a slot.
    Posted(RequestId),
    /// Send not issued yet; `data` is read when it gets a slot.
    DeferredSend { data: Span, dest: Rank, tag: Tag },
}

pub(crate) struct OverflowEntry {
    pub(crate) pending: Pending,
    pub(crate) record: CallbackRecord,
}

/// FIFO of operations that found the dynamic region full.
#[derive(Default)]
pub(crate) struct OverflowQueue {
    entries: VecDeque<OverflowEntry>,
}

impl OverflowQueue {
    pub(crate) fn push(&mut self, pending: Pending, record: CallbackRecord) {
        self.entries.push_back(OverflowEntry { pending, record });
    }

    pub(crate) fn pop(&mut self) -> Option<OverflowEntry> {
        self.entries.pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn drain(&mut self) -> impl Iterator<Item = OverflowEntry> + '_ {
        self.entries.drain(..)
    }
}
