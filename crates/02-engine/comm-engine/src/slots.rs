//! Request slot table.
//!
//! Requests and their callback records live in two parallel vectors so the
//! active prefix of requests can be handed to the transport as one slice.
//! Layout:
//!
//! ```text
//! [0, static_end)              persistent receives, one block per tag
//! [static_end, active)         transient transfers in flight
//! [active, capacity)           free
//! ```
//!
//! Registering a tag inserts its block at `static_end`, shifting every
//! dynamic entry up. Static blocks are never reclaimed; after unregistration
//! their slots stay empty and only `live_static` shrinks.

use std::iter;

use transport::RequestId;

use crate::callback::CallbackRecord;

/// Contiguous run of static slots owned by one tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct StaticBlock {
    pub(crate) start: usize,
    pub(crate) len: usize,
}

impl StaticBlock {
    pub(crate) fn indices(self) -> std::ops::Range<usize> {
        self.start..self.start + self.len
    }
}

/// Occupancy snapshot of an engine's slot table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SlotStats {
    pub active: usize,
    pub capacity: usize,
    /// Static slots owned by currently registered tags.
    pub static_region_len: usize,
    /// First dynamic index; includes slots of unregistered tags.
    pub static_end: usize,
    pub dynamic_capacity: usize,
    pub overflow: usize,
}

pub(crate) struct SlotTable {
    requests: Vec<Option<RequestId>>,
    records: Vec<Option<CallbackRecord>>,
    static_end: usize,
    live_static: usize,
    active: usize,
}

impl SlotTable {
    pub(crate) fn new(dynamic_capacity: usize) -> Self {
        Self {
            requests: vec![None; dynamic_capacity],
            records: iter::repeat_with(|| None).take(dynamic_capacity).collect(),
            static_end: 0,
            live_static: 0,
            active: 0,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.requests.len()
    }

    pub(crate) fn active(&self) -> usize {
        self.active
    }

    pub(crate) fn static_end(&self) -> usize {
        self.static_end
    }

    pub(crate) fn has_room(&self) -> bool {
        self.active < self.capacity()
    }

    pub(crate) fn dynamic_in_flight(&self) -> usize {
        self.active() - self.static_end
    }

    /// Inserts `len` empty slots at the end of the static region.
    pub(crate) fn reserve_static(&mut self, len: usize) -> StaticBlock {
        let start = self.static_end;
        self.requests
            .splice(start..start, iter::repeat(None).take(len));
        self.records
            .splice(start..start, iter::repeat_with(|| None).take(len));
        self.static_end += len;
        self.live_static += len;
        self.active += len;
        StaticBlock { start, len }
    }

    pub(crate) fn install(&mut self, index: usize, request: RequestId, record: CallbackRecord) {
        self.requests[index] = Some(request);
        self.records[index] = Some(record);
    }

    /// Empties a tag's block and returns the requests that were in it.
    pub(crate) fn release_static(&mut self, block: StaticBlock) -> Vec<RequestId> {
        let mut released = Vec::with_capacity(block.len);
        for index in block.indices() {
            released.extend(self.requests[index].take());
            self.records[index] = None;
        }
        self.live_static -= block.len;
        released
    }

    /// Appends a transient entry; the caller checks [`SlotTable::has_room`].
    pub(crate) fn push_dynamic(&mut self, request: RequestId, record: CallbackRecord) -> usize {
        debug_assert!(self.has_room());
        let index = self.active;
        self.install(index, request, record);
        self.active += 1;
        index
    }

    pub(crate) fn active_requests_mut(&mut self) -> &mut [Option<RequestId>] {
        &mut self.requests[..self.active]
    }

    pub(crate) fn request(&self, index: usize) -> Option<RequestId> {
        self.requests.get(index).copied().flatten()
    }

    pub(crate) fn record(&self, index: usize) -> Option<&CallbackRecord> {
        self.records.get(index)?.as_ref()
    }

    pub(crate) fn take_record(&mut self, index: usize) -> Option<CallbackRecord> {
        self.records.get_mut(index)?.take()
    }

    /// Refills a finished dynamic slot with the last active entry.
    ///
    /// Returns false for static slots and for slots whose request is still
    /// live.
    pub(crate) fn compact(&mut self, index: usize) -> bool {
        if index < self.static_end || index >= self.active || self.requests[index].is_some() {
            return false;
        }
        self.active -= 1;
        let last = self.active;
        if last > index {
            self.requests.swap(index, last);
            self.records.swap(index, last);
        }
        self.requests[last] = None;
        self.records[last] = None;
        true
    }

    /// Empties the dynamic region, returning its requests.
    pub(crate) fn clear_dynamic(&mut self) -> Vec<RequestId> {
        let mut cleared = Vec::with_capacity(self.dynamic_in_flight());
        for index in self.static_end..self.active {
            cleared.extend(self.requests[index].take());
            self.records[index] = None;
        }
        self.active = self.static_end;
        cleared
    }

    pub(crate) fn stats(&self, overflow: usize) -> SlotStats {
        SlotStats {
            active: self.active,
            capacity: self.capacity(),
            static_region_len: self.live_static,
            static_end: self.static_end,
            dynamic_capacity: self.capacity() - self.static_end,
            overflow,
        }
    }
}

#[cfg(test)]
mod tests {
    use transport::MemRegion;

    use super::*;
    use crate::callback::TagHandler;

    fn record(marker: u8) -> CallbackRecord {
        CallbackRecord::MimicActiveMessage {
            handler: None,
            payload: vec![marker],
            peer: 0,
        }
    }

    fn marker(table: &SlotTable, index: usize) -> u8 {
        match table.record(index) {
            Some(CallbackRecord::MimicActiveMessage { payload, .. }) => payload[0],
            _ => panic!("slot {index} holds no transient record"),
        }
    }

    #[test]
    fn static_insert_shifts_dynamic_entries() {
        let mut table = SlotTable::new(4);
        table.push_dynamic(RequestId(10), record(10));
        table.push_dynamic(RequestId(11), record(11));

        let block = table.reserve_static(3);
        assert_eq!(block, StaticBlock { start: 0, len: 3 });
        for index in block.indices() {
            table.install(
                index,
                RequestId(index as u64),
                CallbackRecord::ActiveMessage {
                    tag: 2,
                    handler: TagHandler::PutHandshake,
                    buffer: MemRegion::zeroed(1).full_span(),
                },
            );
        }

        assert_eq!(table.capacity(), 7);
        assert_eq!(table.active(), 5);
        assert_eq!(table.request(3), Some(RequestId(10)));
        assert_eq!(table.request(4), Some(RequestId(11)));
        assert_eq!(marker(&table, 3), 10);
        assert_eq!(marker(&table, 4), 11);
    }

    #[test]
    fn compaction_moves_last_entry_into_hole() {
        let mut table = SlotTable::new(4);
        for id in 0..4 {
            table.push_dynamic(RequestId(id), record(id as u8));
        }
        assert!(!table.has_room());

        // Slot 1 finished: the transport cleared its request.
        table.active_requests_mut()[1] = None;
        table.take_record(1);
        assert!(table.compact(1));

        assert_eq!(table.active(), 3);
        assert_eq!(table.request(1), Some(RequestId(3)));
        assert_eq!(marker(&table, 1), 3);
        assert_eq!(table.request(3), None);
        assert!(table.record(3).is_none());

        // Still-live requests are left alone.
        assert!(!table.compact(0));
        assert_eq!(table.active(), 3);
    }

    #[test]
    fn released_block_stays_in_capacity() {
        let mut table = SlotTable::new(2);
        let block = table.reserve_static(2);
        table.install(0, RequestId(0), record(0));
        table.install(1, RequestId(1), record(1));

        let released = table.release_static(block);
        assert_eq!(released, vec![RequestId(0), RequestId(1)]);
        let stats = table.stats(0);
        assert_eq!(stats.static_region_len, 0);
        assert_eq!(stats.static_end, 2);
        assert_eq!(stats.capacity, 4);
        assert_eq!(stats.active, 2);
        assert!(!table.compact(0));
    }

    #[test]
    fn clear_dynamic_returns_in_flight_requests() {
        let mut table = SlotTable::new(3);
        table.reserve_static(1);
        table.push_dynamic(RequestId(7), record(7));
        table.push_dynamic(RequestId(8), record(8));
        assert_eq!(table.dynamic_in_flight(), 2);
        assert_eq!(table.clear_dynamic(), vec![RequestId(7), RequestId(8)]);
        assert_eq!(table.active(), 1);
    }
}
