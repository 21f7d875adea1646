use std::sync::Arc;

use tracing::{debug, trace, warn};
use transport::{
    Completion, Datatype, MemRegion, Rank, RequestId, Source, Span, Tag, Transport,
};

use crate::callback::{
    ActiveMessage, CallbackRecord, CompletionRegistry, CompletionToken, RemoteCompletion,
    TagHandler,
};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::hooks::{CommEvent, EngineStats, Hooks, TransferKind};
use crate::mem::{HandlePool, MemHandle, MemRegistration};
use crate::overflow::{OverflowQueue, Pending};
use crate::runtime::ServiceEngine;
use crate::slots::{SlotStats, SlotTable};
use crate::tag::{EphemeralTags, TagLayout, TagRegistration, TagRegistry, GET_TAG, PUT_TAG};

/// Communication engine funnelling active messages and one-sided transfers
/// through one transport endpoint.
///
/// Single-threaded: every operation takes `&mut self`, and callbacks receive
/// the engine back so they can issue further operations.
pub struct Engine {
    pub(crate) transport: Box<dyn Transport>,
    pub(crate) config: EngineConfig,
    pub(crate) handles: HandlePool,
    pub(crate) tags: TagRegistry,
    pub(crate) ephemeral: EphemeralTags,
    pub(crate) slots: SlotTable,
    pub(crate) overflow: OverflowQueue,
    pub(crate) completions: CompletionRegistry,
    pub(crate) hooks: Hooks,
    pub(crate) stats: EngineStats,
    progressing: bool,
}

impl Engine {
    /// Builds an engine over `transport` and registers the handshake tags.
    pub fn init(transport: impl Transport + 'static, config: EngineConfig) -> EngineResult<Self> {
        config.validate()?;
        let upper_bound = match transport.tag_upper_bound() {
            Some(bound) => bound,
            None => {
                warn!(
                    rank = transport.rank(),
                    "transport does not advertise a tag upper bound, assuming {}",
                    i32::MAX
                );
                i32::MAX as Tag
            }
        };
        let layout = TagLayout::new(config.user_tag_count, upper_bound)?;

        let mut engine = Self {
            transport: Box::new(transport),
            config,
            handles: HandlePool::default(),
            ephemeral: EphemeralTags::new(&layout),
            tags: TagRegistry::new(layout),
            slots: SlotTable::new(config.dynamic_slots),
            overflow: OverflowQueue::default(),
            completions: CompletionRegistry::default(),
            hooks: Hooks::default(),
            stats: EngineStats::default(),
            progressing: false,
        };
        let internal_len = config.internal_message_len;
        engine.install_tag(GET_TAG, internal_len, TagHandler::GetHandshake)?;
        engine.install_tag(PUT_TAG, internal_len, TagHandler::PutHandshake)?;

        debug!(
            rank = engine.rank(),
            size = engine.size(),
            layout = ?engine.tags.layout(),
            "communication engine initialised"
        );
        Ok(engine)
    }

    /// Releases every tag and cancels whatever is still in flight.
    pub fn shutdown(mut self) -> EngineResult<()> {
        let in_flight = self.slots.dynamic_in_flight() + self.overflow.len();
        if in_flight > 0 {
            warn!(
                rank = self.rank(),
                in_flight, "shutting down with transfers still in flight"
            );
        }
        for tag in self.tags.tags() {
            self.tag_unregister(tag)?;
        }
        for request in self.slots.clear_dynamic() {
            self.transport.cancel(request)?;
        }
        let queued: Vec<_> = self.overflow.drain().collect();
        for entry in queued {
            if let Pending::Posted(request) = entry.pending {
                self.transport.cancel(request)?;
            }
        }
        debug!(
            rank = self.rank(),
            live_handles = self.handles.live(),
            "communication engine shut down"
        );
        Ok(())
    }

    pub fn rank(&self) -> Rank {
        self.transport.rank()
    }

    pub fn size(&self) -> usize {
        self.transport.size()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn tag_layout(&self) -> &TagLayout {
        self.tags.layout()
    }

    pub fn is_registered(&self, tag: Tag) -> bool {
        self.tags.get(tag).is_some()
    }

    /// Registered tags, the two handshake tags included.
    pub fn registered_tag_count(&self) -> usize {
        self.tags.len()
    }

    /// Registers `handler` for messages of up to `max_len` bytes on `tag`.
    pub fn tag_register(
        &mut self,
        tag: Tag,
        max_len: usize,
        handler: impl Fn(&mut Engine, ActiveMessage<'_>) + Send + Sync + 'static,
    ) -> EngineResult<()> {
        if self.progressing {
            return Err(EngineError::Reentrant);
        }
        self.tags.check_available(tag)?;
        self.install_tag(tag, max_len, TagHandler::User(Arc::new(handler)))
    }

    fn install_tag(&mut self, tag: Tag, max_len: usize, handler: TagHandler) -> EngineResult<()> {
        let per_tag = self.config.slots_per_tag;
        let ring = MemRegion::zeroed(per_tag * max_len);
        let mut receives = Vec::with_capacity(per_tag);
        if let Err(err) = self.open_receives(tag, &ring, max_len, &mut receives) {
            for (request, _) in receives {
                if let Err(cancel) = self.transport.cancel(request) {
                    warn!(tag, ?request, %cancel, "failed to cancel receive after aborted registration");
                }
            }
            return Err(err);
        }

        let block = self.slots.reserve_static(per_tag);
        for ((request, buffer), index) in receives.into_iter().zip(block.indices()) {
            self.slots.install(
                index,
                request,
                CallbackRecord::ActiveMessage {
                    tag,
                    handler: handler.clone(),
                    buffer,
                },
            );
        }
        self.tags.insert(
            tag,
            TagRegistration {
                max_len,
                block,
                ring,
            },
        );
        debug!(tag, max_len, start = block.start, "tag registered");
        Ok(())
    }

    /// Starts one persistent receive per slot of `ring`. Requests created so
    /// far are left in `receives`, including on error.
    fn open_receives(
        &mut self,
        tag: Tag,
        ring: &MemRegion,
        max_len: usize,
        receives: &mut Vec<(RequestId, Span)>,
    ) -> EngineResult<()> {
        for slot in 0..self.config.slots_per_tag {
            let buffer = ring.span(slot * max_len, max_len)?;
            let request = self
                .transport
                .recv_init(buffer.clone(), Source::Any, tag)?;
            receives.push((request, buffer));
            self.transport.start(request)?;
        }
        Ok(())
    }

    /// Cancels the tag's persistent receives and frees its buffers.
    ///
    /// The tag's static slots are not reclaimed.
    pub fn tag_unregister(&mut self, tag: Tag) -> EngineResult<()> {
        let registration = self.tags.remove(tag)?;
        for request in self.slots.release_static(registration.block) {
            self.transport.cancel(request)?;
        }
        debug!(
            tag,
            ring_bytes = registration.ring.len(),
            "tag unregistered"
        );
        Ok(())
    }

    /// Registers `count` elements of `datatype` at the start of `region`.
    ///
    /// Returns the handle and its encoded size.
    pub fn mem_register(
        &mut self,
        region: MemRegion,
        datatype: Datatype,
        count: usize,
    ) -> (MemHandle, usize) {
        let handle = self.handles.register(MemRegistration {
            region,
            datatype,
            count,
        });
        (handle, MemHandle::WIRE_LEN)
    }

    pub fn mem_unregister(&mut self, handle: MemHandle) -> EngineResult<()> {
        self.handles
            .unregister(handle.token)
            .map(drop)
            .ok_or(EngineError::UnknownHandle(handle.token.0))
    }

    /// Looks up a handle registered on this engine.
    pub fn mem_retrieve(&self, handle: &MemHandle) -> Option<&MemRegistration> {
        self.handles.get(handle.token)
    }

    pub fn handle_size(&self) -> usize {
        MemHandle::WIRE_LEN
    }

    /// Registers a handler that peers can name in put/get requests.
    pub fn register_completion(
        &mut self,
        handler: impl Fn(&mut Engine, RemoteCompletion<'_>) + Send + Sync + 'static,
    ) -> CompletionToken {
        self.completions.register(Arc::new(handler))
    }

    /// Sends `payload` to `peer` on `tag`, blocking until the transport owns
    /// it. The tag must be registered locally.
    pub fn send_active_message(&mut self, tag: Tag, peer: Rank, payload: &[u8]) -> EngineResult<()> {
        self.check_message_len(tag, payload.len())?;
        self.transport.send(payload, peer, tag)?;
        self.stats.active_messages_sent += 1;
        trace!(tag, peer, len = payload.len(), "active message sent");
        Ok(())
    }

    pub(crate) fn check_message_len(&self, tag: Tag, len: usize) -> EngineResult<()> {
        let max = self
            .tags
            .get(tag)
            .ok_or(EngineError::UnknownTag(tag))?
            .max_len;
        if len > max {
            return Err(EngineError::MessageTooLarge { tag, len, max });
        }
        Ok(())
    }

    /// True while the dynamic region has a free slot.
    pub fn can_accept_more(&self) -> bool {
        self.slots.has_room()
    }

    /// Barrier across all ranks of the transport.
    pub fn sync(&mut self) -> EngineResult<()> {
        self.transport.barrier()?;
        Ok(())
    }

    pub fn pack(&self, input: &[u8], output: &mut [u8], position: &mut usize) -> EngineResult<()> {
        self.transport.pack(input, output, position)?;
        Ok(())
    }

    pub fn unpack(&self, input: &[u8], position: &mut usize, output: &mut [u8]) -> EngineResult<()> {
        self.transport.unpack(input, position, output)?;
        Ok(())
    }

    pub fn slot_stats(&self) -> SlotStats {
        self.slots.stats(self.overflow.len())
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    pub fn add_hook(&mut self, hook: impl FnMut(&CommEvent) + Send + 'static) {
        self.hooks.add(hook);
    }

    /// Polls outstanding requests and runs their callbacks until a poll
    /// completes nothing. Returns the number of callbacks run.
    pub fn progress(&mut self) -> EngineResult<usize> {
        if self.progressing {
            return Err(EngineError::Reentrant);
        }
        self.progressing = true;
        let result = self.progress_pass();
        self.progressing = false;
        result
    }

    fn progress_pass(&mut self) -> EngineResult<usize> {
        let mut fired = 0;
        loop {
            let completions = self
                .transport
                .test_some(self.slots.active_requests_mut())?;
            if completions.is_empty() {
                self.drain_overflow()?;
                return Ok(fired);
            }
            // Dispatch and compact the whole batch before reporting the first
            // error.
            let mut failure = None;
            for completion in completions.iter() {
                match self.dispatch(*completion) {
                    Ok(true) => fired += 1,
                    Ok(false) => {}
                    Err(err) => {
                        warn!(index = completion.index, %err, "completion dispatch failed");
                        failure.get_or_insert(err);
                    }
                }
            }
            for completion in completions.iter().rev() {
                self.slots.compact(completion.index);
            }
            if let Some(err) = failure {
                return Err(err);
            }
            self.drain_overflow()?;
        }
    }

    /// Runs the callback for one completed slot; `false` if there was none
    /// to run.
    fn dispatch(&mut self, done: Completion) -> EngineResult<bool> {
        let index = done.index;

        if index < self.slots.static_end() {
            let (tag, handler, buffer) = match self.slots.record(index) {
                Some(CallbackRecord::ActiveMessage {
                    tag,
                    handler,
                    buffer,
                }) => (*tag, handler.clone(), buffer.clone()),
                Some(_) => {
                    return Err(EngineError::protocol(format!(
                        "static slot {index} holds a transient record"
                    )))
                }
                None => {
                    // Tag released by a handler earlier in this batch.
                    trace!(index, "completion on a released tag dropped");
                    return Ok(false);
                }
            };
            self.stats.callbacks_fired += 1;
            let payload = buffer.region().read(buffer.offset(), done.status.len)?;
            let message = ActiveMessage {
                tag,
                source: done.status.peer,
                payload: &payload,
            };
            trace!(tag, source = message.source, len = payload.len(), "active message received");
            let handled = match handler {
                TagHandler::PutHandshake => self.accept_handshake(TransferKind::Put, message),
                TagHandler::GetHandshake => self.accept_handshake(TransferKind::Get, message),
                TagHandler::User(handler) => {
                    handler(self, message);
                    Ok(())
                }
            };
            // Gone if the handler unregistered the tag.
            if let Some(request) = self.slots.request(index) {
                self.transport.start(request)?;
            }
            return handled.map(|()| true);
        }

        self.stats.callbacks_fired += 1;
        match self.slots.take_record(index) {
            Some(CallbackRecord::OneSided {
                callback,
                completion,
            }) => {
                trace!(peer = completion.peer, size = completion.size, "local completion");
                self.hooks.emit(CommEvent::LocalCompletion {
                    peer: completion.peer,
                    size: completion.size,
                });
                callback(self, completion);
                Ok(true)
            }
            Some(CallbackRecord::MimicActiveMessage {
                handler,
                payload,
                peer,
            }) => {
                let status = done.status;
                trace!(peer, tag = status.tag, bytes = status.len, "remote completion");
                self.hooks.emit(CommEvent::RemoteCompletion {
                    peer,
                    tag: status.tag,
                    bytes: status.len,
                });
                if let Some(handler) = handler {
                    handler(
                        self,
                        RemoteCompletion {
                            tag: status.tag,
                            peer,
                            bytes: status.len,
                            payload: &payload,
                        },
                    );
                }
                Ok(true)
            }
            Some(CallbackRecord::ActiveMessage { tag, .. }) => Err(EngineError::protocol(format!(
                "dynamic slot {index} holds a persistent receive for tag {tag}"
            ))),
            None => Err(EngineError::protocol(format!(
                "slot {index} completed without a callback record"
            ))),
        }
    }

    /// Queues or posts a transient operation.
    pub(crate) fn submit(&mut self, pending: Pending, record: CallbackRecord) -> EngineResult<()> {
        if self.overflow.is_empty() && self.slots.has_room() {
            let request = self.activate(pending)?;
            self.slots.push_dynamic(request, record);
            return Ok(());
        }
        self.overflow.push(pending, record);
        self.stats.overflowed += 1;
        let queued = self.overflow.len();
        trace!(queued, "slot table full, operation queued");
        self.hooks.emit(CommEvent::Overflowed { queued });
        Ok(())
    }

    fn activate(&mut self, pending: Pending) -> EngineResult<RequestId> {
        match pending {
            Pending::Posted(request) => Ok(request),
            Pending::DeferredSend { data, dest, tag } => {
                let bytes = data.read()?;
                Ok(self.transport.isend(&bytes, dest, tag)?)
            }
        }
    }

    fn drain_overflow(&mut self) -> EngineResult<usize> {
        let mut count = 0;
        while self.slots.has_room() {
            let Some(entry) = self.overflow.pop() else {
                break;
            };
            let request = self.activate(entry.pending)?;
            self.slots.push_dynamic(request, entry.record);
            count += 1;
        }
        if count > 0 {
            self.stats.drained += count as u64;
            trace!(count, remaining = self.overflow.len(), "overflow drained");
            self.hooks.emit(CommEvent::Drained { count });
        }
        Ok(count)
    }
}

impl ServiceEngine for Engine {
    fn poll(&mut self) -> EngineResult<usize> {
        self.progress()
    }

    fn name(&self) -> &'static str {
        "comm-engine"
    }
}
