// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The per-thread runtime context.
//!
//! An [`Endpoint`] owns everything that is private to one execution context:
//! the object registry, the outgoing aggregation buffers, the drain state and
//! the fence driver. It is handed to user code and to every method handler,
//! and it is neither `Send` nor `Sync`.
//!
//! # Routing
//!
//! | Destination | Route | Mechanism |
//! |-------------|-------|-----------|
//! | self | [`Route::Direct`] | typed call, no marshaling |
//! | same node | [`Route::SharedMemory`] | section moved into the target's inbound queue |
//! | other node | [`Route::MessagePassing`] | frame through the [`Transport`](crate::transport::Transport) |
//!
//! # Suspension points
//!
//! [`sync_call`](Endpoint::sync_call), [`wait`](Endpoint::wait) and
//! [`fence`](Endpoint::fence) never block passively: while waiting they
//! drain inbound requests and pump the transport.

use std::any::{Any, TypeId};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::sync::Arc;

use crate::aggregation::{AggregationBuffer, SectionHandoff, SectionSink};
use crate::collective::CollectiveMailbox;
use crate::config::{RuntimeConfig, INITIAL_REGISTRY_CAPACITY};
use crate::dispatch::{Dispatcher, ReplyCell};
use crate::error::{Error, Result};
use crate::fence::{ControlFrame, FenceCoordinator, FenceHost, InterNodeTree, Tally};
use crate::inbound::{Drainer, InboundSlot, PendingRequest, ReplyTarget};
use crate::marshal::{self, Marshal};
use crate::node::{NodeShared, Topology, Waiter};
use crate::registry::{GlobalRef, Handle, ObjectRegistry};
use crate::request::{
    Method, MethodTable, ObjectEntry, RemoteObject, Request, RequestKind, RequestView,
    REQUEST_HEADER_SIZE,
};
use crate::transport::wire::{self, MessageTag, WireHeader, WIRE_HEADER_SIZE};
use crate::transport::{Route, TransportSelector};
use crate::EndpointId;

/// One execution context of the run.
pub struct Endpoint {
    id: EndpointId,
    worker: usize,
    shared: Arc<NodeShared>,
    selector: TransportSelector,
    registry: RefCell<ObjectRegistry<dyn ObjectEntry>>,
    tables: RefCell<HashMap<TypeId, Rc<dyn Any>>>,
    mailbox: Rc<CollectiveMailbox>,
    buffers: RefCell<Vec<Option<AggregationBuffer>>>,
    drainer: Drainer,
    dispatcher: Dispatcher,
    sent: Cell<u64>,
    replies_received: Cell<u64>,
    replies: RefCell<HashMap<u64, Vec<u8>>>,
    next_token: Cell<u64>,
    control: RefCell<VecDeque<ControlFrame>>,
    fence: RefCell<FenceCoordinator>,
    aggregation: Cell<u32>,
    poll_rate: Cell<u32>,
    calls_since_poll: Cell<u32>,
    waits: Cell<u64>,
    collective_seq: Cell<u64>,
}

impl Endpoint {
    /// Endpoint `id` of the node described by `shared`.
    pub fn new(id: EndpointId, shared: Arc<NodeShared>) -> Result<Self> {
        let topology = shared.topology();
        if id >= topology.endpoints() || topology.node_of(id) != shared.node() {
            return Err(Error::Config {
                reason: format!("endpoint {} does not belong to node {}", id, shared.node()),
            });
        }
        let config = shared.config().clone();
        let worker = topology.worker_of(id);

        let mut registry = ObjectRegistry::new(
            id,
            INITIAL_REGISTRY_CAPACITY,
            config.trace_registration,
        );
        let mailbox = Rc::new(CollectiveMailbox::new());
        let mut table = MethodTable::new();
        <CollectiveMailbox as RemoteObject>::methods(&mut table);
        let identity = Rc::as_ptr(&mailbox) as *const () as usize;
        let entry: Rc<dyn ObjectEntry> =
            Rc::new(crate::request::TypedEntry::new(Rc::clone(&mailbox), Rc::new(table)));
        registry.register_reserved(entry, identity);

        let tree = InterNodeTree::new(topology.nodes(), config.fence_topology);
        let fence = FenceCoordinator::new(
            worker,
            shared.node(),
            tree,
            config.fence_iteration_cap,
            config.fence_stall_timeout,
        );

        log::debug!(
            "[endpoint] {} started (node {} worker {})",
            id,
            shared.node(),
            worker
        );
        Ok(Self {
            id,
            worker,
            selector: TransportSelector::new(id, topology, shared.policy()),
            registry: RefCell::new(registry),
            tables: RefCell::new(HashMap::new()),
            mailbox,
            buffers: RefCell::new((0..topology.endpoints()).map(|_| None).collect()),
            drainer: Drainer::new(config.max_nesting_depth),
            dispatcher: Dispatcher::new(config.max_message_size),
            sent: Cell::new(0),
            replies_received: Cell::new(0),
            replies: RefCell::new(HashMap::new()),
            next_token: Cell::new(1),
            control: RefCell::new(VecDeque::new()),
            fence: RefCell::new(fence),
            aggregation: Cell::new(config.aggregation.max(1)),
            poll_rate: Cell::new(config.poll_rate.max(1)),
            calls_since_poll: Cell::new(0),
            waits: Cell::new(0),
            collective_seq: Cell::new(0),
            shared,
        })
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn id(&self) -> EndpointId {
        self.id
    }

    /// Endpoints in the run.
    pub fn endpoints(&self) -> usize {
        self.topology().endpoints()
    }

    pub fn node(&self) -> usize {
        self.shared.node()
    }

    pub fn nodes(&self) -> usize {
        self.topology().nodes()
    }

    pub fn worker(&self) -> usize {
        self.worker
    }

    pub fn workers_per_node(&self) -> usize {
        self.topology().workers()
    }

    /// `endpoint` shares this endpoint's address space.
    pub fn is_local(&self, endpoint: EndpointId) -> bool {
        self.selector.is_local(endpoint)
    }

    /// Route a call to `dest` would take.
    pub fn route_to(&self, dest: EndpointId) -> Route {
        self.selector.select_route(dest)
    }

    /// Local `sent - received`; the sum over all endpoints is zero after a fence.
    pub fn credit(&self) -> i64 {
        self.tally().balance()
    }

    pub fn config(&self) -> &RuntimeConfig {
        self.shared.config()
    }

    pub(crate) fn topology(&self) -> Topology {
        self.shared.topology()
    }

    pub(crate) fn shared(&self) -> &NodeShared {
        &self.shared
    }

    pub(crate) fn mailbox(&self) -> &CollectiveMailbox {
        &self.mailbox
    }

    fn tally(&self) -> Tally {
        Tally::new(
            self.sent.get(),
            self.drainer.slots_taken() + self.replies_received.get(),
        )
    }

    // ========================================================================
    // Registry
    // ========================================================================

    /// Register `object` under the smallest free handle.
    ///
    /// Endpoints that register in the same order get the same handles.
    pub fn register_object<T: RemoteObject>(&self, object: Rc<T>) -> Handle {
        let identity = Rc::as_ptr(&object) as *const () as usize;
        let entry: Rc<dyn ObjectEntry> =
            Rc::new(crate::request::TypedEntry::new(object, self.table_for::<T>()));
        self.registry
            .borrow_mut()
            .register(entry, identity, std::any::type_name::<T>())
    }

    /// Re-point `handle` at `object`.
    pub fn update_object<T: RemoteObject>(&self, handle: Handle, object: Rc<T>) -> Result<()> {
        let identity = Rc::as_ptr(&object) as *const () as usize;
        let entry: Rc<dyn ObjectEntry> =
            Rc::new(crate::request::TypedEntry::new(object, self.table_for::<T>()));
        let result = self.registry.borrow_mut().update(handle, entry, identity);
        self.checked(result)
    }

    /// Release `handle`. Requests still addressing it must have been fenced.
    pub fn unregister_object(&self, handle: Handle) -> Result<()> {
        let result = self.registry.borrow_mut().unregister(handle).map(drop);
        self.checked(result)
    }

    /// Typed access to an object registered on this endpoint.
    pub fn local_object<T: RemoteObject>(&self, handle: Handle) -> Result<Rc<T>> {
        let entry = self.lookup_entry(handle)?;
        entry
            .as_any()
            .downcast_ref::<crate::request::TypedEntry<T>>()
            .map(|typed| Rc::clone(typed.object()))
            .ok_or(Error::TypeMismatch {
                handle,
                expected: std::any::type_name::<T>(),
            })
    }

    /// Registered user handles, ascending.
    pub fn registered_handles(&self) -> Vec<Handle> {
        self.registry.borrow().handles()
    }

    /// Type names in registration order, when tracing is enabled.
    pub fn registration_trace(&self) -> Option<Vec<&'static str>> {
        self.registry.borrow().trace().map(<[&'static str]>::to_vec)
    }

    pub(crate) fn lookup_entry(&self, handle: Handle) -> Result<Rc<dyn ObjectEntry>> {
        self.registry.borrow().lookup(handle)
    }

    fn table_for<T: RemoteObject>(&self) -> Rc<MethodTable<T>> {
        let key = TypeId::of::<T>();
        let cached = self.tables.borrow().get(&key).cloned();
        if let Some(table) = cached.and_then(|t| t.downcast::<MethodTable<T>>().ok()) {
            return table;
        }
        let mut table = MethodTable::new();
        T::methods(&mut table);
        log::trace!(
            "[endpoint] {} built method table for {} ({} ops)",
            self.id,
            std::any::type_name::<T>(),
            table.len()
        );
        let table = Rc::new(table);
        self.tables
            .borrow_mut()
            .insert(key, Rc::clone(&table) as Rc<dyn Any>);
        table
    }

    // ========================================================================
    // RMI
    // ========================================================================

    /// Fire-and-forget call of `method` on `handle` at `dest`.
    pub fn async_call<T, A, R>(
        &self,
        dest: EndpointId,
        handle: Handle,
        method: Method<T, A, R>,
        args: A,
    ) -> Result<()>
    where
        T: RemoteObject,
        A: Marshal + 'static,
        R: Marshal + 'static,
    {
        let result = self.async_inner(dest, handle, method, args);
        self.checked(result)?;
        self.maybe_poll()
    }

    /// Call `method` on `handle` at `dest` and wait for its result.
    pub fn sync_call<T, A, R>(
        &self,
        dest: EndpointId,
        handle: Handle,
        method: Method<T, A, R>,
        args: A,
    ) -> Result<R>
    where
        T: RemoteObject,
        A: Marshal + 'static,
        R: Marshal + 'static,
    {
        let result = self.sync_inner(dest, handle, method, args);
        let value = self.checked(result)?;
        self.maybe_poll()?;
        Ok(value)
    }

    fn async_inner<T, A, R>(
        &self,
        dest: EndpointId,
        handle: Handle,
        method: Method<T, A, R>,
        args: A,
    ) -> Result<()>
    where
        T: RemoteObject,
        A: Marshal + 'static,
        R: Marshal + 'static,
    {
        self.shared.abort().check()?;
        self.check_endpoint(dest)?;
        match self.selector.select_route(dest) {
            Route::Direct => {
                let object = self.local_object::<T>(handle)?;
                self.drainer.nested(|| method.call(&object, self, args))?;
                Ok(())
            }
            route => {
                let request = Request::new(
                    GlobalRef::new(dest, handle),
                    method.id(),
                    RequestKind::Async,
                    args,
                );
                self.post(dest, route, &request)
            }
        }
    }

    fn sync_inner<T, A, R>(
        &self,
        dest: EndpointId,
        handle: Handle,
        method: Method<T, A, R>,
        args: A,
    ) -> Result<R>
    where
        T: RemoteObject,
        A: Marshal + 'static,
        R: Marshal + 'static,
    {
        self.shared.abort().check()?;
        self.check_endpoint(dest)?;
        let route = self.selector.select_route(dest);
        if route == Route::Direct {
            let object = self.local_object::<T>(handle)?;
            return self.drainer.nested(|| method.call(&object, self, args));
        }

        let request = Request::new(
            GlobalRef::new(dest, handle),
            method.id(),
            RequestKind::Sync,
            args,
        );
        let len = self.check_size(request.encoded_len())?;
        self.flush_to(dest)?;
        let mut carrier = vec![0u8; WIRE_HEADER_SIZE + len];
        request.encode_into(&mut carrier[WIRE_HEADER_SIZE..])?;

        let (reply, offset) = if route == Route::SharedMemory {
            let cell = Arc::new(ReplyCell::new(self.config().reply_capacity));
            let target = ReplyTarget::Local(Arc::clone(&cell));
            self.enqueue_local(
                dest,
                InboundSlot::carrier(self.id, carrier, WIRE_HEADER_SIZE, Some(target)),
            )?;
            (self.await_cell(&cell)?, 0)
        } else {
            let token = self.next_token.get();
            self.next_token.set(token + 1);
            self.send_frame(dest, carrier, MessageTag::AsyncSync, token)?;
            (self.await_reply(token)?, WIRE_HEADER_SIZE)
        };
        let bytes = reply.get(offset..).ok_or_else(|| {
            Error::transport(format!("reply from endpoint {} truncated", dest))
        })?;
        Ok(marshal::unpack_from(bytes)?)
    }

    /// Encode an async request for `dest` into its aggregation buffer.
    fn post<A: Marshal>(&self, dest: EndpointId, route: Route, request: &Request<A>) -> Result<()> {
        let len = self.check_size(request.encoded_len())?;
        let mut buffers = self.buffers.borrow_mut();
        let buffer = self.buffer_for(&mut buffers, dest);
        if len > buffer.room() {
            buffer.flush(self)?;
            drop(buffers);
            let mut carrier = vec![0u8; WIRE_HEADER_SIZE + len];
            request.encode_into(&mut carrier[WIRE_HEADER_SIZE..])?;
            log::trace!(
                "[endpoint] {} large request ({} bytes) to {}",
                self.id,
                len,
                dest
            );
            return match route {
                Route::SharedMemory => self.enqueue_local(
                    dest,
                    InboundSlot::carrier(self.id, carrier, WIRE_HEADER_SIZE, None),
                ),
                _ => self
                    .send_frame(dest, carrier, MessageTag::AsyncOnly, 0)
                    .map(drop),
            };
        }
        let slot = buffer.reserve(len, self)?;
        request.encode_into(slot)?;
        buffer.note_request(self)
    }

    fn buffer_for<'b>(
        &self,
        buffers: &'b mut [Option<AggregationBuffer>],
        dest: EndpointId,
    ) -> &'b mut AggregationBuffer {
        let config = self.shared.config();
        let threshold = self.aggregation.get();
        buffers[dest].get_or_insert_with(|| {
            AggregationBuffer::new(
                dest,
                config.section_capacity,
                config.initial_sections,
                WIRE_HEADER_SIZE,
                threshold,
            )
        })
    }

    fn check_endpoint(&self, dest: EndpointId) -> Result<()> {
        if dest >= self.endpoints() {
            return Err(Error::InvalidEndpoint {
                endpoint: dest,
                endpoints: self.endpoints(),
            });
        }
        Ok(())
    }

    fn check_size(&self, len: usize) -> Result<usize> {
        let ceiling = self.config().max_message_size - WIRE_HEADER_SIZE;
        if len > ceiling {
            return Err(Error::PayloadTooLarge {
                size: len,
                capacity: ceiling,
            });
        }
        Ok(len)
    }

    fn enqueue_local(&self, dest: EndpointId, slot: InboundSlot) -> Result<()> {
        self.sent.set(self.sent.get() + 1);
        let worker = self.topology().worker_of(dest);
        let own = self.shared.queue(self.worker);
        self.shared.queue(worker).enqueue(
            slot,
            self.shared.abort(),
            self.config().fence_stall_timeout,
            &mut || {
                self.drainer.spill(own);
            },
        )
    }

    fn send_frame(
        &self,
        dest: EndpointId,
        mut frame: Vec<u8>,
        tag: MessageTag,
        token: u64,
    ) -> Result<Option<Vec<u8>>> {
        WireHeader::new(tag, self.id, token).encode(&mut frame[..WIRE_HEADER_SIZE])?;
        self.sent.set(self.sent.get() + 1);
        self.shared.transport().send(dest, frame)
    }

    fn await_cell(&self, cell: &ReplyCell) -> Result<Vec<u8>> {
        let mut waiter = Waiter::new();
        loop {
            if let Some(reply) = cell.take_reply() {
                return Ok(reply);
            }
            self.idle(&mut waiter)?;
        }
    }

    fn await_reply(&self, token: u64) -> Result<Vec<u8>> {
        let mut waiter = Waiter::new();
        loop {
            if let Some(reply) = self.replies.borrow_mut().remove(&token) {
                return Ok(reply);
            }
            self.idle(&mut waiter)?;
        }
    }

    /// One progress step; pauses when nothing was dispatched.
    pub(crate) fn idle(&self, waiter: &mut Waiter) -> Result<()> {
        if self.progress_once()? > 0 {
            waiter.reset();
        } else {
            waiter.pause();
        }
        Ok(())
    }

    // ========================================================================
    // Progress
    // ========================================================================

    /// Drain inbound requests now. Returns the number dispatched.
    pub fn poll(&self) -> Result<usize> {
        let result = self.progress_once();
        self.checked(result)
    }

    /// Send every partially filled section.
    pub fn flush(&self) -> Result<()> {
        let result = self.flush_all();
        self.checked(result)
    }

    /// Block, draining, until a request has been dispatched since the last
    /// `wait` or fence.
    pub fn wait(&self) -> Result<()> {
        let result = self.wait_inner();
        self.checked(result)
    }

    /// Global barrier that returns once no request is in flight anywhere.
    ///
    /// Returns the final global credit, which is zero.
    pub fn fence(&self) -> Result<i64> {
        let result = self.fence_inner();
        self.checked(result)
    }

    fn wait_inner(&self) -> Result<()> {
        let mut waiter = Waiter::new();
        loop {
            self.shared.abort().check()?;
            if self.drainer.dispatched() > self.waits.get() {
                self.waits.set(self.waits.get() + 1);
                return Ok(());
            }
            self.idle(&mut waiter)?;
        }
    }

    fn fence_inner(&self) -> Result<i64> {
        self.shared.abort().check()?;
        self.flush_all()?;
        let mut fence = self
            .fence
            .try_borrow_mut()
            .map_err(|_| Error::fence("fence entered from a handler running inside a fence"))?;
        let totals = fence.run(self, self.shared.fence())?;
        drop(fence);
        self.drainer.reset_dispatched();
        self.waits.set(0);
        Ok(totals.balance())
    }

    pub(crate) fn progress_once(&self) -> Result<usize> {
        self.shared.abort().check()?;
        self.pump()?;
        let queue = self.shared.queue(self.worker);
        self.drainer.drain(queue, &mut |pending: &PendingRequest| {
            self.execute(pending).map_err(|e| self.abort_on(e))
        })
    }

    fn maybe_poll(&self) -> Result<()> {
        let calls = self.calls_since_poll.get() + 1;
        if calls >= self.poll_rate.get() {
            self.calls_since_poll.set(0);
            self.poll()?;
        } else {
            self.calls_since_poll.set(calls);
        }
        Ok(())
    }

    fn flush_all(&self) -> Result<()> {
        let mut buffers = self.buffers.borrow_mut();
        for buffer in buffers.iter_mut().flatten() {
            buffer.reclaim();
            buffer.flush(self)?;
        }
        Ok(())
    }

    pub(crate) fn flush_to(&self, dest: EndpointId) -> Result<()> {
        if let Some(buffer) = self.buffers.borrow_mut().get_mut(dest).and_then(Option::as_mut) {
            buffer.flush(self)?;
        }
        Ok(())
    }

    /// Move frames from the transport mailbox to the drain backlog, the
    /// reply table or the fence inbox.
    fn pump(&self) -> Result<()> {
        let transport = self.shared.transport();
        while let Some(frame) = transport.try_recv(self.id)? {
            let header = WireHeader::decode(&frame)?;
            match header.tag {
                MessageTag::AsyncOnly => self.drainer.push_backlog(InboundSlot::carrier(
                    header.source,
                    frame,
                    WIRE_HEADER_SIZE,
                    None,
                )),
                MessageTag::AsyncSync => {
                    let reply = ReplyTarget::Remote {
                        source: header.source,
                        token: header.reply_token,
                    };
                    self.drainer.push_backlog(InboundSlot::carrier(
                        header.source,
                        frame,
                        WIRE_HEADER_SIZE,
                        Some(reply),
                    ));
                }
                MessageTag::SyncReturn => {
                    self.replies_received.set(self.replies_received.get() + 1);
                    self.replies.borrow_mut().insert(header.reply_token, frame);
                }
                MessageTag::FenceArrival | MessageTag::FenceRelease => {
                    let body = wire::body(&frame)?.to_vec();
                    self.control.borrow_mut().push_back(ControlFrame {
                        tag: header.tag,
                        source: header.source,
                        body,
                    });
                }
                MessageTag::Abort => {
                    let reason = String::from_utf8_lossy(wire::body(&frame)?).into_owned();
                    if self.shared.abort().raise(header.source, reason) {
                        log::debug!(
                            "[endpoint] {} received abort from endpoint {}",
                            self.id,
                            header.source
                        );
                    }
                }
            }
        }
        Ok(())
    }

    fn execute(&self, pending: &PendingRequest) -> Result<()> {
        let view = RequestView::parse(pending.bytes())?;
        match (view.header.kind, pending.slot().reply()) {
            (RequestKind::Sync, Some(ReplyTarget::Local(cell))) => {
                let mut carrier = cell.take_carrier();
                let len = self
                    .dispatcher
                    .exec(self, &view, Some((&mut carrier, 0)))?
                    .unwrap_or(0);
                cell.fulfil(carrier, len);
            }
            (RequestKind::Sync, Some(ReplyTarget::Remote { source, token })) => {
                let mut carrier = vec![0u8; WIRE_HEADER_SIZE + self.config().reply_capacity];
                let len = self
                    .dispatcher
                    .exec(self, &view, Some((&mut carrier, WIRE_HEADER_SIZE)))?
                    .unwrap_or(0);
                carrier.truncate(WIRE_HEADER_SIZE + len);
                self.send_frame(*source, carrier, MessageTag::SyncReturn, *token)?;
            }
            _ => {
                self.dispatcher.exec(self, &view, None)?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Tuning
    // ========================================================================

    /// Requests per section before a proactive flush.
    pub fn get_aggregation(&self) -> u32 {
        self.aggregation.get()
    }

    /// Largest useful aggregation: how many minimal requests fit a section.
    pub fn max_aggregation(&self) -> u32 {
        let room = self.config().section_capacity.saturating_sub(WIRE_HEADER_SIZE);
        u32::try_from(room / REQUEST_HEADER_SIZE)
            .unwrap_or(u32::MAX)
            .max(1)
    }

    /// Flush, then apply a new aggregation threshold to every destination.
    pub fn set_aggregation(&self, requests: u32) -> Result<()> {
        self.flush()?;
        let max = self.max_aggregation();
        let clamped = requests.clamp(1, max);
        if clamped != requests {
            log::warn!(
                "[endpoint] {} aggregation {} clamped to {}",
                self.id,
                requests,
                clamped
            );
        }
        self.aggregation.set(clamped);
        for buffer in self.buffers.borrow_mut().iter_mut().flatten() {
            buffer.set_threshold(clamped);
        }
        Ok(())
    }

    pub fn get_poll_rate(&self) -> u32 {
        self.poll_rate.get()
    }

    /// RMI calls between implicit polls (at least 1).
    pub fn set_poll_rate(&self, calls: u32) {
        self.poll_rate.set(calls.max(1));
        self.calls_since_poll.set(0);
    }

    pub(crate) fn next_collective_seq(&self) -> u64 {
        let seq = self.collective_seq.get() + 1;
        self.collective_seq.set(seq);
        seq
    }

    // ========================================================================
    // Abort
    // ========================================================================

    /// Raise the run-wide abort for fatal errors.
    pub(crate) fn escalate(&self, err: Error) -> Error {
        if err.is_fatal() {
            self.shared.abort_run(self.id, &err.to_string());
        }
        err
    }

    /// Raise the run-wide abort for any error not already an abort.
    pub(crate) fn abort_on(&self, err: Error) -> Error {
        if !matches!(err, Error::Aborted { .. }) {
            self.shared.abort_run(self.id, &err.to_string());
        }
        err
    }

    fn checked<R>(&self, result: Result<R>) -> Result<R> {
        result.map_err(|e| self.escalate(e))
    }

    /// One-endpoint run used by unit tests.
    #[cfg(test)]
    pub(crate) fn solo() -> Result<Self> {
        use crate::transport::{ChannelTransport, TransportPolicy};
        let shared = NodeShared::new(
            0,
            Topology::new(1, 1),
            RuntimeConfig::default(),
            TransportPolicy::Hybrid,
            Arc::new(ChannelTransport::new(1)),
        )?;
        Self::new(0, Arc::new(shared))
    }
}

impl SectionSink for Endpoint {
    fn deliver(&self, dest: EndpointId, section: SectionHandoff) -> Result<()> {
        let SectionHandoff {
            mut bytes,
            len,
            requests,
            completion,
        } = section;
        log::trace!(
            "[endpoint] {} delivers {} requests to {}",
            self.id,
            requests,
            dest
        );
        match self.selector.select_route(dest) {
            Route::SharedMemory => self.enqueue_local(
                dest,
                InboundSlot::section(self.id, bytes, WIRE_HEADER_SIZE, len, Some(completion)),
            ),
            Route::MessagePassing => {
                bytes.truncate(len);
                let returned = self.send_frame(dest, bytes, MessageTag::AsyncOnly, 0)?;
                completion.complete(returned);
                Ok(())
            }
            Route::Direct => Err(Error::transport(format!(
                "endpoint {} buffered a section for itself",
                self.id
            ))),
        }
    }
}

impl FenceHost for Endpoint {
    fn progress(&self) -> Result<()> {
        self.progress_once().map(drop)
    }

    fn settle_tally(&self) -> Result<Tally> {
        self.flush_all()?;
        Ok(self.tally())
    }

    fn next_control(&self) -> Option<ControlFrame> {
        self.control.borrow_mut().pop_front()
    }

    fn send_control(&self, node: usize, tag: MessageTag, body: Vec<u8>) -> Result<()> {
        let frame = wire::frame(WireHeader::new(tag, self.id, 0), &body)?;
        let leader = self.topology().leader(node);
        self.shared.transport().send(leader, frame).map(drop)
    }
}
