// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Inbound request queue and the re-entrant drain loop.
//!
//! Producers (other endpoints of the node) move whole sections into the
//! destination worker's [`InboundQueue`]. The owning endpoint dequeues them
//! with a [`Drainer`], which walks each slot request by request. A handler
//! that blocks on a synchronous call drains again from inside the handler;
//! the nested drain resumes the same slot cursor, so requests still run in
//! arrival order.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::ops::Range;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::dispatch::ReplyCell;
use crate::error::{Error, Result};
use crate::node::{AbortSignal, Waiter};
use crate::request::RequestView;
use crate::EndpointId;

/// Section return path: set once the consumer has dispatched every request.
pub struct Completion {
    done: AtomicBool,
    returned: Mutex<Option<Vec<u8>>>,
}

impl Completion {
    pub fn new() -> Self {
        Self {
            done: AtomicBool::new(false),
            returned: Mutex::new(None),
        }
    }

    /// Mark done, optionally handing the buffer back for reuse.
    pub fn complete(&self, buffer: Option<Vec<u8>>) {
        *self.returned.lock() = buffer;
        self.done.store(true, Ordering::Release);
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Rearm a completed flag; yields the returned buffer (if any).
    pub fn reclaim(&self) -> Option<Option<Vec<u8>>> {
        if !self.is_done() {
            return None;
        }
        let buffer = self.returned.lock().take();
        self.done.store(false, Ordering::Release);
        Some(buffer)
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

/// Where the result of a return-expected request goes.
pub enum ReplyTarget {
    /// Caller shares memory and waits on the cell.
    Local(Arc<ReplyCell>),
    /// Caller is remote; the reply travels as a `SYNC_RETURN` frame.
    Remote { source: EndpointId, token: u64 },
}

/// One unit of inbound work: a section or a standalone carrier.
pub struct InboundSlot {
    source: EndpointId,
    bytes: Vec<u8>,
    start: usize,
    end: usize,
    completion: Option<Arc<Completion>>,
    reply: Option<ReplyTarget>,
}

impl InboundSlot {
    /// Aggregated requests in `bytes[start..end]`.
    pub fn section(
        source: EndpointId,
        bytes: Vec<u8>,
        start: usize,
        end: usize,
        completion: Option<Arc<Completion>>,
    ) -> Self {
        Self {
            source,
            bytes,
            start,
            end,
            completion,
            reply: None,
        }
    }

    /// Carrier whose requests span `bytes[start..]`.
    pub fn carrier(
        source: EndpointId,
        bytes: Vec<u8>,
        start: usize,
        reply: Option<ReplyTarget>,
    ) -> Self {
        let end = bytes.len();
        Self {
            source,
            bytes,
            start,
            end,
            completion: None,
            reply,
        }
    }

    pub fn source(&self) -> EndpointId {
        self.source
    }

    pub fn reply(&self) -> Option<&ReplyTarget> {
        self.reply.as_ref()
    }

    /// Request bytes of this slot.
    pub fn requests(&self) -> &[u8] {
        &self.bytes[self.start..self.end]
    }
}

impl Drop for InboundSlot {
    fn drop(&mut self) {
        if let Some(completion) = self.completion.take() {
            completion.complete(Some(std::mem::take(&mut self.bytes)));
        }
    }
}

struct Ring {
    slots: Box<[Option<InboundSlot>]>,
    mask: usize,
    head: usize,
    len: usize,
}

impl Ring {
    fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            mask: capacity - 1,
            head: 0,
            len: 0,
        }
    }

    fn push(&mut self, slot: InboundSlot) -> std::result::Result<(), InboundSlot> {
        if self.len == self.slots.len() {
            return Err(slot);
        }
        let idx = (self.head + self.len) & self.mask;
        self.slots[idx] = Some(slot);
        self.len += 1;
        Ok(())
    }

    fn pop(&mut self) -> Option<InboundSlot> {
        if self.len == 0 {
            return None;
        }
        let slot = self.slots[self.head].take();
        self.head = (self.head + 1) & self.mask;
        self.len -= 1;
        slot
    }
}

/// Lock-protected circular buffer of inbound slots for one endpoint.
pub struct InboundQueue {
    ring: Mutex<Ring>,
    capacity: usize,
    full_waits: AtomicU64,
}

impl InboundQueue {
    /// Queue holding at least `capacity` slots (rounded up to a power of two).
    pub fn new(capacity: usize) -> Self {
        let ring = Ring::with_capacity(capacity);
        let capacity = ring.slots.len();
        Self {
            ring: Mutex::new(ring),
            capacity,
            full_waits: AtomicU64::new(0),
        }
    }

    /// Enqueue without waiting; gives the slot back when full.
    pub fn try_enqueue(&self, slot: InboundSlot) -> std::result::Result<(), InboundSlot> {
        self.ring.lock().push(slot)
    }

    /// Enqueue, spinning while the ring is momentarily full. Never drops.
    ///
    /// `relieve` runs between attempts so the spinning producer can empty its
    /// own ring; two producers filling each other's rings then both advance.
    /// With a `stall` limit, a ring that stays full that long is a
    /// `TransportFailure`.
    pub fn enqueue(
        &self,
        slot: InboundSlot,
        abort: &AbortSignal,
        stall: Option<Duration>,
        relieve: &mut dyn FnMut(),
    ) -> Result<()> {
        let mut slot = match self.try_enqueue(slot) {
            Ok(()) => return Ok(()),
            Err(slot) => slot,
        };
        self.full_waits.fetch_add(1, Ordering::Relaxed);
        log::trace!("[inbound] queue full ({} slots), waiting", self.capacity);
        let deadline = stall.map(|limit| (limit, Instant::now() + limit));
        let mut waiter = Waiter::new();
        loop {
            abort.check()?;
            relieve();
            match self.try_enqueue(slot) {
                Ok(()) => return Ok(()),
                Err(back) => slot = back,
            }
            if let Some((limit, at)) = deadline {
                if Instant::now() >= at {
                    log::error!(
                        "[inbound] queue of {} slots stayed full for {:?}",
                        self.capacity,
                        limit
                    );
                    return Err(Error::transport(format!(
                        "inbound queue of {} slots stayed full for {:?}",
                        self.capacity, limit
                    )));
                }
            }
            waiter.pause();
        }
    }

    pub fn dequeue(&self) -> Option<InboundSlot> {
        self.ring.lock().pop()
    }

    pub fn len(&self) -> usize {
        self.ring.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of enqueues that found the ring full.
    pub fn full_waits(&self) -> u64 {
        self.full_waits.load(Ordering::Relaxed)
    }
}

/// A request borrowed from the slot currently being drained.
pub struct PendingRequest {
    slot: Rc<InboundSlot>,
    range: Range<usize>,
}

impl PendingRequest {
    pub fn bytes(&self) -> &[u8] {
        &self.slot.bytes[self.range.clone()]
    }

    pub fn slot(&self) -> &InboundSlot {
        &self.slot
    }
}

struct ActiveSlot {
    slot: Rc<InboundSlot>,
    cursor: usize,
}

/// Consumer side of one endpoint's inbound traffic.
pub struct Drainer {
    current: RefCell<Option<ActiveSlot>>,
    backlog: RefCell<VecDeque<InboundSlot>>,
    depth: Cell<usize>,
    max_depth: usize,
    slots_taken: Cell<u64>,
    dispatched: Cell<u64>,
}

impl Drainer {
    pub fn new(max_depth: usize) -> Self {
        Self {
            current: RefCell::new(None),
            backlog: RefCell::new(VecDeque::new()),
            depth: Cell::new(0),
            max_depth,
            slots_taken: Cell::new(0),
            dispatched: Cell::new(0),
        }
    }

    /// Queue a slot that arrived over message passing.
    pub fn push_backlog(&self, slot: InboundSlot) {
        self.backlog.borrow_mut().push_back(slot);
    }

    /// Move every slot of `queue` to the backlog without executing anything.
    ///
    /// Returns the number of slots moved.
    pub fn spill(&self, queue: &InboundQueue) -> usize {
        let mut backlog = self.backlog.borrow_mut();
        let mut moved = 0;
        while let Some(slot) = queue.dequeue() {
            backlog.push_back(slot);
            moved += 1;
        }
        moved
    }

    fn next(&self, queue: &InboundQueue) -> Result<Option<PendingRequest>> {
        let mut current = self.current.borrow_mut();
        loop {
            if let Some(active) = current.as_mut() {
                let end = active.slot.end;
                if active.cursor < end {
                    let start = active.cursor;
                    let len = RequestView::peek_len(&active.slot.bytes[start..end])?;
                    active.cursor += len;
                    let slot = Rc::clone(&active.slot);
                    if active.cursor == end {
                        *current = None;
                    }
                    return Ok(Some(PendingRequest {
                        slot,
                        range: start..start + len,
                    }));
                }
                *current = None;
            }

            // Spilled slots are older than anything still in the ring.
            let spilled = self.backlog.borrow_mut().pop_front();
            let next = spilled.or_else(|| queue.dequeue());
            match next {
                Some(slot) => {
                    self.slots_taken.set(self.slots_taken.get() + 1);
                    *current = Some(ActiveSlot {
                        cursor: slot.start,
                        slot: Rc::new(slot),
                    });
                }
                None => return Ok(None),
            }
        }
    }

    /// Dispatch every available request in arrival order.
    ///
    /// Returns the number of requests executed by this call, nested ones excluded.
    pub fn drain(
        &self,
        queue: &InboundQueue,
        exec: &mut dyn FnMut(&PendingRequest) -> Result<()>,
    ) -> Result<usize> {
        let mut executed = 0;
        while let Some(request) = self.next(queue)? {
            self.enter()?;
            let outcome = exec(&request);
            self.exit();
            outcome?;
            self.dispatched.set(self.dispatched.get() + 1);
            executed += 1;
        }
        Ok(executed)
    }

    /// Run a direct local dispatch under the same depth accounting.
    pub fn nested<R>(&self, f: impl FnOnce() -> R) -> Result<R> {
        self.enter()?;
        let value = f();
        self.exit();
        self.dispatched.set(self.dispatched.get() + 1);
        Ok(value)
    }

    fn enter(&self) -> Result<()> {
        let depth = self.depth.get() + 1;
        if depth > self.max_depth {
            return Err(Error::NestingOverflow {
                depth,
                max: self.max_depth,
            });
        }
        self.depth.set(depth);
        Ok(())
    }

    fn exit(&self) {
        self.depth.set(self.depth.get().saturating_sub(1));
    }

    /// Requests currently executing on this stack.
    pub fn depth(&self) -> usize {
        self.depth.get()
    }

    /// Slots taken from the queue or backlog since start.
    pub fn slots_taken(&self) -> u64 {
        self.slots_taken.get()
    }

    /// Requests dispatched since the last reset.
    pub fn dispatched(&self) -> u64 {
        self.dispatched.get()
    }

    pub fn reset_dispatched(&self) {
        self.dispatched.set(0);
    }

    pub fn has_backlog(&self) -> bool {
        !self.backlog.borrow().is_empty() || self.current.borrow().is_some()
    }
}
