// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! State shared by the endpoints of one node.
//!
//! A node is one address space (process). Its worker endpoints run on their
//! own threads and meet only through the structures in [`NodeShared`]: the
//! inbound queues, the intra-node fence tree, the collective slots and the
//! abort flag.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam::utils::Backoff;
use parking_lot::Mutex;

use crate::config::{RuntimeConfig, SPIN_LIMIT};
use crate::error::{Error, Result};
use crate::fence::IntraNodeFence;
use crate::inbound::InboundQueue;
use crate::transport::wire::{self, MessageTag, WireHeader};
use crate::transport::{Transport, TransportPolicy};
use crate::EndpointId;

/// Shape of the run: `nodes` address spaces with `workers` endpoints each.
///
/// Endpoint ids are node-major: endpoint `e` is worker `e % workers` of node
/// `e / workers`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Topology {
    nodes: usize,
    workers: usize,
}

impl Topology {
    pub const fn new(nodes: usize, workers: usize) -> Self {
        Self { nodes, workers }
    }

    pub const fn nodes(&self) -> usize {
        self.nodes
    }

    pub const fn workers(&self) -> usize {
        self.workers
    }

    pub const fn endpoints(&self) -> usize {
        self.nodes * self.workers
    }

    pub const fn node_of(&self, endpoint: EndpointId) -> usize {
        endpoint / self.workers
    }

    pub const fn worker_of(&self, endpoint: EndpointId) -> usize {
        endpoint % self.workers
    }

    pub const fn endpoint(&self, node: usize, worker: usize) -> EndpointId {
        node * self.workers + worker
    }

    /// Worker 0 of `node`, which speaks for the node in inter-node protocols.
    pub const fn leader(&self, node: usize) -> EndpointId {
        node * self.workers
    }
}

/// Node-wide abort flag. The first raise wins and records the cause.
pub struct AbortSignal {
    raised: AtomicBool,
    cause: Mutex<Option<(EndpointId, String)>>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self {
            raised: AtomicBool::new(false),
            cause: Mutex::new(None),
        }
    }

    /// Raise the abort. Returns `true` for the first raise only.
    pub fn raise(&self, origin: EndpointId, reason: String) -> bool {
        let mut cause = self.cause.lock();
        if cause.is_some() {
            return false;
        }
        *cause = Some((origin, reason));
        self.raised.store(true, Ordering::Release);
        true
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }

    /// `Err(Aborted)` once raised.
    pub fn check(&self) -> Result<()> {
        if !self.is_raised() {
            return Ok(());
        }
        let (origin, reason) = self
            .cause
            .lock()
            .clone()
            .unwrap_or((0, String::from("unknown")));
        Err(Error::Aborted { origin, reason })
    }

    pub fn cause(&self) -> Option<(EndpointId, String)> {
        self.cause.lock().clone()
    }
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded spin, then yield. Used by every drain-while-waiting loop.
pub struct Waiter {
    backoff: Backoff,
    spins: u32,
}

impl Waiter {
    pub fn new() -> Self {
        Self {
            backoff: Backoff::new(),
            spins: 0,
        }
    }

    pub fn pause(&mut self) {
        if self.spins < SPIN_LIMIT {
            self.spins += 1;
            self.backoff.spin();
        } else {
            std::thread::yield_now();
        }
    }

    /// Back to busy spinning after progress was made.
    pub fn reset(&mut self) {
        self.spins = 0;
        self.backoff.reset();
    }
}

impl Default for Waiter {
    fn default() -> Self {
        Self::new()
    }
}

type Slot = Mutex<Option<Box<dyn Any + Send>>>;

/// Hand-off cells used by reduce and broadcast.
pub struct CollectiveSlots {
    partials: Vec<Slot>,
    result: Slot,
}

impl CollectiveSlots {
    pub fn new(workers: usize) -> Self {
        Self {
            partials: (0..workers).map(|_| Mutex::new(None)).collect(),
            result: Mutex::new(None),
        }
    }

    /// Publish worker `worker`'s partial value.
    pub fn put_partial<T: Any + Send>(&self, worker: usize, value: T) {
        *self.partials[worker].lock() = Some(Box::new(value));
    }

    /// Take worker `worker`'s partial value once published.
    pub fn take_partial<T: Any + Send>(&self, worker: usize) -> Result<Option<T>> {
        let taken = self.partials[worker].lock().take();
        taken.map(downcast::<T>).transpose()
    }

    pub fn put_result<T: Any + Send>(&self, value: T) {
        *self.result.lock() = Some(Box::new(value));
    }

    /// Clone of the published result.
    pub fn read_result<T: Any + Send + Clone>(&self) -> Result<Option<T>> {
        match self.result.lock().as_ref() {
            Some(value) => value
                .downcast_ref::<T>()
                .cloned()
                .map(Some)
                .ok_or_else(type_mismatch::<T>),
            None => Ok(None),
        }
    }

    pub fn clear_result(&self) {
        *self.result.lock() = None;
    }
}

fn downcast<T: Any>(value: Box<dyn Any + Send>) -> Result<T> {
    value
        .downcast::<T>()
        .map(|boxed| *boxed)
        .map_err(|_| type_mismatch::<T>())
}

fn type_mismatch<T>() -> Error {
    Error::TypeMismatch {
        handle: crate::registry::Handle::RESERVED,
        expected: std::any::type_name::<T>(),
    }
}

/// Everything the endpoints of one node share.
pub struct NodeShared {
    node: usize,
    topology: Topology,
    config: RuntimeConfig,
    policy: TransportPolicy,
    queues: Vec<InboundQueue>,
    fence: IntraNodeFence,
    collective: CollectiveSlots,
    abort: AbortSignal,
    transport: Arc<dyn Transport>,
}

impl NodeShared {
    pub fn new(
        node: usize,
        topology: Topology,
        config: RuntimeConfig,
        policy: TransportPolicy,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        config.validate()?;
        if node >= topology.nodes() || topology.workers() == 0 {
            return Err(Error::Config {
                reason: format!(
                    "node {} outside a run of {} nodes x {} workers",
                    node,
                    topology.nodes(),
                    topology.workers()
                ),
            });
        }
        if transport.endpoints() != topology.endpoints() {
            return Err(Error::Config {
                reason: format!(
                    "transport spans {} endpoints, run has {}",
                    transport.endpoints(),
                    topology.endpoints()
                ),
            });
        }
        let workers = topology.workers();
        let capacity = config.inbound_capacity();
        log::debug!(
            "[node] node {} up: {} workers, inbound capacity {}, {:?}",
            node,
            workers,
            capacity,
            policy
        );
        Ok(Self {
            node,
            topology,
            queues: (0..workers).map(|_| InboundQueue::new(capacity)).collect(),
            fence: IntraNodeFence::new(workers),
            collective: CollectiveSlots::new(workers),
            abort: AbortSignal::new(),
            config,
            policy,
            transport,
        })
    }

    pub fn node(&self) -> usize {
        self.node
    }

    pub fn topology(&self) -> Topology {
        self.topology
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn policy(&self) -> TransportPolicy {
        self.policy
    }

    pub fn queue(&self, worker: usize) -> &InboundQueue {
        &self.queues[worker]
    }

    pub fn fence(&self) -> &IntraNodeFence {
        &self.fence
    }

    pub fn collective(&self) -> &CollectiveSlots {
        &self.collective
    }

    pub fn abort(&self) -> &AbortSignal {
        &self.abort
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Raise the abort and notify every endpoint outside this node.
    ///
    /// Returns `false` when the run was already aborting.
    pub fn abort_run(&self, origin: EndpointId, reason: &str) -> bool {
        if !self.abort.raise(origin, reason.to_string()) {
            return false;
        }
        log::error!(
            "[node] endpoint {} aborting the run: {}",
            origin,
            reason
        );
        let header = WireHeader::new(MessageTag::Abort, origin, 0);
        let frame = match wire::frame(header, reason.as_bytes()) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("[node] could not encode abort frame: {}", e);
                return true;
            }
        };
        for dest in 0..self.topology.endpoints() {
            if self.topology.node_of(dest) == self.node {
                continue;
            }
            if let Err(e) = self.transport.send(dest, frame.clone()) {
                log::warn!("[node] abort notice to endpoint {} failed: {}", dest, e);
            }
        }
        true
    }
}
