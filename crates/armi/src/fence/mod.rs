// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fence: a barrier that also drains every in-flight request.
//!
//! # Protocol
//!
//! A fence runs in waves. In each wave every endpoint flushes its outgoing
//! sections and reports its cumulative `(sent, received)` counters up a
//! spanning tree:
//!
//! 1. **Intra-node**: workers arrive at their parent through an atomic bitmap
//!    (fan-out 4); the node leader (worker 0) holds the node subtotal.
//! 2. **Inter-node**: leaders exchange `FENCE_ARRIVAL` frames up the
//!    configured tree to node 0.
//! 3. The root decides the wave and sends `FENCE_RELEASE` back down; each
//!    leader publishes it to its workers by flipping the node sense bit.
//!
//! A wave is *settled* when the global `sent == received` and the totals
//! equal those of the previous wave: nothing was sent or dispatched between
//! the two snapshots, so the zero balance is consistent. A fence therefore
//! runs at least two waves. Every wait drains inbound requests, so handlers
//! that issue new requests during the fence are simply counted in the next
//! wave.

pub mod tree;

pub use tree::InterNodeTree;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::marshal;
use crate::node::Waiter;
use crate::transport::MessageTag;
use crate::EndpointId;

/// Cumulative request credit of one endpoint or subtree.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Tally {
    pub sent: u64,
    pub received: u64,
}

impl Tally {
    pub const fn new(sent: u64, received: u64) -> Self {
        Self { sent, received }
    }

    pub fn merge(self, other: Tally) -> Tally {
        Tally {
            sent: self.sent + other.sent,
            received: self.received + other.received,
        }
    }

    /// `sent - received`.
    pub fn balance(&self) -> i64 {
        self.sent as i64 - self.received as i64
    }
}

/// `FENCE_ARRIVAL` body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FenceTally {
    pub epoch: u64,
    pub sent: u64,
    pub received: u64,
}

crate::marshal_struct!(FenceTally {
    epoch: u64,
    sent: u64,
    received: u64,
});

/// `FENCE_RELEASE` body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FenceRelease {
    pub epoch: u64,
    pub sent: u64,
    pub received: u64,
    pub settled: bool,
}

crate::marshal_struct!(FenceRelease {
    epoch: u64,
    sent: u64,
    received: u64,
    settled: bool,
});

/// Position of an endpoint within the current wave.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FenceState {
    WaitingChildren,
    Aggregating,
    WaitingParentRelease,
    Releasing,
    Done,
}

/// Result of one wave, identical on every endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WaveOutcome {
    pub epoch: u64,
    pub totals: Tally,
    pub settled: bool,
}

impl WaveOutcome {
    const NONE: WaveOutcome = WaveOutcome {
        epoch: 0,
        totals: Tally::new(0, 0),
        settled: false,
    };

    fn from_release(release: FenceRelease) -> Self {
        Self {
            epoch: release.epoch,
            totals: Tally::new(release.sent, release.received),
            settled: release.settled,
        }
    }

    fn to_release(self) -> FenceRelease {
        FenceRelease {
            epoch: self.epoch,
            sent: self.totals.sent,
            received: self.totals.received,
            settled: self.settled,
        }
    }
}

/// Shared-memory tier of the fence for one node.
pub struct IntraNodeFence {
    workers: usize,
    arrivals: Vec<AtomicU32>,
    subtotals: Vec<Mutex<Tally>>,
    sense: AtomicBool,
    release: Mutex<WaveOutcome>,
}

impl IntraNodeFence {
    pub fn new(workers: usize) -> Self {
        Self {
            workers,
            arrivals: (0..workers).map(|_| AtomicU32::new(0)).collect(),
            subtotals: (0..workers).map(|_| Mutex::new(Tally::default())).collect(),
            sense: AtomicBool::new(false),
            release: Mutex::new(WaveOutcome::NONE),
        }
    }

    /// Report `worker`'s subtree total to its parent.
    pub fn arrive(&self, worker: usize, subtotal: Tally) {
        *self.subtotals[worker].lock() = subtotal;
        let parent = tree::intra_parent(worker);
        let bit = 1u32 << tree::intra_child_index(worker);
        self.arrivals[parent].fetch_or(bit, Ordering::AcqRel);
    }

    pub fn children_arrived(&self, worker: usize) -> bool {
        self.arrivals[worker].load(Ordering::Acquire) == tree::intra_child_mask(worker, self.workers)
    }

    /// Sum of the children's subtotals. Clears the arrival bitmap.
    pub fn collect(&self, worker: usize) -> Tally {
        let total = tree::intra_children(worker, self.workers)
            .map(|child| *self.subtotals[child].lock())
            .fold(Tally::default(), Tally::merge);
        self.arrivals[worker].store(0, Ordering::Release);
        total
    }

    /// Publish the wave outcome to every worker of the node.
    pub fn publish(&self, outcome: WaveOutcome) {
        *self.release.lock() = outcome;
        let sense = self.sense.load(Ordering::Acquire);
        self.sense.store(!sense, Ordering::Release);
    }

    /// The published outcome once the sense bit reads `expected`.
    pub fn released(&self, expected: bool) -> Option<WaveOutcome> {
        if self.sense.load(Ordering::Acquire) == expected {
            Some(*self.release.lock())
        } else {
            None
        }
    }
}

/// Fence control frame received by a node leader.
#[derive(Clone, Debug)]
pub struct ControlFrame {
    pub tag: MessageTag,
    pub source: EndpointId,
    pub body: Vec<u8>,
}

/// What the coordinator needs from its endpoint.
pub trait FenceHost {
    /// Drain inbound requests and pump the transport.
    fn progress(&self) -> Result<()>;

    /// Flush outgoing sections, then report cumulative counters.
    fn settle_tally(&self) -> Result<Tally>;

    /// Next fence frame received by this endpoint.
    fn next_control(&self) -> Option<ControlFrame>;

    /// Send a fence frame to the leader of `node`.
    fn send_control(&self, node: usize, tag: MessageTag, body: Vec<u8>) -> Result<()>;
}

/// Progress-driven wait with an optional stall deadline.
struct StallWatch {
    waiter: Waiter,
    started: Instant,
    limit: Option<Duration>,
}

impl StallWatch {
    fn new(limit: Option<Duration>) -> Self {
        Self {
            waiter: Waiter::new(),
            started: Instant::now(),
            limit,
        }
    }

    fn pause(&mut self, epoch: u64, what: &str) -> Result<()> {
        if let Some(limit) = self.limit {
            if self.started.elapsed() > limit {
                return Err(Error::fence(format!(
                    "wave {} stalled for {:?} waiting for {}",
                    epoch, limit, what
                )));
            }
        }
        self.waiter.pause();
        Ok(())
    }
}

/// Per-endpoint fence driver.
pub struct FenceCoordinator {
    worker: usize,
    node: usize,
    tree: InterNodeTree,
    state: FenceState,
    sense: bool,
    epoch: u64,
    previous: Option<Tally>,
    cap: u32,
    stall: Option<Duration>,
    completed: u64,
}

impl FenceCoordinator {
    pub fn new(
        worker: usize,
        node: usize,
        tree: InterNodeTree,
        cap: u32,
        stall: Option<Duration>,
    ) -> Self {
        Self {
            worker,
            node,
            tree,
            state: FenceState::Done,
            sense: false,
            epoch: 0,
            previous: None,
            cap,
            stall,
            completed: 0,
        }
    }

    pub fn state(&self) -> FenceState {
        self.state
    }

    /// Waves run since start.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Fences completed since start.
    pub fn completed(&self) -> u64 {
        self.completed
    }

    /// Run waves until one settles. Returns the final global totals.
    pub fn run(&mut self, host: &dyn FenceHost, intra: &IntraNodeFence) -> Result<Tally> {
        self.previous = None;
        for wave in 1..=self.cap {
            let outcome = self.wave(host, intra)?;
            log::trace!(
                "[fence] worker {} node {} wave {} (epoch {}): sent={} received={} settled={}",
                self.worker,
                self.node,
                wave,
                outcome.epoch,
                outcome.totals.sent,
                outcome.totals.received,
                outcome.settled
            );
            if outcome.settled {
                self.completed += 1;
                if self.worker == 0 && self.node == 0 {
                    log::debug!(
                        "[fence] fence {} settled after {} waves ({} requests total)",
                        self.completed,
                        wave,
                        outcome.totals.sent
                    );
                }
                return Ok(outcome.totals);
            }
        }
        Err(Error::fence(format!(
            "no quiescence after {} waves (epoch {})",
            self.cap, self.epoch
        )))
    }

    fn wave(&mut self, host: &dyn FenceHost, intra: &IntraNodeFence) -> Result<WaveOutcome> {
        self.epoch += 1;
        let epoch = self.epoch;
        let mut watch = StallWatch::new(self.stall);

        self.state = FenceState::WaitingChildren;
        while !intra.children_arrived(self.worker) {
            host.progress()?;
            watch.pause(epoch, "intra-node children")?;
        }

        self.state = FenceState::Aggregating;
        let subtotal = host.settle_tally()?.merge(intra.collect(self.worker));

        let outcome = if self.worker != 0 {
            intra.arrive(self.worker, subtotal);
            self.state = FenceState::WaitingParentRelease;
            let expected = !self.sense;
            loop {
                if let Some(outcome) = intra.released(expected) {
                    break outcome;
                }
                host.progress()?;
                watch.pause(epoch, "node release")?;
            }
        } else {
            let outcome = self.inter_node(host, epoch, subtotal, &mut watch)?;
            self.state = FenceState::Releasing;
            intra.publish(outcome);
            outcome
        };

        if outcome.epoch != epoch {
            return Err(Error::fence(format!(
                "released epoch {} while in epoch {}",
                outcome.epoch, epoch
            )));
        }
        self.sense = !self.sense;
        self.state = FenceState::Done;
        Ok(outcome)
    }

    fn inter_node(
        &mut self,
        host: &dyn FenceHost,
        epoch: u64,
        mut subtotal: Tally,
        watch: &mut StallWatch,
    ) -> Result<WaveOutcome> {
        let children = self.tree.children(self.node);
        let mut pending = children.len();
        while pending > 0 {
            match host.next_control() {
                Some(frame) if frame.tag == MessageTag::FenceArrival => {
                    let tally: FenceTally = marshal::unpack_from(&frame.body)?;
                    check_epoch(tally.epoch, epoch, frame.source)?;
                    subtotal = subtotal.merge(Tally::new(tally.sent, tally.received));
                    pending -= 1;
                }
                Some(frame) => return Err(unexpected(&frame, "arrivals")),
                None => {
                    host.progress()?;
                    watch.pause(epoch, "child node arrivals")?;
                }
            }
        }

        let outcome = match self.tree.parent(self.node) {
            None => {
                let settled = subtotal.balance() == 0 && self.previous == Some(subtotal);
                self.previous = Some(subtotal);
                WaveOutcome {
                    epoch,
                    totals: subtotal,
                    settled,
                }
            }
            Some(parent) => {
                let arrival = FenceTally {
                    epoch,
                    sent: subtotal.sent,
                    received: subtotal.received,
                };
                host.send_control(
                    parent,
                    MessageTag::FenceArrival,
                    marshal::to_bytes(&arrival, usize::MAX)?,
                )?;
                self.state = FenceState::WaitingParentRelease;
                loop {
                    match host.next_control() {
                        Some(frame) if frame.tag == MessageTag::FenceRelease => {
                            let release: FenceRelease = marshal::unpack_from(&frame.body)?;
                            check_epoch(release.epoch, epoch, frame.source)?;
                            break WaveOutcome::from_release(release);
                        }
                        Some(frame) => return Err(unexpected(&frame, "release")),
                        None => {
                            host.progress()?;
                            watch.pause(epoch, "parent node release")?;
                        }
                    }
                }
            }
        };

        if !children.is_empty() {
            let body = marshal::to_bytes(&outcome.to_release(), usize::MAX)?;
            for child in children {
                host.send_control(child, MessageTag::FenceRelease, body.clone())?;
            }
        }
        Ok(outcome)
    }
}

fn check_epoch(got: u64, expected: u64, source: EndpointId) -> Result<()> {
    if got != expected {
        return Err(Error::fence(format!(
            "endpoint {} sent epoch {}, expected {}",
            source, got, expected
        )));
    }
    Ok(())
}

fn unexpected(frame: &ControlFrame, waiting_for: &str) -> Error {
    Error::fence(format!(
        "unexpected {:?} from endpoint {} while waiting for {}",
        frame.tag, frame.source, waiting_for
    ))
}
