// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Runtime configuration - single source of truth for every tunable.
//!
//! # Architecture
//!
//! - **Level 1 (Static)**: compile-time constants (buffer sizes, tree fan-out, caps)
//! - **Level 2 (Dynamic)**: [`RuntimeConfig`], built in code or read from `ARMI_*`
//!   environment variables with [`RuntimeConfig::from_env`]
//!
//! # Example
//!
//! ```ignore
//! use armi::config::{FenceTopology, RuntimeConfig};
//!
//! let config = RuntimeConfig::from_env()
//!     .with_aggregation(32)
//!     .with_fence_topology(FenceTopology::Binary);
//! config.validate()?;
//! ```

use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

// =======================================================================
// Buffers
// =======================================================================

/// Capacity of one aggregation section, wire header reserve included.
pub const SECTION_CAPACITY: usize = 8 * 1024;

/// Hard ceiling for any single carrier (section, large request or reply).
///
/// Requests above this size fail with `PayloadTooLarge`.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Sections allocated per destination up front. More are added on demand.
pub const INITIAL_SECTIONS: usize = 4;

/// Initial capacity of the reply carrier handed to a synchronous call.
pub const DEFAULT_REPLY_CAPACITY: usize = 256;

/// Inbound ring slots per worker thread of a node.
pub const INBOUND_SLOTS_PER_WORKER: usize = 1000;

// =======================================================================
// Registry
// =======================================================================

/// Initial object registry capacity. Grows by doubling.
pub const INITIAL_REGISTRY_CAPACITY: usize = 20;

// =======================================================================
// Dispatch & Progress
// =======================================================================

/// Maximum number of requests executing on one endpoint's stack at once.
///
/// Each synchronous call made from inside a handler adds one level.
pub const MAX_NESTING_DEPTH: usize = 64;

/// Busy-wait iterations before a waiting loop starts yielding the CPU.
pub const SPIN_LIMIT: u32 = 100;

/// Default number of requests batched per section before a forced flush.
pub const DEFAULT_AGGREGATION: u32 = 1;

/// Default number of RMI calls between implicit polls.
pub const DEFAULT_POLL_RATE: u32 = 1;

// =======================================================================
// Fence
// =======================================================================

/// Waves a single fence may run before the protocol is declared stuck.
pub const FENCE_ITERATION_CAP: u32 = 1000;

/// Fan-out of the shared-memory fence tree (children of `w` are `4w+1..=4w+4`).
pub const INTRA_NODE_FAN_OUT: usize = 4;

/// Upper bound on children per node in the inter-node release tree.
pub const INTER_NODE_MAX_KIDS: usize = 7;

// =======================================================================
// Environment
// =======================================================================

/// Worker threads per process.
pub const ENV_NUM_WORKERS: &str = "ARMI_NUM_WORKERS";
/// Aggregation threshold override.
pub const ENV_AGGREGATION: &str = "ARMI_AGGREGATION";
/// Poll rate override.
pub const ENV_POLL_RATE: &str = "ARMI_POLL_RATE";
/// Inter-node fence tree (`hypercube`, `binary`, `flat`).
pub const ENV_FENCE_TOPOLOGY: &str = "ARMI_FENCE_TOPOLOGY";
/// Set to `1` to record and compare registration traces.
pub const ENV_TRACE_REGISTRATION: &str = "ARMI_TRACE_REGISTRATION";

/// Shape of the tree connecting node leaders during a fence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum FenceTopology {
    /// Binomial tree: parent clears the lowest set bit.
    #[default]
    Hypercube,
    /// Binary heap layout: children `2n+1`, `2n+2`.
    Binary,
    /// Wide tree with [`INTER_NODE_MAX_KIDS`] children per node.
    Flat,
}

impl FromStr for FenceTopology {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hypercube" | "binomial" => Ok(Self::Hypercube),
            "binary" => Ok(Self::Binary),
            "flat" => Ok(Self::Flat),
            other => Err(Error::Config {
                reason: format!("unknown fence topology '{}'", other),
            }),
        }
    }
}

/// Dynamic runtime configuration.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// Worker threads per node (process).
    pub workers_per_node: usize,
    /// Bytes per aggregation section.
    pub section_capacity: usize,
    /// Sections allocated per destination before growth.
    pub initial_sections: usize,
    /// Hard ceiling for a single carrier.
    pub max_message_size: usize,
    /// Initial reply carrier size for synchronous calls.
    pub reply_capacity: usize,
    /// Inbound ring slots per worker; the ring holds `workers * slots`.
    pub inbound_slots_per_worker: usize,
    /// Maximum nested dispatch depth.
    pub max_nesting_depth: usize,
    /// Maximum fence waves per fence call.
    pub fence_iteration_cap: u32,
    /// Inter-node fence tree.
    pub fence_topology: FenceTopology,
    /// Optional watchdog for a single fence wait.
    pub fence_stall_timeout: Option<Duration>,
    /// Requests per section before a proactive flush.
    pub aggregation: u32,
    /// RMI calls between implicit polls.
    pub poll_rate: u32,
    /// Record registration order for post-run comparison.
    pub trace_registration: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers_per_node: 1,
            section_capacity: SECTION_CAPACITY,
            initial_sections: INITIAL_SECTIONS,
            max_message_size: MAX_MESSAGE_SIZE,
            reply_capacity: DEFAULT_REPLY_CAPACITY,
            inbound_slots_per_worker: INBOUND_SLOTS_PER_WORKER,
            max_nesting_depth: MAX_NESTING_DEPTH,
            fence_iteration_cap: FENCE_ITERATION_CAP,
            fence_topology: FenceTopology::default(),
            fence_stall_timeout: None,
            aggregation: DEFAULT_AGGREGATION,
            poll_rate: DEFAULT_POLL_RATE,
            trace_registration: false,
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by any valid `ARMI_*` variable.
    ///
    /// Malformed values are logged and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(n) = env_parse::<usize>(ENV_NUM_WORKERS) {
            if n == 0 {
                log::warn!("[config] {}=0 ignored, keeping 1 worker", ENV_NUM_WORKERS);
            } else {
                config.workers_per_node = n;
            }
        }
        if let Some(n) = env_parse::<u32>(ENV_AGGREGATION) {
            config.aggregation = n.max(1);
        }
        if let Some(n) = env_parse::<u32>(ENV_POLL_RATE) {
            config.poll_rate = n.max(1);
        }
        if let Some(topology) = env_parse::<FenceTopology>(ENV_FENCE_TOPOLOGY) {
            config.fence_topology = topology;
        }
        if let Ok(value) = std::env::var(ENV_TRACE_REGISTRATION) {
            config.trace_registration = matches!(value.trim(), "1" | "true" | "yes");
        }
        log::debug!(
            "[config] workers={} aggregation={} poll_rate={} topology={:?}",
            config.workers_per_node,
            config.aggregation,
            config.poll_rate,
            config.fence_topology
        );
        config
    }

    pub fn with_workers_per_node(mut self, workers: usize) -> Self {
        self.workers_per_node = workers;
        self
    }

    pub fn with_section_capacity(mut self, bytes: usize) -> Self {
        self.section_capacity = bytes;
        self
    }

    pub fn with_max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = bytes;
        self
    }

    pub fn with_reply_capacity(mut self, bytes: usize) -> Self {
        self.reply_capacity = bytes;
        self
    }

    pub fn with_max_nesting_depth(mut self, depth: usize) -> Self {
        self.max_nesting_depth = depth;
        self
    }

    pub fn with_fence_topology(mut self, topology: FenceTopology) -> Self {
        self.fence_topology = topology;
        self
    }

    pub fn with_fence_stall_timeout(mut self, timeout: Duration) -> Self {
        self.fence_stall_timeout = Some(timeout);
        self
    }

    pub fn with_aggregation(mut self, requests: u32) -> Self {
        self.aggregation = requests;
        self
    }

    pub fn with_poll_rate(mut self, calls: u32) -> Self {
        self.poll_rate = calls;
        self
    }

    pub fn with_trace_registration(mut self, enabled: bool) -> Self {
        self.trace_registration = enabled;
        self
    }

    /// Inbound ring capacity for one worker's queue.
    pub fn inbound_capacity(&self) -> usize {
        self.workers_per_node
            .max(1)
            .saturating_mul(self.inbound_slots_per_worker)
    }

    /// Reject combinations the runtime cannot operate with.
    pub fn validate(&self) -> Result<()> {
        let fail = |reason: String| Err(Error::Config { reason });
        if self.workers_per_node == 0 {
            return fail("workers_per_node must be at least 1".into());
        }
        if self.section_capacity < crate::transport::wire::WIRE_HEADER_SIZE
            + crate::request::REQUEST_HEADER_SIZE
        {
            return fail(format!(
                "section_capacity {} cannot hold a single request",
                self.section_capacity
            ));
        }
        if self.section_capacity > self.max_message_size {
            return fail(format!(
                "section_capacity {} exceeds max_message_size {}",
                self.section_capacity, self.max_message_size
            ));
        }
        if self.max_message_size > u32::MAX as usize {
            return fail("max_message_size must fit in 32 bits".into());
        }
        if self.initial_sections == 0 {
            return fail("initial_sections must be at least 1".into());
        }
        if self.inbound_slots_per_worker == 0 {
            return fail("inbound_slots_per_worker must be at least 1".into());
        }
        if self.max_nesting_depth == 0 {
            return fail("max_nesting_depth must be at least 1".into());
        }
        if self.fence_iteration_cap < 2 {
            return fail("fence_iteration_cap must allow two waves".into());
        }
        if self.aggregation == 0 || self.poll_rate == 0 {
            return fail("aggregation and poll_rate must be at least 1".into());
        }
        Ok(())
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let value = std::env::var(name).ok()?;
    match value.trim().parse::<T>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            log::warn!("[config] ignoring malformed {}='{}'", name, value);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = RuntimeConfig::default();
        config.validate().expect("default config should validate");
        assert_eq!(config.aggregation, DEFAULT_AGGREGATION);
        assert_eq!(config.inbound_capacity(), INBOUND_SLOTS_PER_WORKER);
    }

    #[test]
    fn test_inbound_capacity_scales_with_workers() {
        let config = RuntimeConfig::default().with_workers_per_node(4);
        assert_eq!(config.inbound_capacity(), 4 * INBOUND_SLOTS_PER_WORKER);
    }

    #[test]
    fn test_validate_rejects_tiny_sections() {
        let config = RuntimeConfig::default().with_section_capacity(8);
        assert!(matches!(config.validate(), Err(Error::Config { .. })));
    }

    #[test]
    fn test_validate_rejects_section_above_ceiling() {
        let config = RuntimeConfig::default()
            .with_section_capacity(4096)
            .with_max_message_size(1024);
        assert!(matches!(config.validate(), Err(Error::Config { .. })));
    }

    #[test]
    fn test_validate_rejects_zero_aggregation() {
        let config = RuntimeConfig::default().with_aggregation(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_fence_topology_parse() {
        assert_eq!(
            "Binary".parse::<FenceTopology>().expect("parse binary"),
            FenceTopology::Binary
        );
        assert_eq!(
            " hypercube ".parse::<FenceTopology>().expect("parse hypercube"),
            FenceTopology::Hypercube
        );
        assert_eq!(
            "flat".parse::<FenceTopology>().expect("parse flat"),
            FenceTopology::Flat
        );
        assert!("ring".parse::<FenceTopology>().is_err());
    }
}
