// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Route selection.
//!
//! Call sites never branch on locality: every call asks the selector for a
//! [`Route`] and the endpoint follows it.

use crate::node::Topology;
use crate::EndpointId;

/// How a request reaches its destination.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Route {
    /// Destination is the caller: typed call, no marshaling.
    Direct,
    /// Same node: sections are handed over through the inbound queue.
    SharedMemory,
    /// Different node (or forced): frames through the transport.
    MessagePassing,
}

/// Whether endpoints of one node may share memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TransportPolicy {
    /// Shared memory within a node, message passing across nodes.
    #[default]
    Hybrid,
    /// Message passing for every endpoint other than self.
    MessagePassingOnly,
}

/// Per-endpoint route table.
#[derive(Clone, Copy, Debug)]
pub struct TransportSelector {
    me: EndpointId,
    topology: Topology,
    policy: TransportPolicy,
}

impl TransportSelector {
    pub fn new(me: EndpointId, topology: Topology, policy: TransportPolicy) -> Self {
        Self {
            me,
            topology,
            policy,
        }
    }

    /// `endpoint` lives in this address space.
    pub fn is_local(&self, endpoint: EndpointId) -> bool {
        self.topology.node_of(endpoint) == self.topology.node_of(self.me)
    }

    pub fn select_route(&self, dest: EndpointId) -> Route {
        if dest == self.me {
            return Route::Direct;
        }
        match self.policy {
            TransportPolicy::Hybrid if self.is_local(dest) => Route::SharedMemory,
            _ => Route::MessagePassing,
        }
    }

    pub fn policy(&self) -> TransportPolicy {
        self.policy
    }
}
