// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # ARMI - Adaptive Remote Method Invocation
//!
//! A runtime for SPMD programs in which every execution context (an
//! *endpoint*) can invoke methods on objects owned by any other endpoint,
//! whether it is a thread of the same process or a worker on another node.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::cell::Cell;
//! use std::rc::Rc;
//!
//! use armi::{Method, MethodTable, RemoteObject, Runtime};
//!
//! struct Counter {
//!     hits: Cell<u64>,
//! }
//!
//! impl Counter {
//!     const HIT: Method<Counter, (u64,), ()> =
//!         Method::new(1, "hit", |c, _ep, (n,)| c.hits.set(c.hits.get() + n));
//!     const GET: Method<Counter, (), u64> = Method::new(2, "get", |c, _ep, ()| c.hits.get());
//! }
//!
//! impl RemoteObject for Counter {
//!     fn methods(table: &mut MethodTable<Self>) {
//!         table.add(Self::HIT).add(Self::GET);
//!     }
//! }
//!
//! fn main() -> armi::Result<()> {
//!     let totals = Runtime::builder().nodes(2).workers_per_node(2).build()?.run(|ep| {
//!         let counters = Rc::new(Counter { hits: Cell::new(0) });
//!         let handle = ep.register_object(counters);
//!         ep.fence()?;
//!         ep.async_call((ep.id() + 1) % ep.endpoints(), handle, Counter::HIT, (1,))?;
//!         ep.fence()?;
//!         ep.sync_call(ep.id(), handle, Counter::GET, ())
//!     })?;
//!     assert!(totals.iter().all(|t| *t == 1));
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------------+
//! |              Endpoint API (async_call, sync_call, fence)            |
//! +---------------------------------------------------------------------+
//! |  Registry  |  Marshal  |  Aggregation buffers  |  Collectives       |
//! +---------------------------------------------------------------------+
//! |        Inbound queue + Drainer        |     Fence coordinator       |
//! +---------------------------------------------------------------------+
//! |   Direct    |     Shared memory       |      Message passing        |
//! |  (self)     |  (same node queues)     |  (channel / TCP frames)     |
//! +---------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Runtime`] | Launches the endpoints of a run |
//! | [`Endpoint`] | Per-thread context handed to user code and handlers |
//! | [`Handle`] | Endpoint-local object id; equal across endpoints that register in the same order |
//! | [`Method`] | Typed descriptor of a remotely invocable operation |
//! | [`Marshal`] | Argument and result encoding |

/// Reduce and broadcast.
pub mod collective;
/// Tunable constants and [`RuntimeConfig`].
pub mod config;
/// Per-thread runtime context.
pub mod endpoint;
/// Error taxonomy.
pub mod error;
/// Argument and result marshaling.
pub mod marshal;
/// Endpoint-local object handles.
pub mod registry;
/// Request encoding and method tables.
pub mod request;
/// Run launcher.
pub mod runtime;
/// Frame transports and route selection.
pub mod transport;

/// Per-destination send aggregation.
pub mod aggregation;
/// Request execution and reply carriers.
pub mod dispatch;
/// Spanning-tree barrier.
pub mod fence;
/// Inbound request queue and reentrant drain.
pub mod inbound;
/// State shared by the endpoints of one node.
pub mod node;

/// Global index of an endpoint, node-major.
pub type EndpointId = usize;

pub use collective::ReduceRoot;
pub use config::{FenceTopology, RuntimeConfig};
pub use endpoint::Endpoint;
pub use error::{Error, Result};
pub use marshal::{Marshal, MarshalError, Packing};
pub use registry::{GlobalRef, Handle};
pub use request::{Method, MethodTable, OpId, RemoteObject, RequestKind};
pub use runtime::{Runtime, RuntimeBuilder};
pub use transport::{Route, Transport, TransportKind, TransportPolicy};
