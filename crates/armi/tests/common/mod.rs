// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared remote objects and runtime helpers for the integration tests.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use armi::{
    Endpoint, Handle, Method, MethodTable, RemoteObject, Runtime, RuntimeConfig, TransportKind,
    TransportPolicy,
};

/// Run shapes exercised by most tests: (nodes, workers per node).
pub const SHAPES: [(usize, usize); 5] = [(1, 1), (1, 4), (2, 2), (4, 1), (2, 3)];

/// Shapes with at least four endpoints.
pub const WIDE_SHAPES: [(usize, usize); 3] = [(1, 4), (2, 2), (4, 1)];

/// Default configuration with a fence watchdog, so a broken run fails instead of hanging.
pub fn test_config() -> RuntimeConfig {
    RuntimeConfig::default().with_fence_stall_timeout(Duration::from_secs(60))
}

pub fn runtime(nodes: usize, workers: usize) -> Runtime {
    runtime_with(nodes, workers, TransportKind::Channel, TransportPolicy::Hybrid, test_config())
}

pub fn runtime_with(
    nodes: usize,
    workers: usize,
    transport: TransportKind,
    policy: TransportPolicy,
    config: RuntimeConfig,
) -> Runtime {
    Runtime::builder()
        .nodes(nodes)
        .workers_per_node(workers)
        .transport(transport)
        .policy(policy)
        .config(config)
        .build()
        .expect("valid runtime")
}

/// Accumulating counter.
#[derive(Default)]
pub struct Counter {
    pub value: Cell<u64>,
    pub calls: Cell<u64>,
}

impl Counter {
    pub const ADD: Method<Counter, (u64,), ()> = Method::new(1, "add", |c, _ep, (n,)| {
        c.value.set(c.value.get() + n);
        c.calls.set(c.calls.get() + 1);
    });
    pub const GET: Method<Counter, (), u64> = Method::new(2, "get", |c, _ep, ()| c.value.get());
    pub const ADD_AND_GET: Method<Counter, (u64,), u64> =
        Method::new(3, "add_and_get", |c, _ep, (n,)| {
            c.value.set(c.value.get() + n);
            c.calls.set(c.calls.get() + 1);
            c.value.get()
        });

    pub fn shared() -> Rc<Self> {
        Rc::new(Self::default())
    }
}

impl RemoteObject for Counter {
    fn methods(table: &mut MethodTable<Self>) {
        table.add(Self::ADD).add(Self::GET).add(Self::ADD_AND_GET);
    }
}

/// Records `(source, seq)` pairs in dispatch order.
#[derive(Default)]
pub struct Journal {
    pub entries: RefCell<Vec<(u64, u64)>>,
}

impl Journal {
    pub const RECORD: Method<Journal, (u64, u64), ()> =
        Method::new(1, "record", |j, _ep, (source, seq)| {
            j.entries.borrow_mut().push((source, seq));
        });

    pub fn shared() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// Sequence numbers received from `source`, in dispatch order.
    pub fn from_source(&self, source: u64) -> Vec<u64> {
        self.entries
            .borrow()
            .iter()
            .filter(|(s, _)| *s == source)
            .map(|(_, seq)| *seq)
            .collect()
    }
}

impl RemoteObject for Journal {
    fn methods(table: &mut MethodTable<Self>) {
        table.add(Self::RECORD);
    }
}

/// Value-returning operations with dynamic payloads.
#[derive(Default)]
pub struct Echo {
    pub bytes_seen: Cell<usize>,
}

impl Echo {
    pub const ECHO: Method<Echo, (String,), String> = Method::new(1, "echo", |_e, _ep, (s,)| s);
    pub const FILL: Method<Echo, (usize, u64), Vec<u64>> =
        Method::new(2, "fill", |_e, _ep, (n, v)| vec![v; n]);
    pub const SWALLOW: Method<Echo, (Vec<u8>,), ()> = Method::new(3, "swallow", |e, _ep, (b,)| {
        e.bytes_seen.set(e.bytes_seen.get() + b.len());
    });
    pub const CHECKSUM: Method<Echo, (Vec<u8>,), u64> =
        Method::new(4, "checksum", |_e, _ep, (b,)| checksum(&b));

    pub fn shared() -> Rc<Self> {
        Rc::new(Self::default())
    }
}

impl RemoteObject for Echo {
    fn methods(table: &mut MethodTable<Self>) {
        table
            .add(Self::ECHO)
            .add(Self::FILL)
            .add(Self::SWALLOW)
            .add(Self::CHECKSUM);
    }
}

/// Handler that calls back into the runtime while it runs.
#[derive(Default)]
pub struct Relay {
    pub results: RefCell<Vec<u64>>,
}

impl Relay {
    /// Synchronously bump the counter at `(owner, counter)` and keep the result.
    pub const FORWARD: Method<Relay, (u64, Handle), ()> =
        Method::new(1, "forward", |r, ep, (owner, counter)| {
            let value = ep
                .sync_call(owner as usize, counter, Counter::ADD_AND_GET, (1,))
                .expect("nested sync call");
            r.results.borrow_mut().push(value);
        });

    pub fn shared() -> Rc<Self> {
        Rc::new(Self::default())
    }
}

impl RemoteObject for Relay {
    fn methods(table: &mut MethodTable<Self>) {
        table.add(Self::FORWARD);
    }
}

pub fn checksum(bytes: &[u8]) -> u64 {
    bytes.iter().map(|b| u64::from(*b)).sum()
}

/// `0 + 1 + ... + (n - 1)`.
pub fn triangular(n: usize) -> u64 {
    (n as u64) * (n as u64).saturating_sub(1) / 2
}

/// Register one object of each test type, in a fixed order.
pub struct Objects {
    pub counter: Rc<Counter>,
    pub journal: Rc<Journal>,
    pub echo: Rc<Echo>,
    pub relay: Rc<Relay>,
    pub hc: Handle,
    pub hj: Handle,
    pub he: Handle,
    pub hr: Handle,
}

impl Objects {
    pub fn register(ep: &Endpoint) -> Self {
        let counter = Counter::shared();
        let journal = Journal::shared();
        let echo = Echo::shared();
        let relay = Relay::shared();
        Self {
            hc: ep.register_object(Rc::clone(&counter)),
            hj: ep.register_object(Rc::clone(&journal)),
            he: ep.register_object(Rc::clone(&echo)),
            hr: ep.register_object(Rc::clone(&relay)),
            counter,
            journal,
            echo,
            relay,
        }
    }
}
