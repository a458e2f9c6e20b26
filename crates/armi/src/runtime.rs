// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Run launcher.
//!
//! [`Runtime::run`] hosts every node of the run inside this process, one
//! scoped thread per endpoint. [`Runtime::run_node`] hosts a single node and
//! leaves the other nodes to other processes sharing the same transport mesh.
//!
//! Each endpoint executes `fence, f(&endpoint), fence`. The first failure on
//! any endpoint aborts the whole run, so no endpoint is left waiting in a fence.
//!
//! # Example
//!
//! ```rust,no_run
//! use armi::{ReduceRoot, Runtime};
//!
//! fn main() -> armi::Result<()> {
//!     let sums = Runtime::builder()
//!         .nodes(2)
//!         .workers_per_node(2)
//!         .build()?
//!         .run(|ep| ep.reduce(ep.id() as u64, |a, b| a + b, true, ReduceRoot::All))?;
//!     assert!(sums.iter().all(|s| *s == Some(6)));
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::thread;

use crate::config::RuntimeConfig;
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::node::{NodeShared, Topology};
use crate::transport::{ChannelTransport, TcpTransport, Transport, TransportKind, TransportPolicy};
use crate::EndpointId;

/// Builder for [`Runtime`].
#[derive(Clone, Debug, Default)]
pub struct RuntimeBuilder {
    nodes: Option<usize>,
    workers_per_node: Option<usize>,
    transport: TransportKind,
    policy: TransportPolicy,
    config: Option<RuntimeConfig>,
}

impl RuntimeBuilder {
    /// Number of nodes (address spaces). Default 1.
    pub fn nodes(mut self, nodes: usize) -> Self {
        self.nodes = Some(nodes);
        self
    }

    /// Workers per node. Defaults to the configuration's value.
    pub fn workers_per_node(mut self, workers: usize) -> Self {
        self.workers_per_node = Some(workers);
        self
    }

    pub fn transport(mut self, kind: TransportKind) -> Self {
        self.transport = kind;
        self
    }

    pub fn policy(mut self, policy: TransportPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Base configuration. Defaults to [`RuntimeConfig::from_env`].
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn build(self) -> Result<Runtime> {
        let mut config = self.config.unwrap_or_else(RuntimeConfig::from_env);
        if let Some(workers) = self.workers_per_node {
            config.workers_per_node = workers;
        }
        config.validate()?;
        let nodes = self.nodes.unwrap_or(1);
        if nodes == 0 {
            return Err(Error::Config {
                reason: "a run needs at least one node".into(),
            });
        }
        let topology = Topology::new(nodes, config.workers_per_node);
        if u32::try_from(topology.endpoints()).is_err() {
            return Err(Error::Config {
                reason: format!("{} endpoints exceed the 32-bit id space", topology.endpoints()),
            });
        }
        Ok(Runtime {
            topology,
            transport: self.transport,
            policy: self.policy,
            config,
        })
    }
}

/// A configured run.
#[derive(Clone, Debug)]
pub struct Runtime {
    topology: Topology,
    transport: TransportKind,
    policy: TransportPolicy,
    config: RuntimeConfig,
}

struct Outcome<R> {
    id: EndpointId,
    result: Result<R>,
    trace: Option<Vec<&'static str>>,
}

impl Runtime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::default()
    }

    pub fn topology(&self) -> Topology {
        self.topology
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Run `f` on every endpoint of every node in this process.
    ///
    /// Returns the results ordered by endpoint id.
    pub fn run<R, F>(&self, f: F) -> Result<Vec<R>>
    where
        F: Fn(&Endpoint) -> Result<R> + Sync,
        R: Send,
    {
        let transports = self.transports()?;
        let nodes = transports
            .iter()
            .enumerate()
            .map(|(node, transport)| self.node_shared(node, Arc::clone(transport)))
            .collect::<Result<Vec<_>>>()?;

        log::debug!(
            "[runtime] run: {} nodes x {} workers over {:?}",
            self.topology.nodes(),
            self.topology.workers(),
            self.transport
        );
        let outcomes = launch(&nodes, &f);
        for transport in &transports {
            transport.shutdown();
        }
        self.settle(outcomes)
    }

    /// Run `f` on the workers of `node` only, over a transport that reaches
    /// the endpoints of every node.
    ///
    /// Returns this node's results ordered by worker.
    pub fn run_node<R, F>(&self, node: usize, transport: Arc<dyn Transport>, f: F) -> Result<Vec<R>>
    where
        F: Fn(&Endpoint) -> Result<R> + Sync,
        R: Send,
    {
        let shared = self.node_shared(node, Arc::clone(&transport))?;
        log::debug!(
            "[runtime] node {} of {}: {} workers over {:?}",
            node,
            self.topology.nodes(),
            self.topology.workers(),
            transport.kind()
        );
        let outcomes = launch(std::slice::from_ref(&shared), &f);
        transport.shutdown();
        self.settle(outcomes)
    }

    fn transports(&self) -> Result<Vec<Arc<dyn Transport>>> {
        match self.transport {
            TransportKind::Channel => {
                let mesh: Arc<dyn Transport> =
                    Arc::new(ChannelTransport::new(self.topology.endpoints()));
                Ok(vec![mesh; self.topology.nodes()])
            }
            TransportKind::Tcp => Ok(TcpTransport::loopback_mesh(
                self.topology,
                self.config.max_message_size,
            )?
            .into_iter()
            .map(|transport| transport as Arc<dyn Transport>)
            .collect()),
        }
    }

    fn node_shared(&self, node: usize, transport: Arc<dyn Transport>) -> Result<Arc<NodeShared>> {
        NodeShared::new(
            node,
            self.topology,
            self.config.clone(),
            self.policy,
            transport,
        )
        .map(Arc::new)
    }

    /// Fold per-endpoint outcomes into the run result.
    ///
    /// A root-cause error wins over the `Aborted` errors it caused.
    fn settle<R>(&self, outcomes: Vec<Outcome<R>>) -> Result<Vec<R>> {
        let mut values = Vec::with_capacity(outcomes.len());
        let mut root_cause = None;
        let mut secondary = None;
        let mut traces = Vec::new();
        for outcome in outcomes {
            match outcome.result {
                Ok(value) => values.push(value),
                Err(err @ Error::Aborted { .. }) => {
                    secondary.get_or_insert(err);
                }
                Err(err) => {
                    log::debug!("[runtime] endpoint {} failed: {}", outcome.id, err);
                    root_cause.get_or_insert(err);
                }
            }
            if let Some(trace) = outcome.trace {
                traces.push((outcome.id, trace));
            }
        }
        if let Some(err) = root_cause.or(secondary) {
            return Err(err);
        }
        if self.config.trace_registration {
            check_traces(&traces)?;
        }
        Ok(values)
    }
}

/// Spawn one scoped thread per endpoint of `nodes` and join them in order.
fn launch<R, F>(nodes: &[Arc<NodeShared>], f: &F) -> Vec<Outcome<R>>
where
    F: Fn(&Endpoint) -> Result<R> + Sync,
    R: Send,
{
    thread::scope(|scope| {
        let mut handles = Vec::new();
        for shared in nodes {
            let topology = shared.topology();
            for worker in 0..topology.workers() {
                let id = topology.endpoint(shared.node(), worker);
                let node = Arc::clone(shared);
                let spawned = thread::Builder::new()
                    .name(format!("armi-ep-{}", id))
                    .spawn_scoped(scope, move || run_endpoint(id, node, f));
                match spawned {
                    Ok(handle) => handles.push((id, Ok(handle))),
                    Err(e) => {
                        shared.abort_run(id, &format!("could not spawn endpoint thread: {}", e));
                        handles.push((id, Err(Error::Io(e))));
                    }
                }
            }
        }
        handles
            .into_iter()
            .map(|(id, handle)| match handle {
                Ok(handle) => handle.join().unwrap_or_else(|_| Outcome {
                    id,
                    result: Err(Error::Aborted {
                        origin: id,
                        reason: String::from("endpoint thread panicked"),
                    }),
                    trace: None,
                }),
                Err(err) => Outcome {
                    id,
                    result: Err(err),
                    trace: None,
                },
            })
            .collect()
    })
}

/// Raises the run-wide abort if the endpoint thread unwinds.
struct AbortOnPanic<'a> {
    shared: &'a NodeShared,
    id: EndpointId,
}

impl Drop for AbortOnPanic<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.shared.abort_run(self.id, "endpoint panicked");
        }
    }
}

fn run_endpoint<R, F>(id: EndpointId, shared: Arc<NodeShared>, f: &F) -> Outcome<R>
where
    F: Fn(&Endpoint) -> Result<R>,
{
    let _guard = AbortOnPanic {
        shared: &shared,
        id,
    };
    let endpoint = match Endpoint::new(id, Arc::clone(&shared)) {
        Ok(endpoint) => endpoint,
        Err(err) => {
            shared.abort_run(id, &err.to_string());
            return Outcome {
                id,
                result: Err(err),
                trace: None,
            };
        }
    };

    let result = endpoint
        .fence()
        .and_then(|_| f(&endpoint).map_err(|e| endpoint.abort_on(e)))
        .and_then(|value| endpoint.fence().map(|_| value));
    let trace = endpoint.registration_trace();
    log::debug!(
        "[endpoint] {} stopped ({})",
        id,
        if result.is_ok() { "ok" } else { "failed" }
    );
    Outcome { id, result, trace }
}

fn check_traces(traces: &[(EndpointId, Vec<&'static str>)]) -> Result<()> {
    let Some((first_id, first)) = traces.first() else {
        return Ok(());
    };
    for (id, trace) in &traces[1..] {
        if trace != first {
            return Err(Error::Config {
                reason: format!(
                    "registration order differs: endpoint {} registered {:?}, endpoint {} registered {:?}",
                    first_id, first, id, trace
                ),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_validates_shape() {
        assert!(matches!(
            Runtime::builder()
                .nodes(0)
                .config(RuntimeConfig::default())
                .build(),
            Err(Error::Config { .. })
        ));
        assert!(matches!(
            Runtime::builder()
                .workers_per_node(0)
                .config(RuntimeConfig::default())
                .build(),
            Err(Error::Config { .. })
        ));
        let runtime = Runtime::builder()
            .nodes(3)
            .workers_per_node(2)
            .config(RuntimeConfig::default())
            .build()
            .expect("valid runtime");
        assert_eq!(runtime.topology().endpoints(), 6);
        assert_eq!(runtime.config().workers_per_node, 2);
    }

    #[test]
    fn test_results_ordered_by_endpoint() {
        let runtime = Runtime::builder()
            .nodes(2)
            .workers_per_node(3)
            .config(RuntimeConfig::default())
            .build()
            .expect("runtime");
        let ids = runtime.run(|ep| Ok(ep.id())).expect("run");
        assert_eq!(ids, (0..6).collect::<Vec<_>>());
    }

    #[test]
    fn test_root_cause_beats_aborted() {
        let runtime = Runtime::builder()
            .nodes(2)
            .workers_per_node(2)
            .config(RuntimeConfig::default())
            .build()
            .expect("runtime");
        let result = runtime.run(|ep| {
            if ep.id() == 3 {
                return Err(Error::Config {
                    reason: "endpoint 3 gave up".into(),
                });
            }
            ep.fence().map(drop)
        });
        match result {
            Err(Error::Config { reason }) => assert!(reason.contains("gave up")),
            other => panic!("expected root cause, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_trace_mismatch_reported() {
        let traces = vec![(0, vec!["a", "b"]), (1, vec!["a", "c"])];
        assert!(matches!(check_traces(&traces), Err(Error::Config { .. })));
        assert!(check_traces(&traces[..1]).is_ok());
        assert!(check_traces(&[]).is_ok());
    }
}
