// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Reduce and broadcast.
//!
//! Both collectives are bracketed by full fences, so no request of the
//! surrounding program is ever mistaken for collective traffic.
//!
//! Inside a node values move through [`CollectiveSlots`](crate::node::CollectiveSlots)
//! along a binomial tree of workers. Between nodes the leaders exchange
//! packed values through the [`CollectiveMailbox`] each endpoint keeps at
//! [`Handle::RESERVED`].

use std::cell::RefCell;

use crate::config::FenceTopology;
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::fence::InterNodeTree;
use crate::marshal::{self, Marshal};
use crate::node::Waiter;
use crate::registry::Handle;
use crate::request::{Method, MethodTable, RemoteObject};
use crate::EndpointId;

/// Where a reduction result is delivered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReduceRoot {
    /// Every endpoint receives the result.
    All,
    /// Only this endpoint receives it; the others get `None`.
    Endpoint(EndpointId),
}

struct Delivery {
    seq: u64,
    from_node: u32,
    payload: Vec<u8>,
}

/// Inbox for packed collective values sent by other nodes.
pub struct CollectiveMailbox {
    inbox: RefCell<Vec<Delivery>>,
}

impl CollectiveMailbox {
    pub const DELIVER: Method<CollectiveMailbox, (u64, u32, Vec<u8>), ()> =
        Method::new(1, "deliver", |mailbox, _ep, (seq, from_node, payload)| {
            mailbox.inbox.borrow_mut().push(Delivery {
                seq,
                from_node,
                payload,
            });
        });

    pub fn new() -> Self {
        Self {
            inbox: RefCell::new(Vec::new()),
        }
    }

    /// Deliveries not yet consumed.
    pub fn pending(&self) -> usize {
        self.inbox.borrow().len()
    }

    /// Remove the first delivery of collective `seq`, optionally from one node.
    fn take(&self, seq: u64, from_node: Option<usize>) -> Option<(usize, Vec<u8>)> {
        let mut inbox = self.inbox.borrow_mut();
        let index = inbox.iter().position(|d| {
            d.seq == seq && from_node.map_or(true, |node| d.from_node as usize == node)
        })?;
        let delivery = inbox.remove(index);
        Some((delivery.from_node as usize, delivery.payload))
    }
}

impl Default for CollectiveMailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteObject for CollectiveMailbox {
    fn methods(table: &mut MethodTable<Self>) {
        table.add(Self::DELIVER);
    }
}

impl Endpoint {
    /// Combine `input` from every endpoint with `op`.
    ///
    /// `op(a, b)` is applied with `a` covering lower endpoint ids than `b`;
    /// with `commutative` set, partials from other nodes are combined in
    /// arrival order instead. The result goes to the endpoints named by `root`.
    pub fn reduce<T, F>(
        &self,
        input: T,
        op: F,
        commutative: bool,
        root: ReduceRoot,
    ) -> Result<Option<T>>
    where
        T: Marshal + Clone + Send + 'static,
        F: Fn(&T, &T) -> T,
    {
        let result = self.reduce_inner(input, &op, commutative, root);
        result.map_err(|e| self.escalate(e))
    }

    /// Copy the root's `value` to every endpoint.
    ///
    /// Every non-root endpoint calls `apply(value, &root_value)` exactly once.
    pub fn broadcast<T, F>(&self, value: &mut T, apply: F, root: EndpointId) -> Result<()>
    where
        T: Marshal + Clone + Send + 'static,
        F: Fn(&mut T, &T),
    {
        let result = self.broadcast_inner(value, &apply, root);
        result.map_err(|e| self.escalate(e))
    }

    fn reduce_inner<T, F>(
        &self,
        input: T,
        op: &F,
        commutative: bool,
        root: ReduceRoot,
    ) -> Result<Option<T>>
    where
        T: Marshal + Clone + Send + 'static,
        F: Fn(&T, &T) -> T,
    {
        if let ReduceRoot::Endpoint(r) = root {
            self.check_root(r)?;
        }
        self.fence()?;
        let gather = self.next_collective_seq();
        let scatter = self.next_collective_seq();

        let total = match self.combine_workers(input, op)? {
            Some(node_total) => self.combine_nodes(gather, node_total, op, commutative)?,
            None => None,
        };

        let leader = self.worker() == 0;
        let result = match root {
            ReduceRoot::All => {
                let value = if leader {
                    let value = match total {
                        Some(value) => value,
                        None => self.receive_from_parent::<T>(scatter, 0)?,
                    };
                    self.forward_to_children(scatter, 0, &value)?;
                    self.shared().collective().put_result(value.clone());
                    value
                } else {
                    self.read_node_result::<T>()?
                };
                Some(value)
            }
            ReduceRoot::Endpoint(r) => {
                if let Some(value) = total {
                    if r == self.id() {
                        Some(value)
                    } else {
                        self.send_value(r, scatter, &value)?;
                        None
                    }
                } else if r == self.id() {
                    let (_, bytes) = self.await_delivery(scatter, Some(0))?;
                    Some(marshal::unpack_from(&bytes)?)
                } else {
                    None
                }
            }
        };

        self.fence()?;
        if leader && root == ReduceRoot::All {
            self.shared().collective().clear_result();
        }
        Ok(result)
    }

    fn broadcast_inner<T, F>(&self, value: &mut T, apply: &F, root: EndpointId) -> Result<()>
    where
        T: Marshal + Clone + Send + 'static,
        F: Fn(&mut T, &T),
    {
        self.check_root(root)?;
        self.fence()?;
        let seq = self.next_collective_seq();
        let topology = self.topology();
        let root_node = topology.node_of(root);
        let speaker = if self.node() == root_node {
            self.id() == root
        } else {
            self.worker() == 0
        };

        if speaker {
            let shared_value = if self.id() == root {
                value.clone()
            } else {
                self.receive_from_parent::<T>(seq, root_node)?
            };
            self.forward_to_children(seq, root_node, &shared_value)?;
            if self.id() != root {
                apply(value, &shared_value);
            }
            self.shared().collective().put_result(shared_value);
        } else {
            let shared_value = self.read_node_result::<T>()?;
            apply(value, &shared_value);
        }

        self.fence()?;
        if speaker {
            self.shared().collective().clear_result();
        }
        Ok(())
    }

    /// Binomial combine over the workers of this node. Worker 0 gets the total.
    fn combine_workers<T, F>(&self, input: T, op: &F) -> Result<Option<T>>
    where
        T: Marshal + Clone + Send + 'static,
        F: Fn(&T, &T) -> T,
    {
        let workers = self.workers_per_node();
        let worker = self.worker();
        let slots = self.shared().collective();
        let mut acc = input;
        let mut stride = 1;
        while stride < workers {
            if worker % (2 * stride) != 0 {
                slots.put_partial(worker, acc);
                return Ok(None);
            }
            let partner = worker + stride;
            if partner < workers {
                let mut waiter = Waiter::new();
                let other = loop {
                    if let Some(other) = slots.take_partial::<T>(partner)? {
                        break other;
                    }
                    self.idle(&mut waiter)?;
                };
                acc = op(&acc, &other);
            }
            stride *= 2;
        }
        Ok(Some(acc))
    }

    /// Combine node totals across leaders. Node 0's leader gets the total.
    fn combine_nodes<T, F>(
        &self,
        seq: u64,
        node_total: T,
        op: &F,
        commutative: bool,
    ) -> Result<Option<T>>
    where
        T: Marshal + Clone + Send + 'static,
        F: Fn(&T, &T) -> T,
    {
        let nodes = self.nodes();
        let node = self.node();
        let topology = self.topology();
        let mut acc = node_total;

        if commutative {
            let tree = InterNodeTree::new(nodes, FenceTopology::Hypercube);
            for _ in 0..tree.children(node).len() {
                let (_, bytes) = self.await_delivery(seq, None)?;
                let other: T = marshal::unpack_from(&bytes)?;
                acc = op(&acc, &other);
            }
            return match tree.parent(node) {
                Some(parent) => {
                    self.send_value(topology.leader(parent), seq, &acc)?;
                    Ok(None)
                }
                None => Ok(Some(acc)),
            };
        }

        let mut stride = 1;
        while stride < nodes {
            if node % (2 * stride) != 0 {
                self.send_value(topology.leader(node - stride), seq, &acc)?;
                return Ok(None);
            }
            if node + stride < nodes {
                let (_, bytes) = self.await_delivery(seq, Some(node + stride))?;
                let other: T = marshal::unpack_from(&bytes)?;
                acc = op(&acc, &other);
            }
            stride *= 2;
        }
        Ok(Some(acc))
    }

    fn receive_from_parent<T: Marshal>(&self, seq: u64, root_node: usize) -> Result<T> {
        let tree = InterNodeTree::new(self.nodes(), FenceTopology::Hypercube);
        let parent = tree.parent_rooted(self.node(), root_node);
        let (_, bytes) = self.await_delivery(seq, parent)?;
        Ok(marshal::unpack_from(&bytes)?)
    }

    fn forward_to_children<T: Marshal>(&self, seq: u64, root_node: usize, value: &T) -> Result<()> {
        let tree = InterNodeTree::new(self.nodes(), FenceTopology::Hypercube);
        let children = tree.children_rooted(self.node(), root_node);
        if children.is_empty() {
            return Ok(());
        }
        let bytes = marshal::to_bytes(value, self.config().max_message_size)?;
        let topology = self.topology();
        for child in children {
            self.send_bytes(topology.leader(child), seq, bytes.clone())?;
        }
        Ok(())
    }

    fn read_node_result<T: Clone + Send + 'static>(&self) -> Result<T> {
        let mut waiter = Waiter::new();
        loop {
            if let Some(value) = self.shared().collective().read_result::<T>()? {
                return Ok(value);
            }
            self.idle(&mut waiter)?;
        }
    }

    fn await_delivery(&self, seq: u64, from_node: Option<usize>) -> Result<(usize, Vec<u8>)> {
        let mut waiter = Waiter::new();
        loop {
            if let Some(delivery) = self.mailbox().take(seq, from_node) {
                return Ok(delivery);
            }
            self.idle(&mut waiter)?;
        }
    }

    fn send_value<T: Marshal>(&self, dest: EndpointId, seq: u64, value: &T) -> Result<()> {
        let bytes = marshal::to_bytes(value, self.config().max_message_size)?;
        self.send_bytes(dest, seq, bytes)
    }

    fn send_bytes(&self, dest: EndpointId, seq: u64, bytes: Vec<u8>) -> Result<()> {
        let from_node = u32::try_from(self.node())
            .map_err(|_| Error::transport(format!("node {} exceeds 32 bits", self.node())))?;
        self.async_call(
            dest,
            Handle::RESERVED,
            CollectiveMailbox::DELIVER,
            (seq, from_node, bytes),
        )?;
        self.flush_to(dest)
    }

    fn check_root(&self, root: EndpointId) -> Result<()> {
        if root >= self.endpoints() {
            return Err(Error::InvalidEndpoint {
                endpoint: root,
                endpoints: self.endpoints(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mailbox_matches_sequence_and_node() {
        let mailbox = CollectiveMailbox::new();
        for (seq, from_node) in [(1u64, 2u32), (2, 3), (1, 3)] {
            mailbox.inbox.borrow_mut().push(Delivery {
                seq,
                from_node,
                payload: vec![from_node as u8],
            });
        }
        assert_eq!(mailbox.take(1, Some(3)), Some((3, vec![3])));
        assert_eq!(mailbox.take(1, Some(3)), None);
        assert_eq!(mailbox.take(2, None), Some((3, vec![3])));
        assert_eq!(mailbox.pending(), 1);
        assert_eq!(mailbox.take(1, None), Some((2, vec![2])));
    }

    #[test]
    fn test_single_endpoint_collectives() {
        let ep = Endpoint::solo().expect("solo endpoint");
        let sum = ep
            .reduce(5u64, |a, b| a + b, true, ReduceRoot::All)
            .expect("reduce all");
        assert_eq!(sum, Some(5));
        let concat = |a: &Vec<u8>, b: &Vec<u8>| [a.as_slice(), b.as_slice()].concat();
        let at_root = ep
            .reduce(vec![1u8, 2], concat, false, ReduceRoot::Endpoint(0))
            .expect("reduce to root");
        assert_eq!(at_root, Some(vec![1, 2]));

        let mut value = 9u32;
        ep.broadcast(&mut value, |_, _| panic!("root must not apply"), 0)
            .expect("broadcast");
        assert_eq!(value, 9);
        assert!(matches!(
            ep.broadcast(&mut value, |_, _| {}, 3),
            Err(Error::InvalidEndpoint { endpoint: 3, .. })
        ));
    }
}
