// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Spanning trees used by the fence and the collectives.
//!
//! Inside a node the tree over workers has fixed fan-out
//! [`INTRA_NODE_FAN_OUT`]. Between nodes the shape is a [`FenceTopology`];
//! every shape is rooted at node 0 and can be relabeled to any other root.

use crate::config::{FenceTopology, INTER_NODE_MAX_KIDS, INTRA_NODE_FAN_OUT};

/// Children of `worker` in the intra-node tree.
pub fn intra_children(worker: usize, workers: usize) -> impl Iterator<Item = usize> {
    let first = worker * INTRA_NODE_FAN_OUT + 1;
    (first..first + INTRA_NODE_FAN_OUT).filter(move |&child| child < workers)
}

/// Parent of `worker` in the intra-node tree; the root is its own parent.
pub fn intra_parent(worker: usize) -> usize {
    if worker == 0 {
        0
    } else {
        (worker - 1) / INTRA_NODE_FAN_OUT
    }
}

/// Bitmask of `worker`'s children, bit `i` for the `i`-th child.
pub fn intra_child_mask(worker: usize, workers: usize) -> u32 {
    intra_children(worker, workers)
        .enumerate()
        .fold(0, |mask, (i, _)| mask | (1 << i))
}

/// Slot of `worker` among its parent's children.
pub fn intra_child_index(worker: usize) -> usize {
    (worker - 1) % INTRA_NODE_FAN_OUT
}

/// Tree over the nodes of a run.
#[derive(Clone, Copy, Debug)]
pub struct InterNodeTree {
    nodes: usize,
    topology: FenceTopology,
}

impl InterNodeTree {
    pub fn new(nodes: usize, topology: FenceTopology) -> Self {
        Self { nodes, topology }
    }

    pub fn nodes(&self) -> usize {
        self.nodes
    }

    /// Parent of `node` in the tree rooted at 0.
    pub fn parent(&self, node: usize) -> Option<usize> {
        if node == 0 {
            return None;
        }
        Some(match self.topology {
            FenceTopology::Hypercube => node & (node - 1),
            FenceTopology::Binary => (node - 1) / 2,
            FenceTopology::Flat => (node - 1) / INTER_NODE_MAX_KIDS,
        })
    }

    /// Children of `node` in the tree rooted at 0, ascending.
    pub fn children(&self, node: usize) -> Vec<usize> {
        let nodes = self.nodes;
        match self.topology {
            FenceTopology::Hypercube => {
                let limit = if node == 0 {
                    usize::BITS
                } else {
                    node.trailing_zeros()
                };
                (0..limit)
                    .map(|bit| 1usize << bit)
                    .take_while(|&step| step < nodes)
                    .map(|step| node | step)
                    .filter(|&child| child < nodes)
                    .collect()
            }
            FenceTopology::Binary => [2 * node + 1, 2 * node + 2]
                .into_iter()
                .filter(|&child| child < nodes)
                .collect(),
            FenceTopology::Flat => {
                let first = node * INTER_NODE_MAX_KIDS + 1;
                (first..first + INTER_NODE_MAX_KIDS)
                    .filter(|&child| child < nodes)
                    .collect()
            }
        }
    }

    /// Parent of `node` when the tree is rooted at `root`.
    pub fn parent_rooted(&self, node: usize, root: usize) -> Option<usize> {
        self.parent(self.relabel(node, root))
            .map(|parent| self.restore(parent, root))
    }

    /// Children of `node` when the tree is rooted at `root`.
    pub fn children_rooted(&self, node: usize, root: usize) -> Vec<usize> {
        self.children(self.relabel(node, root))
            .into_iter()
            .map(|child| self.restore(child, root))
            .collect()
    }

    fn relabel(&self, node: usize, root: usize) -> usize {
        (node + self.nodes - root) % self.nodes
    }

    fn restore(&self, relative: usize, root: usize) -> usize {
        (relative + root) % self.nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_spanning(tree: &InterNodeTree, root: usize) {
        let mut reached = vec![false; tree.nodes()];
        let mut stack = vec![root];
        while let Some(node) = stack.pop() {
            assert!(!reached[node], "node {} reached twice", node);
            reached[node] = true;
            for child in tree.children_rooted(node, root) {
                assert_eq!(tree.parent_rooted(child, root), Some(node));
                stack.push(child);
            }
        }
        assert!(reached.iter().all(|r| *r), "tree rooted at {} not spanning", root);
        assert_eq!(tree.parent_rooted(root, root), None);
    }

    #[test]
    fn test_intra_tree_fan_out() {
        assert_eq!(intra_children(0, 10).collect::<Vec<_>>(), vec![1, 2, 3, 4]);
        assert_eq!(intra_children(1, 10).collect::<Vec<_>>(), vec![5, 6, 7, 8]);
        assert_eq!(intra_children(2, 10).collect::<Vec<_>>(), vec![9]);
        assert_eq!(intra_children(3, 10).count(), 0);
        assert_eq!(intra_parent(0), 0);
        assert_eq!(intra_parent(7), 1);
        assert_eq!(intra_child_index(7), 2);
        assert_eq!(intra_child_mask(2, 10), 0b1);
        assert_eq!(intra_child_mask(0, 3), 0b11);
    }

    #[test]
    fn test_hypercube_shape() {
        let tree = InterNodeTree::new(8, FenceTopology::Hypercube);
        assert_eq!(tree.children(0), vec![1, 2, 4]);
        assert_eq!(tree.children(4), vec![5, 6]);
        assert_eq!(tree.children(6), vec![7]);
        assert_eq!(tree.parent(6), Some(4));
        assert_eq!(tree.parent(5), Some(4));
    }

    #[test]
    fn test_every_shape_spans_every_root() {
        for topology in [
            FenceTopology::Hypercube,
            FenceTopology::Binary,
            FenceTopology::Flat,
        ] {
            for nodes in 1..20 {
                let tree = InterNodeTree::new(nodes, topology);
                for root in 0..nodes {
                    assert_spanning(&tree, root);
                }
            }
        }
    }

    #[test]
    fn test_flat_fan_out_bounded() {
        let tree = InterNodeTree::new(30, FenceTopology::Flat);
        assert_eq!(tree.children(0), (1..=7).collect::<Vec<_>>());
        assert!((0..30).all(|n| tree.children(n).len() <= INTER_NODE_MAX_KIDS));
    }
}
