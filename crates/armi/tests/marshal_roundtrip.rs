// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::float_cmp)] // Exact round-trip comparisons

//! Randomized marshal round trips over nested dynamic values.

use armi::marshal::{self, classify, packed_size, Packing, NULL_OFFSET};
use armi::Marshal;

#[derive(Clone, Debug, PartialEq)]
struct Leaf {
    key: u32,
    name: String,
}

armi::marshal_struct!(Leaf { key: u32, name: String });

#[derive(Clone, Debug, PartialEq)]
struct Tree {
    id: u64,
    weight: f64,
    label: String,
    tags: Vec<Option<String>>,
    rows: Vec<Vec<u32>>,
    parent: Option<Box<Leaf>>,
    leaves: Vec<Leaf>,
    corner: [i16; 3],
}

armi::marshal_struct!(Tree {
    id: u64,
    weight: f64,
    label: String,
    tags: Vec<Option<String>>,
    rows: Vec<Vec<u32>>,
    parent: Option<Box<Leaf>>,
    leaves: Vec<Leaf>,
    corner: [i16; 3],
});

#[derive(Clone, Copy, Debug, PartialEq)]
struct Sample {
    at: u64,
    value: f32,
    flags: [u8; 4],
}

armi::marshal_struct!(Sample {
    at: u64,
    value: f32,
    flags: [u8; 4],
});

fn random_string(rng: &mut fastrand::Rng) -> String {
    let len = rng.usize(..24);
    (0..len).map(|_| rng.alphanumeric()).collect()
}

fn random_leaf(rng: &mut fastrand::Rng) -> Leaf {
    Leaf {
        key: rng.u32(..),
        name: random_string(rng),
    }
}

fn random_tree(rng: &mut fastrand::Rng) -> Tree {
    Tree {
        id: rng.u64(..),
        weight: rng.f64(),
        label: random_string(rng),
        tags: (0..rng.usize(..6))
            .map(|_| rng.bool().then(|| random_string(rng)))
            .collect(),
        rows: (0..rng.usize(..5))
            .map(|_| (0..rng.usize(..9)).map(|_| rng.u32(..)).collect())
            .collect(),
        parent: rng.bool().then(|| Box::new(random_leaf(rng))),
        leaves: (0..rng.usize(..4)).map(|_| random_leaf(rng)).collect(),
        corner: [rng.i16(..), rng.i16(..), rng.i16(..)],
    }
}

fn roundtrip<T: Marshal + PartialEq + std::fmt::Debug>(value: &T) -> T {
    let size = packed_size(value);
    let mut buffer = vec![0u8; size];
    let used = marshal::pack_into(value, &mut buffer).expect("pack");
    assert_eq!(used, size, "packed size must be exact");
    marshal::unpack_from(&buffer).expect("unpack")
}

#[test]
fn random_nested_trees_roundtrip() {
    let mut rng = fastrand::Rng::with_seed(0xA11CE);
    for _ in 0..500 {
        let tree = random_tree(&mut rng);
        assert_eq!(roundtrip(&tree), tree);
    }
}

#[test]
fn batches_of_trees_roundtrip() {
    let mut rng = fastrand::Rng::with_seed(42);
    for _ in 0..20 {
        let batch: Vec<Tree> = (0..rng.usize(1..12)).map(|_| random_tree(&mut rng)).collect();
        let args = (batch.clone(), rng.u8(..), Some(random_string(&mut rng)));
        assert_eq!(roundtrip(&args), args);
    }
}

#[test]
fn flat_types_take_the_flat_path() {
    assert_eq!(classify::<Sample>(), Packing::Flat);
    assert_eq!(classify::<(u8, i64, [u16; 2])>(), Packing::Flat);
    assert_eq!(classify::<Tree>(), Packing::Packed);
    assert_eq!(classify::<Option<u8>>(), Packing::Packed);

    let mut rng = fastrand::Rng::with_seed(7);
    for _ in 0..200 {
        let sample = Sample {
            at: rng.u64(..),
            value: rng.f32(),
            flags: [rng.u8(..), rng.u8(..), rng.u8(..), rng.u8(..)],
        };
        assert_eq!(packed_size(&sample), <Sample as Marshal>::FLAT_SIZE);
        assert_eq!(roundtrip(&sample), sample);
    }
}

#[test]
fn absent_options_store_the_sentinel() {
    let value: (Option<String>, Option<Box<Leaf>>) = (None, None);
    let bytes = marshal::to_bytes(&value, 64).expect("pack");
    assert_eq!(bytes.len(), 8);
    assert_eq!(bytes[..4], NULL_OFFSET.to_le_bytes());
    assert_eq!(bytes[4..], NULL_OFFSET.to_le_bytes());
    assert_eq!(roundtrip(&value), value);
}

#[test]
fn damaged_buffers_fail_cleanly() {
    let mut rng = fastrand::Rng::with_seed(99);
    let label = "x".repeat(40);
    let bytes = marshal::to_bytes(&label, 1024).expect("pack");

    for cut in [0, 4, 8, bytes.len() - 1] {
        assert!(marshal::unpack_from::<String>(&bytes[..cut]).is_err(), "cut at {}", cut);
    }

    let mut bent = bytes.clone();
    bent[..4].copy_from_slice(&10_000u32.to_le_bytes());
    assert!(marshal::unpack_from::<String>(&bent).is_err());

    // Random corruption may decode to something else, but never panics.
    for _ in 0..200 {
        let tree = random_tree(&mut rng);
        let mut packed = marshal::to_bytes(&tree, usize::MAX).expect("pack tree");
        let at = rng.usize(..packed.len());
        packed[at] = rng.u8(..);
        let _ = marshal::unpack_from::<Tree>(&packed);
    }
}
