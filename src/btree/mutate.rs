// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Leaf mutability.
//!
//! A dirty leaf's sorted pair vector is expensive to insert into, so a
//! leaf being mutated grows a temporary overflow hash table: lookups
//! check the vector first and the hash second, new keys land in the
//! hash, and deletions record a tombstone (a pair with no value) in
//! whichever structure holds the key. Sealing the leaf merges the hash
//! back into a single sorted, tombstone-free vector.
//!
//! The table is open-addressed, keyed by CRC32 of the key, and doubles
//! when it passes 3/4 full.

use crate::btree::find;
use crate::btree::node::{Node, NodeState};
use crate::keys::{Bstr, KvPair};

/// Temporary key-value hash for a mutable leaf.
pub struct KvHash {
    slots: Vec<Option<KvPair>>,
    hashes: Vec<u32>,
    nkeys: usize,
}

impl KvHash {
    /// An empty table with four slots.
    pub fn new() -> Self {
        Self {
            slots: vec![None, None, None, None],
            hashes: vec![0; 4],
            nkeys: 0,
        }
    }

    pub fn nslots(&self) -> usize {
        self.slots.len()
    }

    pub fn slot_pair(&self, pos: usize) -> Option<&KvPair> {
        self.slots[pos].as_ref()
    }

    pub fn slot_pair_mut(&mut self, pos: usize) -> Option<&mut KvPair> {
        self.slots[pos].as_mut()
    }

    /// Find the slot where `k` lives or would live if inserted. The
    /// slot's hash is recorded so an insertion into it is complete.
    pub fn slot(&mut self, k: &Bstr) -> usize {
        let h = crc32fast::hash(k.as_bytes());
        let mask = self.slots.len() - 1;
        let mut pos = h as usize & mask;
        loop {
            match &self.slots[pos] {
                None => break,
                Some(pair) if self.hashes[pos] == h && pair.key == *k => break,
                _ => pos = (pos + 1) & mask,
            }
        }
        self.hashes[pos] = h;
        pos
    }

    /// Store a pair into `pos` (as returned by [`slot`] for its key).
    pub fn put(&mut self, pos: usize, key: Bstr, value: Option<Bstr>) {
        self.slots[pos] = Some(KvPair { key, value });
    }

    /// Record that a new key was added; grow past 3/4 load.
    pub fn post_add(&mut self) {
        self.nkeys += 1;
        if self.nkeys + self.slots.len() / 4 > self.slots.len() {
            self.rehash();
        }
    }

    /* Rehash into double the slots. */
    fn rehash(&mut self) {
        let new_len = self.slots.len() * 2;
        let mut slots: Vec<Option<KvPair>> = (0..new_len).map(|_| None).collect();
        let mut hashes = vec![0u32; new_len];
        let mask = new_len - 1;
        for (pair, h) in self
            .slots
            .drain(..)
            .zip(self.hashes.drain(..))
            .filter_map(|(p, h)| p.map(|p| (p, h)))
        {
            let mut pos = h as usize & mask;
            while slots[pos].is_some() {
                pos = (pos + 1) & mask;
            }
            slots[pos] = Some(pair);
            hashes[pos] = h;
        }
        self.slots = slots;
        self.hashes = hashes;
    }

    /// Live (non-tombstone) pairs, in table order.
    fn live_pairs(&self) -> Vec<KvPair> {
        self.slots
            .iter()
            .flatten()
            .filter(|pair| pair.value.is_some())
            .cloned()
            .collect()
    }
}

impl Default for KvHash {
    fn default() -> Self {
        Self::new()
    }
}

/// Where a key lives (or would live) in a mutable leaf.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Slot {
    /// Index into the sorted pair vector.
    Vec(usize),
    /// Slot in the overflow hash.
    Hash(usize),
}

/// Make the dirty leaf `node` mutable by attaching an empty overflow
/// hash.
pub fn mutable(node: &mut Node) {
    debug_assert_eq!(node.state, NodeState::Dirty);
    debug_assert!(node.pagesize.is_none());
    match &mut node.data {
        crate::btree::node::NodeData::Leaf { overflow, .. } => {
            debug_assert!(overflow.is_none());
            *overflow = Some(KvHash::new());
        }
        _ => panic!("not a leaf"),
    }
}

/// Find where the key `k` lives (or would live) in the mutable leaf.
pub fn find(node: &mut Node, k: &Bstr) -> Slot {
    if let Some(i) = find::find_kvpair(node, k) {
        return Slot::Vec(i);
    }
    let hash = overflow_mut(node);
    Slot::Hash(hash.slot(k))
}

/// The value currently associated with the slot, if any. A tombstone or
/// an empty slot both read as "no value".
pub fn value_at(node: &Node, slot: Slot) -> Option<Bstr> {
    match slot {
        Slot::Vec(i) => node.leaf_pairs()[i].value.clone(),
        Slot::Hash(pos) => overflow(node)
            .slot_pair(pos)
            .and_then(|pair| pair.value.clone()),
    }
}

/// True if the slot holds a key (live or tombstoned).
pub fn key_at(node: &Node, slot: Slot) -> bool {
    match slot {
        Slot::Vec(_) => true,
        Slot::Hash(pos) => overflow(node).slot_pair(pos).is_some(),
    }
}

/// Set the value at an occupied slot (`None` deletes).
pub fn set_value(node: &mut Node, slot: Slot, value: Option<Bstr>) {
    match slot {
        Slot::Vec(i) => node.leaf_pairs_mut()[i].value = value,
        Slot::Hash(pos) => {
            let pair = overflow_mut(node)
                .slot_pair_mut(pos)
                .expect("setting value in an empty hash slot");
            pair.value = value;
        }
    }
}

/// Add the pair `k`/`v` at the (empty) hash slot and keep the leaf's
/// matching-length bound current.
pub fn add(node: &mut Node, slot: Slot, k: Bstr, v: Bstr) {
    // mlen_n stays a lower bound: shrink it to the match between the
    // new key and any existing key.
    if node.nkeys() > 0 {
        let mlen = k.mlen(&node.leaf_pairs()[0].key);
        if mlen < node.mlen_n as usize {
            node.mlen_n = mlen as u8;
        }
    } else {
        node.mlen_n = 0;
    }

    let pos = match slot {
        Slot::Hash(pos) => pos,
        Slot::Vec(_) => panic!("adding a key which is already in the vector"),
    };
    let hash = overflow_mut(node);
    hash.put(pos, k, Some(v));
    hash.post_add();
}

/// Seal the leaf: merge the overflow hash back into the sorted vector,
/// dropping tombstones.
pub fn immutable(node: &mut Node) {
    debug_assert_eq!(node.state, NodeState::Dirty);
    debug_assert!(node.pagesize.is_none());

    let mlen = node.mlen_n as usize;
    let (pairs, overflow) = match &mut node.data {
        crate::btree::node::NodeData::Leaf { pairs, overflow } => {
            (std::mem::take(pairs), overflow.take().expect("sealing a leaf with no hash"))
        }
        _ => panic!("not a leaf"),
    };

    let mut hashed = overflow.live_pairs();
    hashed.sort_by(|a, b| a.key.cmp2(&b.key, mlen));

    // Merge the two sorted runs; vector tombstones fall out here.
    let mut merged = Vec::with_capacity(pairs.len() + hashed.len());
    let mut hi = 0;
    for pair in pairs.into_iter().filter(|pair| pair.value.is_some()) {
        while hi < hashed.len() && pair.key.cmp2(&hashed[hi].key, mlen) == std::cmp::Ordering::Greater
        {
            merged.push(hashed[hi].clone());
            hi += 1;
        }
        merged.push(pair);
    }
    merged.extend_from_slice(&hashed[hi..]);

    match &mut node.data {
        crate::btree::node::NodeData::Leaf { pairs, .. } => *pairs = merged,
        _ => unreachable!(),
    }
}

fn overflow(node: &Node) -> &KvHash {
    match &node.data {
        crate::btree::node::NodeData::Leaf { overflow, .. } => {
            overflow.as_ref().expect("leaf is not mutable")
        }
        _ => panic!("not a leaf"),
    }
}

fn overflow_mut(node: &mut Node) -> &mut KvHash {
    match &mut node.data {
        crate::btree::node::NodeData::Leaf { overflow, .. } => {
            overflow.as_mut().expect("leaf is not mutable")
        }
        _ => panic!("not a leaf"),
    }
}
