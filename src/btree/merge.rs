// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Node merging.
//!
//! Collapses a run of adjacent dirty siblings into a single node. For
//! leaves the pair vectors are concatenated; for parents the key arrays
//! are concatenated with the separator keys between the inputs spliced
//! in, and the child arrays are concatenated. The inputs are destroyed;
//! their children (if any) are re-parented onto the merged node.

use crate::btree::node::{NodeData, NodeState};
use crate::btree::nodeops;
use crate::btree::Tree;
use crate::keys::Bstr;
use crate::pool::NodeId;

/// Merge the dirty siblings `inputs` (left to right) into one node;
/// `seps` holds the separator keys between them (one fewer than
/// inputs). Returns the merged node, which inherits the first input's
/// dirty parent.
pub fn merge(t: &mut Tree, inputs: &[NodeId], seps: &[Bstr]) -> NodeId {
    debug_assert!(inputs.len() >= 2);
    debug_assert_eq!(seps.len(), inputs.len() - 1);
    for &c in inputs {
        debug_assert_eq!(t.pool.get(c).state, NodeState::Dirty);
    }

    if t.pool.get(inputs[0]).is_leaf() {
        merge_leaf(t, inputs)
    } else {
        merge_parent(t, inputs, seps)
    }
}

fn merge_leaf(t: &mut Tree, inputs: &[NodeId]) -> NodeId {
    // Concatenate the pair vectors.
    let mut pairs = Vec::new();
    for &c in inputs {
        pairs.extend_from_slice(t.pool.get(c).leaf_pairs());
    }

    let merged = nodeops::mkleaf(t, pairs);

    // The merged node takes the first input's place in the dirty tree.
    let parent = t.pool.get(inputs[0]).p_dirty;
    t.pool.get_mut(merged).p_dirty = parent;
    t.lock_opt(parent);

    for &c in inputs {
        nodeops::destroy(t, c);
    }
    t.nnodes -= inputs.len() as u64 - 1;

    merged
}

fn merge_parent(t: &mut Tree, inputs: &[NodeId], seps: &[Bstr]) -> NodeId {
    let height = t.pool.get(inputs[0]).height;

    // Concatenate keys with the separators between inputs, and the
    // child arrays.
    let mut keys = Vec::new();
    let mut children = Vec::new();
    for (i, &c) in inputs.iter().enumerate() {
        keys.extend_from_slice(t.pool.get(c).parent_keys());
        if i < seps.len() {
            keys.push(seps[i].clone());
        }
        children.extend_from_slice(t.pool.get(c).parent_children());
    }

    let merged = nodeops::mkparent(t, height, keys, children.clone());

    let parent = t.pool.get(inputs[0]).p_dirty;
    t.pool.get_mut(merged).p_dirty = parent;
    t.lock_opt(parent);

    // Children move their dirty-parent link (and lock) to the merged
    // node.
    for c in children {
        let has_plock = t.pool.get(c).has_plock();
        if has_plock {
            let old = t.pool.get(c).p_dirty.expect("child without dirty parent");
            t.unlock(old);
        }
        t.pool.get_mut(c).p_dirty = Some(merged);
        if has_plock {
            t.lock(merged);
        }
    }

    // Destroy the inputs without touching the children they no longer
    // own.
    for &c in inputs {
        t.pool.get_mut(c).data = NodeData::Parent {
            keys: Vec::new(),
            children: Vec::new(),
        };
        nodeops::destroy(t, c);
    }
    t.nnodes -= inputs.len() as u64 - 1;

    merged
}
