// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Node splitting.
//!
//! A node which has outgrown the page length is split into parts by
//! scanning its entries in order and closing a part whenever the
//! accumulated serialised size passes two thirds of a page; parts
//! therefore land between 2/3 and one full page, leaving room to absorb
//! further inserts before splitting again. The separator between two
//! leaf parts is the first key of the right part; between two parent
//! parts it is the separator being crossed.

use crate::btree::node::{NodeData, NodeState};
use crate::btree::nodeops;
use crate::btree::Tree;
use crate::codec::{OVERHEAD, PERCHILD};
use crate::keys::Bstr;
use crate::pool::NodeId;

/// Number of parts [`split`] will produce for the node `n`.
pub fn nparts(t: &Tree, n: NodeId) -> usize {
    let breakat = t.pagelen * 2 / 3;
    let node = t.pool.get(n);
    match &node.data {
        NodeData::Leaf { pairs, .. } => {
            let mut parts = 1;
            let mut cursize = OVERHEAD;
            for pair in pairs {
                if cursize > breakat {
                    parts += 1;
                    cursize = OVERHEAD;
                }
                cursize += pair.key.serial_size();
                cursize += pair
                    .value
                    .as_ref()
                    .expect("sealed leaf pair without value")
                    .serial_size();
            }
            parts
        }
        NodeData::Parent { keys, .. } => {
            let mut parts = 1;
            let mut cursize = OVERHEAD + PERCHILD;
            for key in keys {
                if cursize > breakat {
                    parts += 1;
                    cursize = OVERHEAD + PERCHILD;
                } else {
                    cursize += key.serial_size();
                    cursize += PERCHILD;
                }
            }
            parts
        }
        _ => panic!("splitting a non-present node"),
    }
}

/// Split the dirty node `n` into parts small enough to serialise into
/// one page each. Returns the separator keys and the parts (one more
/// part than keys). The node `n` is destroyed; the parts are dirty,
/// locked once each, and have no dirty parent yet.
pub fn split(t: &mut Tree, n: NodeId) -> (Vec<Bstr>, Vec<NodeId>) {
    debug_assert_eq!(t.pool.get(n).state, NodeState::Dirty);
    let breakat = t.pagelen * 2 / 3;
    let expected = nparts(t, n);

    let (keys, parts) = if t.pool.get(n).is_leaf() {
        split_leaf(t, n, breakat)
    } else {
        split_parent(t, n, breakat)
    };
    debug_assert_eq!(parts.len(), expected);

    t.nnodes += parts.len() as u64 - 1;
    (keys, parts)
}

/* Split a leaf; pairs are copied by reference into the parts. */
fn split_leaf(t: &mut Tree, n: NodeId, breakat: usize) -> (Vec<Bstr>, Vec<NodeId>) {
    let pairs = t.pool.get(n).leaf_pairs().clone();

    let mut seps = Vec::new();
    let mut parts = Vec::new();
    let mut cursize = OVERHEAD;
    let mut nkeys = 0;
    for (i, pair) in pairs.iter().enumerate() {
        if cursize > breakat {
            parts.push(nodeops::mkleaf(t, pairs[i - nkeys..i].to_vec()));
            // The separator is greater than every key to its left and
            // at most the first key to its right.
            seps.push(pair.key.clone());
            cursize = OVERHEAD;
            nkeys = 0;
        }
        cursize += pair.key.serial_size();
        cursize += pair
            .value
            .as_ref()
            .expect("sealed leaf pair without value")
            .serial_size();
        nkeys += 1;
    }
    parts.push(nodeops::mkleaf(t, pairs[pairs.len() - nkeys..].to_vec()));

    nodeops::destroy(t, n);
    (seps, parts)
}

/* Split a parent; children keep their identity and move their
 * dirty-parent link (and lock) to the part which received them. */
fn split_parent(t: &mut Tree, n: NodeId, breakat: usize) -> (Vec<Bstr>, Vec<NodeId>) {
    let (keys, children, height) = {
        let node = t.pool.get(n);
        (
            node.parent_keys().clone(),
            node.parent_children().clone(),
            node.height,
        )
    };

    let mut seps = Vec::new();
    let mut parts = Vec::new();
    let mut cursize = OVERHEAD + PERCHILD;
    let mut nkeys = 0;
    for i in 1..=keys.len() {
        if cursize > breakat {
            let start = i - nkeys - 1;
            parts.push(nodeops::mkparent(
                t,
                height,
                keys[start..i - 1].to_vec(),
                children[start..i].to_vec(),
            ));
            seps.push(keys[i - 1].clone());
            cursize = OVERHEAD + PERCHILD;
            nkeys = 0;
        } else {
            cursize += keys[i - 1].serial_size();
            cursize += PERCHILD;
            nkeys += 1;
        }
    }
    let start = keys.len() - nkeys;
    parts.push(nodeops::mkparent(
        t,
        height,
        keys[start..].to_vec(),
        children[start..].to_vec(),
    ));

    // Re-parent the children onto their parts.
    for &part in &parts {
        let kids = t.pool.get(part).parent_children().clone();
        for c in kids {
            let has_plock = t.pool.get(c).has_plock();
            if has_plock {
                t.unlock(n);
            }
            t.pool.get_mut(c).p_dirty = Some(part);
            if has_plock {
                t.lock(part);
            }
        }
    }

    // Destroy the old node without touching the children it no longer
    // owns.
    t.pool.get_mut(n).data = NodeData::Parent {
        keys: Vec::new(),
        children: Vec::new(),
    };
    nodeops::destroy(t, n);

    (seps, parts)
}
