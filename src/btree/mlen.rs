// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Matching-prefix maintenance.
//!
//! Every key in the subtree responsible for the range [start, end) must
//! begin with the prefix shared by `start` and `end`, so that prefix
//! length is a sound (possibly conservative) value for `mlen_t`.
//! Recomputed over the dirty tree after balancing, before sync.

use crate::btree::node::{NodeData, NodeState};
use crate::btree::Tree;
use crate::keys::Bstr;
use crate::pool::NodeId;

/// Fill in `mlen_t` for all dirty nodes in the tree.
pub fn update(t: &mut Tree) {
    let root = t.root_dirty.expect("mlen pass on a rootless tree");
    traverse(t, root, None, None);
}

fn traverse(t: &mut Tree, n: NodeId, start: Option<&Bstr>, end: Option<&Bstr>) {
    if t.pool.get(n).state != NodeState::Dirty {
        return;
    }

    let payload = match &t.pool.get(n).data {
        NodeData::Parent { keys, children } => Some((keys.clone(), children.clone())),
        _ => None,
    };
    if let Some((keys, children)) = payload {
        for (i, &c) in children.iter().enumerate() {
            let sub_start = if i == 0 { start } else { Some(&keys[i - 1]) };
            let sub_end = if i < keys.len() { Some(&keys[i]) } else { end };
            traverse(t, c, sub_start, sub_end);
        }
    }

    t.pool.get_mut(n).mlen_t = match (start, end) {
        (Some(s), Some(e)) => s.mlen(e) as u8,
        // A range open at either end shares no known prefix.
        _ => 0,
    };
}
