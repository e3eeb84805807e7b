// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Key location: binary searches within a node and descents through the
//! tree.
//!
//! Searches within one node compare under the node's known matching
//! prefix (`mlen_n` for leaves, `mlen_t` for parents), skipping bytes
//! every key in the node is known to share. In a parent, a key equal to
//! a separator belongs to the child on the right.
//!
//! Descents page in missing nodes as they go. While a child is being
//! fetched, the parent stays locked so that the fetch's eviction cannot
//! take the parent out from under the path being walked.

use std::cmp::Ordering;

use crate::btree::node::Node;
use crate::btree::nodeops;
use crate::btree::Btree;
use crate::error::StoreResult;
use crate::keys::Bstr;
use crate::pool::NodeId;

/// Find the position of the key `k` in the leaf `node`; `None` if no
/// pair carries it.
pub fn find_kvpair(node: &Node, k: &Bstr) -> Option<usize> {
    debug_assert!(node.is_leaf());
    let pairs = node.leaf_pairs();
    let mlen = node.mlen_n as usize;

    let mut min = 0;
    let mut max = pairs.len();
    while min != max {
        let mid = min + (max - min) / 2;
        match k.cmp2(&pairs[mid].key, mlen) {
            Ordering::Less => max = mid,
            Ordering::Greater => min = mid + 1,
            Ordering::Equal => return Some(mid),
        }
    }
    None
}

/// Find the number of the child of `node` responsible for the key `k`.
pub fn find_child(node: &Node, k: &Bstr) -> usize {
    debug_assert!(node.is_parent());
    let keys = node.parent_keys();
    let mlen = node.mlen_t as usize;

    let mut min = 0;
    let mut max = keys.len();
    while min != max {
        let mid = min + (max - min) / 2;
        match k.cmp2(&keys[mid], mlen) {
            Ordering::Less => max = mid,
            Ordering::Greater => min = mid + 1,
            // Equal separators route right.
            Ordering::Equal => return mid + 1,
        }
    }
    min
}

/// Locate the leaf responsible for `k` in the subtree rooted at `start`,
/// fetching missing nodes along the way. Returns the leaf, locked once
/// for the caller.
pub async fn find_leaf(bt: &Btree, start: NodeId, k: &Bstr) -> StoreResult<NodeId> {
    let (leaf, _) = find_node(bt, start, k, 0, false).await?;
    Ok(leaf)
}

/// Locate a node of height at most `h` responsible for a range
/// containing `k`. Returns the node (locked once for the caller) and
/// the end of the range it is responsible for ("" if it extends to the
/// end of the keyspace).
pub async fn find_range(bt: &Btree, start: NodeId, k: &Bstr, h: i8) -> StoreResult<(NodeId, Bstr)> {
    find_node(bt, start, k, h, true).await
}

/* Shared descent. */
async fn find_node(
    bt: &Btree,
    start: NodeId,
    k: &Bstr,
    h: i8,
    track_end: bool,
) -> StoreResult<(NodeId, Bstr)> {
    let mut end = Bstr::empty();
    let mut n = start;
    bt.state().lock(n);

    loop {
        // Walk down while nodes are present, then either arrive or find
        // the node to fetch.
        let parent = {
            let mut t = bt.state();
            // Drop the lock carried in; the walk below takes another
            // before anything can evict.
            t.unlock(n);
            let mut parent = None;
            loop {
                let node = t.pool.get(n);
                if !node.present() {
                    break;
                }
                if node.height <= h {
                    t.lock(n);
                    return Ok((n, end));
                }
                let i = find_child(node, k);
                if track_end && i < node.nkeys() {
                    end = node.parent_keys()[i].clone();
                }
                parent = Some(n);
                n = node.parent_child(i);
            }
            // Pin the parent so the fetch's eviction cannot take it out
            // before the child holds its own parent locks.
            if let Some(p) = parent {
                t.lock(p);
            }
            parent
        };

        nodeops::fetch(bt, n).await?;
        if let Some(p) = parent {
            bt.state().unlock(p);
        }
        // Loop: the fetch lock on `n` is dropped at the top.
    }
}
