// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Tree rebalancing: split pass, then merge passes until no merge is
//! pending.
//!
//! Splitting recurses through the dirty tree top-down, replacing any
//! child which has outgrown the page length with its split parts; a
//! root which outgrows the page gets a new root created above it.
//!
//! Merging runs in two phases. The planner walks bottom-up and scans
//! each dirty parent's children right to left, marking a child for
//! merging into its right-hand sibling when the combined node stays
//! within two thirds of a page and at least one dirty node is involved;
//! anything marked (or receiving a merge) which is not paged in is
//! fetched. The executor then dirties any still-clean participants,
//! collapses each marked run into one node, and repeats the whole cycle
//! if a merge created a parent which may itself need merging. Finally,
//! a root left with a single child is removed and the child promoted.

use futures_util::future::join_all;

use crate::btree::node::{NodeData, NodeState};
use crate::btree::{merge, nodeops, split, Btree, Tree};
use crate::codec;
use crate::error::StoreResult;
use crate::pool::NodeId;

/// Rebalance the dirty tree after a batch of mutations.
pub async fn balance(bt: &Btree) -> StoreResult<()> {
    {
        let mut t = bt.state();
        split_tree(&mut t);
    }

    loop {
        // Plan merges; fetch whatever the plan needs paged in.
        let fetches = {
            let mut t = bt.state();
            let root = t.root_dirty.expect("balancing a rootless tree");
            let mut fetches = Vec::new();
            plan_merge(&mut t, root, &mut fetches);
            fetches
        };
        let results = join_all(fetches.into_iter().map(|n| nodeops::fetch(bt, n))).await;
        for r in results {
            r?;
        }

        // Let every continuation woken by those fetches run before the
        // tree is restructured under it.
        tokio::task::yield_now().await;

        let more = {
            let mut t = bt.state();
            let root = t.root_dirty.expect("balancing a rootless tree");
            do_merge(&mut t, root);
            t.pool.get(root).needmerge
        };
        if !more {
            break;
        }
    }

    let mut t = bt.state();
    deroot(&mut t);
    Ok(())
}

/* Split oversized nodes, growing the tree upward if the root itself is
 * too big. */
fn split_tree(t: &mut Tree) {
    let root = t.root_dirty.expect("balancing a rootless tree");
    split_children(t, root);

    while codec::serialize_size(&mut t.pool, t.root_dirty.unwrap()) > t.pagelen {
        let old = t.root_dirty.unwrap();
        let new_root = split_root(t, old);
        t.root_dirty = Some(new_root);
    }
}

/* Recursively split the oversized descendants of a dirty parent. */
fn split_children(t: &mut Tree, n: NodeId) {
    if !t.pool.get(n).is_parent() || t.pool.get(n).state != NodeState::Dirty {
        return;
    }

    let children = t.pool.get(n).parent_children().clone();
    for &c in &children {
        split_children(t, c);
    }

    // Anything still fitting a page keeps its slot; oversized children
    // are replaced by their parts with the separators spliced in.
    let needs_split: Vec<bool> = children
        .iter()
        .map(|&c| t.pool.get(c).present() && codec::serialize_size(&mut t.pool, c) > t.pagelen)
        .collect();
    if !needs_split.iter().any(|&b| b) {
        return;
    }

    let old_keys = t.pool.get(n).parent_keys().clone();
    let mut new_keys = Vec::new();
    let mut new_children = Vec::new();
    for (i, &c) in children.iter().enumerate() {
        if needs_split[i] {
            let (seps, parts) = split::split(t, c);
            for (j, part) in parts.iter().enumerate() {
                new_children.push(*part);
                if j < seps.len() {
                    new_keys.push(seps[j].clone());
                }
            }
        } else {
            new_children.push(c);
        }
        if i < old_keys.len() {
            new_keys.push(old_keys[i].clone());
        }
    }

    {
        let node = t.pool.get_mut(n);
        node.data = NodeData::Parent {
            keys: new_keys,
            children: new_children.clone(),
        };
    }

    // Hook up the split parts; everything else already points here.
    for c in new_children {
        if t.pool.get(c).p_dirty.is_none() {
            t.pool.get_mut(c).p_dirty = Some(n);
            t.lock(n);
        } else {
            debug_assert_eq!(t.pool.get(c).p_dirty, Some(n));
        }
    }
}

/* Create a new root above an oversized one and split the old root into
 * it. */
fn split_root(t: &mut Tree, n: NodeId) -> NodeId {
    // The balancing invariants double the tree width per level, so a
    // tree this tall would outrun 64-bit block space first.
    assert!(t.pool.get(n).height + 1 < 64);
    let height = t.pool.get(n).height + 1;

    let new_root = nodeops::mkparent(t, height, Vec::new(), Vec::new());
    t.nnodes += 1;

    t.pool.get_mut(new_root).root = true;
    t.lock(new_root);

    t.pool.get_mut(n).root = false;
    t.unlock(n);

    t.pool.get_mut(n).p_dirty = Some(new_root);
    t.lock(new_root);

    // Splitting destroys the old root, which drops its child lock on
    // the new root again.
    let (keys, parts) = split::split(t, n);
    for &part in &parts {
        t.pool.get_mut(part).p_dirty = Some(new_root);
        t.lock(new_root);
    }
    t.pool.get_mut(new_root).data = NodeData::Parent {
        keys,
        children: parts,
    };

    new_root
}

/* Plan merges under a dirty parent; accumulate the nodes which must be
 * fetched before the plan can execute. Marked or receiving children
 * which are already present are locked so they stay that way. */
fn plan_merge(t: &mut Tree, n: NodeId, fetches: &mut Vec<NodeId>) {
    if !t.pool.get(n).is_parent() || t.pool.get(n).state != NodeState::Dirty {
        return;
    }

    let children = t.pool.get(n).parent_children().clone();
    for &c in &children {
        plan_merge(t, c, fetches);
    }

    let keys = t.pool.get(n).parent_keys().clone();
    let maxplen = t.pagelen * 2 / 3;

    // Scan right to left: accumulate the size of the node a merge run
    // would produce, and mark children while it stays within bounds and
    // a dirty node is somewhere in the run.
    let mut plen = 0;
    let mut gotdirty = false;
    let mut leafchild = false;
    for i in (0..children.len()).rev() {
        let c = children[i];
        if t.pool.get(c).state == NodeState::Dirty {
            gotdirty = true;
            leafchild = t.pool.get(c).is_leaf();
        }

        let mergeable = i < children.len() - 1 && gotdirty && {
            if !leafchild {
                plen += keys[i].serial_size();
            }
            plen += codec::merge_size(&mut t.pool, c);
            plen <= maxplen
        };

        if mergeable {
            t.pool.get_mut(c).merging = true;
        } else {
            // Start a fresh run ending at this child.
            plen = codec::serialize_size(&mut t.pool, c);
            gotdirty = t.pool.get(c).state == NodeState::Dirty;
            leafchild = t.pool.get(c).is_leaf();
        }
    }

    // Page in everything a merge run touches.
    let mut merging = false;
    for &c in &children {
        if merging || t.pool.get(c).merging {
            if t.pool.get(c).present() {
                t.lock(c);
            } else {
                fetches.push(c);
            }
        }
        merging = t.pool.get(c).merging;
    }
}

/* Execute planned merges under a dirty parent, bottom-up. */
fn do_merge(t: &mut Tree, n: NodeId) {
    // Until told otherwise, everything below here has been merged.
    t.pool.get_mut(n).needmerge = false;

    if t.pool.get(n).state != NodeState::Dirty || !t.pool.get(n).is_parent() {
        return;
    }

    let children = t.pool.get(n).parent_children().clone();
    for &c in &children {
        do_merge(t, c);
        if t.pool.get(c).needmerge {
            t.pool.get_mut(n).needmerge = true;
        }
    }

    let nmerges = children
        .iter()
        .filter(|&&c| t.pool.get(c).merging)
        .count();
    if nmerges == 0 {
        return;
    }
    // A merged child may itself contain newly adjacent mergeable
    // children; the planner gets another pass.
    t.pool.get_mut(n).needmerge = true;

    // Dirty the still-clean participants and release the locks the
    // planner (or its fetches) took.
    let mut prev_merging = false;
    let mut i = 0;
    while i < children.len() {
        let c = t.pool.get(n).parent_child(i);
        let was_merging = t.pool.get(c).merging;
        if was_merging || prev_merging {
            if t.pool.get(c).state != NodeState::Dirty {
                let dirtied = nodeops::dirty(t, c);
                // The merge flag belongs to the dirty copy, not the
                // shadow.
                t.pool.get_mut(dirtied).merging = was_merging;
                t.pool.get_mut(c).merging = false;
            }
            t.unlock(c);
        }
        prev_merging = was_merging;
        i += 1;
    }

    // Collapse each marked run into one node.
    let children = t.pool.get(n).parent_children().clone();
    let keys = t.pool.get(n).parent_keys().clone();
    let mut new_children = Vec::new();
    let mut new_keys = Vec::new();
    let mut run: Vec<NodeId> = Vec::new();
    let mut run_seps: Vec<crate::keys::Bstr> = Vec::new();
    for (i, &c) in children.iter().enumerate() {
        if t.pool.get(c).merging {
            t.pool.get_mut(c).merging = false;
            run.push(c);
            run_seps.push(keys[i].clone());
            continue;
        }
        if run.is_empty() {
            new_children.push(c);
        } else {
            run.push(c);
            new_children.push(merge::merge(t, &run, &run_seps));
            run.clear();
            run_seps.clear();
        }
        if i < keys.len() {
            new_keys.push(keys[i].clone());
        }
    }
    debug_assert!(run.is_empty());

    let node = t.pool.get_mut(n);
    node.data = NodeData::Parent {
        keys: new_keys,
        children: new_children,
    };
    // The node's size changed.
    node.pagesize = None;
}

/* Remove root nodes left with a single child. */
fn deroot(t: &mut Tree) {
    loop {
        let root = t.root_dirty.expect("derooting a rootless tree");
        if !t.pool.get(root).is_parent() || t.pool.get(root).nkeys() != 0 {
            break;
        }

        // Promote the only child.
        let child = t.pool.get(root).parent_child(0);
        t.root_dirty = Some(child);
        {
            let node = t.pool.get_mut(child);
            node.root = true;
            node.pagesize = None;
        }
        t.lock(child);
        t.pool.get_mut(child).p_dirty = None;

        // The old root loses its roothood and its only child.
        t.pool.get_mut(root).root = false;
        t.unlock(root);
        t.pool.get_mut(root).data = NodeData::Parent {
            keys: Vec::new(),
            children: Vec::new(),
        };
        t.unlock(root);
        nodeops::destroy(t, root);
        t.nnodes -= 1;
    }
}
