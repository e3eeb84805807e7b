// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Commit pipeline: write the dirty tree out and retire the shadow
//! tree.
//!
//! Dirty nodes are serialised in post order so that children receive
//! lower page numbers than their parents and the root receives the
//! highest; the whole set goes to the block store as one APPEND. A
//! failed APPEND is fatal: the block store is the durability layer, so
//! the only safe continuation is a restart from the last committed
//! root.
//!
//! After the append is acknowledged, the formerly dirty nodes become
//! clean, and the old shadow tree is torn down: clean nodes shared with
//! the new tree are re-parented onto their dirty parents, shadow nodes
//! are destroyed. Teardown waits for every already-runnable
//! continuation to finish first, so nothing is still reading the shadow
//! tree when it goes.

use std::rc::Rc;

use crate::btree::node::{NodeData, NodeState, PAGENUM_NONE};
use crate::btree::{nodeops, Btree, Tree};
use crate::codec;
use crate::error::StoreResult;
use crate::pool::NodeId;

/// Serialise and append all dirty nodes, mark them clean, and replace
/// the shadow tree with the newly committed tree.
pub async fn sync(bt: &Btree) -> StoreResult<()> {
    let (pages, blkno) = {
        let mut t = bt.state();
        let root = t.root_dirty.expect("syncing a rootless tree");
        let mut pages = Vec::new();
        serialize_tree(&mut t, root, &mut pages)?;
        (pages, t.nextblk)
    };

    if pages.is_empty() {
        return Ok(());
    }

    let pagelen = bt.state_ref().pagelen;
    let next = bt.lbs.append(blkno, pagelen, pages).await?;

    {
        let mut t = bt.state();
        t.nextblk = next;
        let root = t.root_dirty.expect("syncing a rootless tree");
        make_clean(&mut t, root);
    }

    // Everything already woken gets to finish with the shadow tree
    // before it is torn down.
    tokio::task::yield_now().await;

    let mut t = bt.state();
    let old_shadow = t.root_shadow;
    let new_root = t.root_dirty.expect("syncing a rootless tree");
    t.root_shadow = Some(new_root);
    t.lock(new_root);

    if let Some(old) = old_shadow {
        // The old root is no longer a root.
        t.unlock(old);
        unshadow(&mut t, old);
    }

    t.npages = t.nextblk - t.pool.get(new_root).oldestleaf;
    Ok(())
}

/* Serialise the dirty nodes under `n` in post order, assigning page
 * numbers as we go. */
fn serialize_tree(t: &mut Tree, n: NodeId, pages: &mut Vec<Rc<[u8]>>) -> StoreResult<()> {
    if t.pool.get(n).state != NodeState::Dirty {
        return Ok(());
    }

    if t.pool.get(n).is_parent() {
        let children = t.pool.get(n).parent_children().clone();
        for c in children {
            serialize_tree(t, c, pages)?;
        }
    }

    // This node's page number, and the oldest leaf under it. A parent's
    // own page number is always higher than its children's, so the
    // minimum over children suffices.
    let pagenum = t.nextblk + pages.len() as u64;
    {
        let node = t.pool.get_mut(n);
        node.pagenum = pagenum;
        node.oldestleaf = pagenum;
    }
    if t.pool.get(n).is_parent() {
        let children = t.pool.get(n).parent_children().clone();
        let mut oldest = t.pool.get(n).oldestleaf;
        for c in children {
            oldest = oldest.min(t.pool.get(c).oldestleaf);
        }
        t.pool.get_mut(n).oldestleaf = oldest;
    }

    let nnodes = t.nnodes;
    let pagelen = t.pagelen;
    codec::serialize(&mut t.pool, n, pagelen, nnodes)?;
    pages.push(Rc::clone(
        t.pool.get(n).pagebuf.as_ref().expect("serialised node without page"),
    ));
    Ok(())
}

/* Mark the dirty tree clean, bottom-up: recompute oldestncleaf, drop
 * the non-clean self-lock, and join the shadow tree. */
fn make_clean(t: &mut Tree, n: NodeId) {
    debug_assert_ne!(t.pool.get(n).state, NodeState::Shadow);
    if t.pool.get(n).state != NodeState::Dirty {
        return;
    }

    if t.pool.get(n).is_parent() {
        let children = t.pool.get(n).parent_children().clone();
        for c in children {
            make_clean(t, c);
        }
    }

    // oldestleaf was settled during serialisation; oldestncleaf starts
    // from the same place but skips cleaner-held leaves under us.
    let mut oldest = t.pool.get(n).pagenum;
    if t.pool.get(n).is_parent() {
        let children = t.pool.get(n).parent_children().clone();
        for c in children {
            oldest = oldest.min(t.pool.get(c).oldestncleaf);
        }
    }

    {
        let node = t.pool.get_mut(n);
        node.oldestncleaf = oldest;
        node.state = NodeState::Clean;
    }
    t.unlock(n);

    // The dirty parent is now also the shadow parent.
    let parent = t.pool.get(n).p_dirty;
    t.pool.get_mut(n).p_shadow = parent;
    t.lock_opt(parent);
}

/* Tear down the old shadow tree: re-parent shared clean nodes onto the
 * committed tree, destroy shadow nodes. */
fn unshadow(t: &mut Tree, n: NodeId) {
    debug_assert_ne!(t.pool.get(n).state, NodeState::Dirty);

    if t.pool.get(n).state == NodeState::Clean {
        // Shared with the committed tree: its dirty parent is its only
        // parent now.
        let has_plock = t.pool.get(n).has_plock();
        if has_plock {
            let old = t.pool.get(n).p_shadow;
            t.unlock_opt(old);
        }
        let parent = t.pool.get(n).p_dirty;
        t.pool.get_mut(n).p_shadow = parent;
        if has_plock {
            t.lock_opt(parent);
        }
        return;
    }

    if t.pool.get(n).is_parent() {
        let children = t.pool.get(n).parent_children().clone();
        for c in children {
            unshadow(t, c);
        }
        // The children have moved on; do not free them with this node.
        t.pool.get_mut(n).data = NodeData::Parent {
            keys: Vec::new(),
            children: Vec::new(),
        };
    }

    nodeops::destroy(t, n);
}

/// Count the dirty nodes under `n`; test observability.
#[cfg(test)]
pub fn ndirty(t: &Tree, n: NodeId) -> usize {
    if t.pool.get(n).state != NodeState::Dirty {
        return 0;
    }
    let mut count = 1;
    if t.pool.get(n).is_parent() {
        for &c in t.pool.get(n).parent_children() {
            count += ndirty(t, c);
        }
    }
    count
}

/// The committed root's oldest leaf; advances as the cleaner compacts
/// the log.
pub fn oldest_leaf(t: &Tree) -> u64 {
    match t.root_shadow {
        Some(root) => t.pool.get(root).oldestleaf,
        None => PAGENUM_NONE,
    }
}
