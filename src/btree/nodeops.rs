// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Node lifecycle: construction, fetch, copy-on-write, destruction.
//!
//! Fetches coalesce: the first fetcher of a node issues the block-store
//! GET and later fetchers of the same node just wait on it; one GET is
//! issued no matter how many descents need the page. Every fetcher holds
//! one lock on the node while it waits and still holds it when its
//! continuation runs; a fetched node additionally locks both of its
//! parents for as long as it is present, which keeps the path above any
//! paged-in node paged in as well.

use tokio::sync::oneshot;

use crate::btree::cleaning;
use crate::btree::node::{Node, NodeData, NodeState, Reading, PAGENUM_NONE};
use crate::btree::{Btree, Tree};
use crate::codec;
use crate::error::{StoreError, StoreResult};
use crate::keys::{Bstr, KvPair};
use crate::pool::NodeId;

/// Free a node's data and mark it not present. The node must be present
/// and already out of the pool.
fn freedata(t: &mut Tree, n: NodeId) {
    let data = std::mem::replace(&mut t.pool.get_mut(n).data, NodeData::NotPresent);

    // A parent's children must all be bare placeholders by now (anything
    // fetched would be holding a lock on this node); drop them from the
    // arena along with the child array.
    if let NodeData::Parent { children, .. } = data {
        for child in children {
            debug_assert!(t.pool.get(child).is_not_present());
            t.pool.remove(child);
        }
    }

    let node = t.pool.get_mut(n);
    node.pagebuf = None;
    node.height = -1;
    let p_shadow = node.p_shadow;
    let p_dirty = node.p_dirty;

    // One fewer reason to keep the parents present.
    t.unlock_opt(p_shadow);
    t.unlock_opt(p_dirty);
}

/// Add a node to the pool, evicting a clean unlocked record if the pool
/// is over target.
fn make_present(t: &mut Tree, n: NodeId) {
    if let Some(victim) = t.pool.pool_add(n) {
        debug_assert_eq!(t.pool.get(victim).state, NodeState::Clean);
        freedata(t, victim);
    }
}

/// Create a new dirty node with lock count 1.
pub fn mknode(t: &mut Tree, data: NodeData, height: i8) -> NodeId {
    let mut node = Node::not_present(PAGENUM_NONE, PAGENUM_NONE, u32::MAX);
    node.state = NodeState::Dirty;
    node.height = height;
    node.mlen_t = 0;
    if let NodeData::Leaf { pairs, .. } = &data {
        node.mlen_n = if pairs.is_empty() {
            255
        } else {
            pairs[0].key.mlen(&pairs[pairs.len() - 1].key) as u8
        };
    }
    node.data = data;
    let n = t.pool.insert(node);
    make_present(t, n);
    n
}

/// Create a new dirty leaf.
pub fn mkleaf(t: &mut Tree, pairs: Vec<KvPair>) -> NodeId {
    mknode(
        t,
        NodeData::Leaf {
            pairs,
            overflow: None,
        },
        0,
    )
}

/// Create a new dirty parent.
pub fn mkparent(t: &mut Tree, height: i8, keys: Vec<Bstr>, children: Vec<NodeId>) -> NodeId {
    mknode(t, NodeData::Parent { keys, children }, height)
}

/// Fetch the node `n`, which must be not-present or already being
/// fetched. Returns with the node present and locked once for the
/// caller.
pub async fn fetch(bt: &Btree, n: NodeId) -> StoreResult<()> {
    let present = fetch_may_fail(bt, n, false).await?;
    debug_assert!(present);
    Ok(())
}

/// As [`fetch`], but if `may_fail` is set a missing page is not an
/// error: the node reverts to not-present (and unlocked) and `false` is
/// returned. A concurrent fetcher which cannot tolerate failure
/// permanently downgrades the in-flight fetch's tolerance.
pub async fn fetch_may_fail(bt: &Btree, n: NodeId, may_fail: bool) -> StoreResult<bool> {
    // Register with (or start) the read.
    let driver = {
        let mut t = bt.state();
        if t.pool.get(n).is_not_present() {
            let (pagenum, p_shadow, p_dirty) = {
                let node = t.pool.get(n);
                (node.pagenum, node.p_shadow, node.p_dirty)
            };
            make_present(&mut t, n);
            t.lock_opt(p_shadow);
            t.lock_opt(p_dirty);
            t.pool.get_mut(n).data = NodeData::Reading(Reading {
                waiters: Vec::new(),
                may_fail,
            });
            t.lock(n); // the caller's lock
            Some((pagenum, t.pagelen))
        } else if t.pool.get(n).is_reading() {
            t.lock(n); // the caller's lock
            None
        } else {
            panic!("fetching a node which is already present");
        }
    };

    match driver {
        Some((pagenum, pagelen)) => {
            // First fetcher: issue the GET and complete the read.
            let result = bt.lbs.get(pagenum, pagelen).await;
            let mut t = bt.state();
            // Take the read state now; a successful parse replaces the
            // node's payload.
            let (waiters, may_fail) = match &mut t.pool.get_mut(n).data {
                NodeData::Reading(reading) => {
                    (std::mem::take(&mut reading.waiters), reading.may_fail)
                }
                _ => unreachable!(),
            };
            let outcome = read_done(&mut t, n, result, may_fail);
            if let Ok(false) = &outcome {
                // Missing page tolerated by everyone: demote.
                demote(&mut t, n);
            }
            // Wake everyone who piled onto this fetch.
            for w in waiters {
                let _ = w.send(outcome.clone());
            }
            outcome
        }
        None => {
            // Pile onto the read in progress.
            let rx = {
                let mut t = bt.state();
                let (tx, rx) = oneshot::channel();
                match &mut t.pool.get_mut(n).data {
                    NodeData::Reading(reading) => {
                        reading.may_fail &= may_fail;
                        reading.waiters.push(tx);
                    }
                    _ => unreachable!(),
                }
                rx
            };
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(StoreError::BlockStoreFailed {
                    operation: "GET".to_string(),
                    reason: "fetch abandoned".to_string(),
                }),
            }
        }
    }
}

/* Handle a completed read: deserialize on success, decide what a
 * missing page means, surface everything else as fatal. Returns whether
 * the node is present. */
fn read_done(
    t: &mut Tree,
    n: NodeId,
    result: StoreResult<Option<Vec<u8>>>,
    may_fail: bool,
) -> StoreResult<bool> {
    let pagenum = t.pool.get(n).pagenum;
    match result {
        Ok(Some(buf)) => {
            codec::deserialize(&mut t.pool, n, &buf).map_err(|e| match e {
                StoreError::InvalidPage { reason, .. } => StoreError::InvalidPage {
                    pagenum,
                    reason,
                },
                other => other,
            })?;
            if t.pool.get(n).root {
                t.nnodes = codec::deserialize_root(&buf);
            }
            // Release the pool reference taken when the read began; the
            // fetchers' own locks remain.
            t.unlock(n);
            Ok(true)
        }
        Ok(None) => {
            if !may_fail {
                return Err(StoreError::PageMissing { pagenum });
            }
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

/* Revert a node whose page does not exist back to a bare placeholder.
 * Only a single tolerant fetcher can reach this state, so the node ends
 * up with the fetcher's one lock, which unpooling forgets. */
fn demote(t: &mut Tree, n: NodeId) {
    let (p_shadow, p_dirty) = {
        let node = t.pool.get_mut(n);
        node.data = NodeData::NotPresent;
        (node.p_shadow, node.p_dirty)
    };
    t.unlock_opt(p_shadow);
    t.unlock_opt(p_dirty);
    // The pool reference taken when the read began.
    t.unlock(n);
    t.pool.pool_del(n);
}

/// Make sure `n` is present, fetching it if needed; returns with the
/// node locked once for the caller.
pub async fn descend(bt: &Btree, n: NodeId) -> StoreResult<()> {
    {
        let mut t = bt.state();
        if t.pool.get(n).present() {
            t.lock(n);
            return Ok(());
        }
    }
    fetch(bt, n).await
}

/// Copy-on-write: create a dirty duplicate of the clean node `n`,
/// dirtying ancestors as needed, and mark `n` as shadow. The caller
/// must hold a lock on `n`. Returns the dirty duplicate.
pub fn dirty(t: &mut Tree, n: NodeId) -> NodeId {
    debug_assert!(t.pool.get(n).present());
    debug_assert_eq!(t.pool.get(n).state, NodeState::Clean);

    cleaning::notify_dirtying(t, n);

    // Ancestors get dirtied first so the new node has a dirty parent to
    // hang from.
    if !t.pool.get(n).root {
        let parent = t.pool.get(n).p_dirty.expect("clean non-root without dirty parent");
        if t.pool.get(parent).state == NodeState::Clean {
            dirty(t, parent);
        }
    }

    // Duplicate the payload by reference: pair and key clones share the
    // shadow node's backing buffers.
    let (data, height) = {
        let node = t.pool.get(n);
        let data = match &node.data {
            NodeData::Leaf { pairs, .. } => NodeData::Leaf {
                pairs: pairs.clone(),
                overflow: None,
            },
            NodeData::Parent { keys, children } => NodeData::Parent {
                keys: keys.clone(),
                children: children.clone(),
            },
            _ => unreachable!(),
        };
        (data, node.height)
    };
    let nd = mknode(t, data, height);

    {
        let (root, mlen_t, mlen_n, p_dirty) = {
            let node = t.pool.get(n);
            (node.root, node.mlen_t, node.mlen_n, node.p_dirty)
        };
        let dup = t.pool.get_mut(nd);
        dup.root = root;
        dup.mlen_t = mlen_t;
        dup.mlen_n = mlen_n;
        dup.p_dirty = p_dirty;
    }

    // The old node is now shadow: it leaves the dirty tree and picks up
    // the non-clean self-lock.
    {
        let node = t.pool.get_mut(n);
        node.state = NodeState::Shadow;
        node.p_dirty = None;
    }
    t.lock(n);

    // Children move their dirty-parent link (and the lock backing it)
    // from the shadow node to the duplicate.
    if t.pool.get(nd).is_parent() {
        let children = t.pool.get(nd).parent_children().clone();
        for c in children {
            let has_plock = t.pool.get(c).has_plock();
            if has_plock {
                t.unlock(n);
            }
            t.pool.get_mut(c).p_dirty = Some(nd);
            if has_plock {
                t.lock(nd);
            }
        }
    }

    // Splice the duplicate into the dirty tree.
    if !t.pool.get(nd).root {
        let parent = t.pool.get(nd).p_dirty.expect("dirty non-root without parent");
        let kids = match &mut t.pool.get_mut(parent).data {
            NodeData::Parent { children, .. } => children,
            _ => unreachable!(),
        };
        for slot in kids.iter_mut() {
            if *slot == n {
                *slot = nd;
            }
        }
    } else {
        let old_root = t.root_dirty.expect("dirtying a root in a rootless tree");
        t.unlock(old_root);
        t.root_dirty = Some(nd);
        t.lock(nd);
    }

    nd
}

/// Remove the node `n` from the tree and free it. If present, its lock
/// count must be exactly one (the destroyer's own) and it must not be
/// mid-fetch. Dangling child pointers in any parent are the caller's
/// problem.
pub fn destroy(t: &mut Tree, n: NodeId) {
    debug_assert!(!t.pool.get(n).is_reading());
    if !t.pool.get(n).is_not_present() {
        t.pool.pool_del(n);
        freedata(t, n);
    }
    t.pool.remove(n);
}

/// Recursively page out `n` and everything under it. Used at tree
/// teardown; the nodes must hold no locks other than child locks.
pub fn pageout_recursive(t: &mut Tree, n: NodeId) {
    if !t.pool.get(n).present() {
        return;
    }
    t.lock(n);
    if t.pool.get(n).is_parent() {
        let children = t.pool.get(n).parent_children().clone();
        for c in children {
            pageout_recursive(t, c);
        }
    }
    t.pool.pool_del(n);
    freedata(t, n);
}
