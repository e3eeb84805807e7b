// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Background log cleaning.
//!
//! An append-only store accumulates garbage: every rewrite of a page
//! leaves the old block dead, and the store can only FREE a prefix of
//! the log, up to the oldest block still live. The cleaner copies old
//! leaves forward (re-dirties them, so the next sync rewrites them at
//! fresh block numbers) until the oldest live block advances.
//!
//! How aggressively to do that is a cost question. One block-rewrite
//! costs roughly one I/O; holding a dead block costs storage-time. With
//! storage priced at `Scost` × 10^6 I/Os per GB-month, each block of
//! garbage justifies
//!
//! ```text
//! cleanrate = (pagelen / 10^9) * (1 / (86400 * 30)) * Scost * 10^6
//! ```
//!
//! cleans per second. A once-a-second tick multiplies that by the
//! current garbage count into a debt accumulator (clamped to the tree
//! size in both directions), and the cleaner works the debt off by
//! selecting groups of old leaves from the shadow tree. Selected leaves
//! are fetched and parked; the next modifying batch absorbs them,
//! re-dirtying every parked leaf so it rides along with that batch's
//! sync. If the application dirties a parked leaf on its own, the
//! cleaner just drops it: the rewrite is happening anyway.

use std::cell::RefCell;
use std::rc::Rc;

use futures_util::future::join_all;

use crate::btree::node::{NodeState, PAGENUM_NONE};
use crate::btree::{nodeops, Btree, Tree};
use crate::error::StoreResult;
use crate::pool::NodeId;

/// A batch of leaves selected for cleaning together.
pub struct CleaningGroup {
    /// Leaves fetched and parked, each holding one cleaner lock.
    pub leaves: Vec<NodeId>,
    /// Fetches (including the group-finding descent) still in flight.
    pub pending_fetches: usize,
}

/// Cleaner state.
pub struct Cleaner {
    /// Cleans per second per block of garbage.
    cleanrate: f64,
    /// How many cleans we owe.
    cleandebt: f64,
    /// A group-finding descent is in progress.
    group_pending: bool,
    /// Leaves fetching or parked across all groups.
    pending_cleans: usize,
    groups: Vec<Rc<RefCell<CleaningGroup>>>,
}

impl Cleaner {
    pub fn new() -> Self {
        Self {
            cleanrate: 0.0,
            cleandebt: 0.0,
            group_pending: false,
            pending_cleans: 0,
            groups: Vec::new(),
        }
    }

    /// Derive the clean rate from the page length and the storage cost.
    pub fn set_rate(&mut self, pagelen: usize, scost: f64) {
        self.cleanrate = (pagelen as f64 / 1_000_000_000.0)  // GB per page
            * (1.0 / 86400.0 / 30.0)                         // months per second
            * scost                                          // 10^6 I/Os per GB-month
            * 1_000_000.0; //                                   I/Os per 10^6 I/Os
    }

    /// Current debt; test observability.
    pub fn debt(&self) -> f64 {
        self.cleandebt
    }

    /// Current clean rate; test observability.
    pub fn rate(&self) -> f64 {
        self.cleanrate
    }
}

impl Default for Cleaner {
    fn default() -> Self {
        Self::new()
    }
}

/// Once-a-second debt tick.
pub fn tick(bt: &Rc<Btree>) {
    {
        let mut t = bt.state();
        // Garbage is pages on disk beyond the size of the tree. Splits
        // not yet synced can push nnodes past npages; no debt accrues
        // then.
        if t.npages >= t.nnodes {
            let garbage = (t.npages - t.nnodes) as f64;
            t.cleaner.cleandebt += garbage * t.cleaner.cleanrate;
        }

        // A debt far below zero means a recent mass delete; deeper
        // credit than the tree size would postpone cleaning absurdly
        // long. A debt above the tree size would re-clean pages which
        // are already compact.
        let nnodes = t.nnodes as f64;
        if t.cleaner.cleandebt < -nnodes {
            t.cleaner.cleandebt = -nnodes;
        }
        if t.cleaner.cleandebt > nnodes {
            t.cleaner.cleandebt = nnodes;
        }
    }
    poke(bt);
}

/// Launch a group-finding descent if the debt calls for one and the
/// in-flight limits allow it.
fn poke(bt: &Rc<Btree>) {
    let group = {
        let mut t = bt.state();
        if t.cleaner.group_pending {
            return;
        }
        // Holding more than 1/16 of the cache in parked pages is
        // plenty.
        if t.cleaner.pending_cleans > t.poolsz / 16 {
            return;
        }
        if t.cleaner.pending_cleans as f64 >= t.cleaner.cleandebt {
            return;
        }

        let group = Rc::new(RefCell::new(CleaningGroup {
            leaves: Vec::new(),
            pending_fetches: 1,
        }));
        t.cleaner.groups.push(Rc::clone(&group));
        t.cleaner.group_pending = true;
        group
    };

    let bt = Rc::clone(bt);
    tokio::task::spawn_local(async move {
        if let Err(e) = run_find(&bt, group).await {
            eprintln!("reedstore: cleaner descent failed: {}", e);
        }
    });
}

/* Descend the shadow tree along minimum-oldestncleaf children down to
 * height 1 and park every sufficiently old leaf under it. */
async fn run_find(bt: &Rc<Btree>, group: Rc<RefCell<CleaningGroup>>) -> StoreResult<()> {
    let mut n = bt
        .state_ref()
        .root_shadow
        .expect("cleaner on a rootless tree");
    nodeops::descend(bt, n).await?;

    loop {
        enum Step {
            Descend(NodeId),
            Park(Vec<NodeId>),
        }

        let step = {
            let mut t = bt.state();
            t.cleaner.group_pending = false;
            group.borrow_mut().pending_fetches -= 1;

            // A leaf is old if it lives in the oldest half of the log.
            let bound = t.nextblk.saturating_sub(t.nnodes / 2);
            let node = t.pool.get(n);

            if node.oldestncleaf >= bound {
                // Nothing old enough under here which is not already
                // being cleaned; a small tree being cleaned hard can
                // hit this. Dissolve the group and stand down.
                t.unlock(n);
                drop_group(&mut t, &group);
                return Ok(());
            }

            if node.height > 1 {
                // Keep following the oldest line down.
                let target = node.oldestncleaf;
                let child = node
                    .parent_children()
                    .iter()
                    .copied()
                    .find(|&c| t.pool.get(c).oldestncleaf == target)
                    .expect("oldestncleaf matches none of the children");
                t.cleaner.group_pending = true;
                group.borrow_mut().pending_fetches += 1;
                Step::Descend(child)
            } else if node.height == 1 {
                let mut picked = Vec::new();
                let children = t.pool.get(n).parent_children().clone();
                for c in children {
                    if t.pool.get(c).oldestncleaf < bound {
                        group.borrow_mut().pending_fetches += 1;
                        t.cleaner.pending_cleans += 1;
                        // Treat the leaf as already handled so the
                        // recomputation below looks past it.
                        t.pool.get_mut(c).oldestncleaf = PAGENUM_NONE;
                        picked.push(c);
                    }
                }
                debug_assert!(!picked.is_empty());
                recompute_oncl(&mut t, Some(n));
                Step::Park(picked)
            } else {
                // The whole tree is one leaf: park the root itself.
                group.borrow_mut().pending_fetches += 1;
                t.cleaner.pending_cleans += 1;
                t.pool.get_mut(n).oldestncleaf = PAGENUM_NONE;
                Step::Park(vec![n])
            }
        };

        match step {
            Step::Descend(child) => {
                // The parent stays locked until the child is pinned.
                nodeops::descend(bt, child).await?;
                bt.state().unlock(n);
                n = child;
            }
            Step::Park(leaves) => {
                let results =
                    join_all(leaves.iter().map(|&c| nodeops::descend(bt, c))).await;
                for r in results {
                    r?;
                }
                let mut t = bt.state();
                for c in leaves {
                    group.borrow_mut().pending_fetches -= 1;
                    if t.pool.get(c).state != NodeState::Clean {
                        // Dirtied while we fetched it; someone else is
                        // already rewriting it.
                        t.cleaner.pending_cleans -= 1;
                        t.unlock(c);
                        continue;
                    }
                    // Parked: the descend lock becomes the cleaner's.
                    t.pool.get_mut(c).cstate = Some(Rc::clone(&group));
                    group.borrow_mut().leaves.push(c);
                }
                // The find's own descent lock.
                t.unlock(n);
                drop_group_if_empty(&mut t, &group);
                drop(t);
                poke(bt);
                return Ok(());
            }
        }
    }
}

/* Recompute oldestncleaf from the children, here and up the shadow
 * tree. */
fn recompute_oncl(t: &mut Tree, n: Option<NodeId>) {
    let Some(n) = n else { return };
    let children = t.pool.get(n).parent_children().clone();
    let mut oldest = PAGENUM_NONE;
    for c in children {
        oldest = oldest.min(t.pool.get(c).oldestncleaf);
    }
    t.pool.get_mut(n).oldestncleaf = oldest;
    let up = t.pool.get(n).p_shadow;
    recompute_oncl(t, up);
}

/* Unlink a group from the cleaner. */
fn drop_group(t: &mut Tree, group: &Rc<RefCell<CleaningGroup>>) {
    debug_assert!(group.borrow().leaves.is_empty());
    debug_assert_eq!(group.borrow().pending_fetches, 0);
    t.cleaner.groups.retain(|g| !Rc::ptr_eq(g, group));
}

fn drop_group_if_empty(t: &mut Tree, group: &Rc<RefCell<CleaningGroup>>) {
    let empty = {
        let g = group.borrow();
        g.leaves.is_empty() && g.pending_fetches == 0
    };
    if empty {
        drop_group(t, group);
    }
}

/// Detach a parked leaf from its group.
fn detach(t: &mut Tree, n: NodeId) {
    let group = t
        .pool
        .get_mut(n)
        .cstate
        .take()
        .expect("detaching a leaf the cleaner does not hold");
    group.borrow_mut().leaves.retain(|&x| x != n);
    t.unlock(n);
    t.cleaner.pending_cleans -= 1;
    drop_group_if_empty(t, &group);
}

/// Notification that a page is about to be dirtied.
///
/// Dirtying is itself cleaning: the page's old block becomes garbage
/// and the new copy is young. Credit the debt in proportion to the
/// page's age, and release the leaf if the cleaner was holding it.
pub fn notify_dirtying(t: &mut Tree, n: NodeId) {
    if t.npages > 0 {
        let age = (t.nextblk - t.pool.get(n).pagenum) as f64;
        t.cleaner.cleandebt -= age / t.npages as f64;
    }

    let node = t.pool.get(n);
    if node.is_leaf() && node.state == NodeState::Clean && node.cstate.is_some() {
        detach(t, n);
    }
}

/// True if any group has finished fetching and is waiting for a
/// modifying batch to absorb it.
pub fn possible(t: &Tree) -> bool {
    t.cleaner
        .groups
        .iter()
        .any(|g| g.borrow().pending_fetches == 0)
}

/// Re-dirty every leaf in every fetched group; called while a modifying
/// batch is being dirtied so the rewrites ride along with its sync.
pub fn clean(t: &mut Tree) {
    let ready: Vec<Rc<RefCell<CleaningGroup>>> = t
        .cleaner
        .groups
        .iter()
        .filter(|g| g.borrow().pending_fetches == 0)
        .cloned()
        .collect();
    for group in ready {
        let leaves = group.borrow().leaves.clone();
        for leaf in leaves {
            // Dirtying detaches the leaf from the group.
            if t.pool.get(leaf).state == NodeState::Clean {
                nodeops::dirty(t, leaf);
            }
        }
    }
}

/// Wind the cleaner down. Parked leaves are detached rather than
/// re-dirtied — they are clean pages, so abandoning them loses nothing
/// and keeps shutdown from creating work of its own. In-flight
/// discovery is waited out.
pub async fn stop(bt: &Rc<Btree>) {
    loop {
        let busy = {
            let mut t = bt.state();
            let parked: Vec<NodeId> = t
                .cleaner
                .groups
                .iter()
                .filter(|g| g.borrow().pending_fetches == 0)
                .flat_map(|g| g.borrow().leaves.clone())
                .collect();
            for leaf in parked {
                detach(&mut t, leaf);
            }
            t.cleaner.group_pending || t.cleaner.pending_cleans > 0
        };
        if !busy {
            break;
        }
        tokio::task::yield_now().await;
    }
}
