// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Copy-on-write B+Tree over a log-structured block store.
//!
//! The tree keeps two roots. `root_shadow` is the durably committed
//! view and serves reads; `root_dirty` is the in-progress view and takes
//! modifications. A modification copies the touched leaf (and any clean
//! ancestors) into fresh dirty nodes; unchanged subtrees are shared
//! between the two views by reference. Syncing appends every dirty page
//! to the block store in one batch, marks the dirty tree clean, and
//! retires the old shadow tree.
//!
//! ## Invariants
//!
//! 1. `root_shadow` is never dirty; `root_dirty` is never shadow.
//! 2. `root_shadow == root_dirty` iff both are clean (no uncommitted
//!    changes).
//! 3. Every node in the pool is reachable from one of the roots.
//!
//! ## Concurrency
//!
//! Everything runs on one thread. The engine state lives in a `RefCell`
//! and is only borrowed between await points; suspension happens at
//! block-store I/O and nowhere else.

use std::cell::{Ref, RefCell, RefMut};
use std::rc::Rc;
use std::time::Duration;

use crate::btree::cleaning::Cleaner;
use crate::btree::node::{Node, NodeData, PAGENUM_NONE};
use crate::codec;
use crate::error::{StoreError, StoreResult};
use crate::lbs::BlockStore;
use crate::pool::{NodeId, Pool};

pub mod balance;
pub mod cleaning;
pub mod find;
pub mod merge;
pub mod mlen;
pub mod mutate;
pub mod node;
pub mod nodeops;
pub mod split;
pub mod sync;

#[cfg(test)]
mod mod_test;
#[cfg(test)]
mod split_test;

/// Time between advisory FREE calls and cleaner debt ticks.
const TIMER_PERIOD: Duration = Duration::from_secs(1);

/// Tuning knobs for opening a tree.
pub struct TreeConfig {
    /// Cache target in pages. Mutually exclusive with `cache_bytes`.
    pub cache_pages: Option<u64>,
    /// Cache target in bytes, resolved to pages once the page length is
    /// known.
    pub cache_bytes: Option<u64>,
    /// Maximum key length; defaulted from the page length if unset.
    pub keymax: Option<u64>,
    /// Maximum value length; defaulted from the page length if unset.
    pub valmax: Option<u64>,
    /// Cost of a GB-month of storage as a multiple of 10^6 I/Os; zero
    /// disables the log cleaner.
    pub storage_cost: f64,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            cache_pages: None,
            cache_bytes: None,
            keymax: None,
            valmax: None,
            storage_cost: 1.0,
        }
    }
}

/// Mutable engine state: the node arena and the two tree views.
pub struct Tree {
    /// Page length in bytes, learned from the block store.
    pub pagelen: usize,
    /// Cache target in pages.
    pub poolsz: usize,
    /// Next writable block number.
    pub nextblk: u64,
    /// Root of the shadow (committed) tree.
    pub root_shadow: Option<NodeId>,
    /// Root of the dirty (in-progress) tree.
    pub root_dirty: Option<NodeId>,
    /// Node arena and eviction pool.
    pub pool: Pool<Node>,
    /// Number of nodes in the dirty tree.
    pub nnodes: u64,
    /// Number of block-store pages in use.
    pub npages: u64,
    /// Log cleaner state.
    pub cleaner: Cleaner,
}

impl Tree {
    pub fn lock(&mut self, n: NodeId) {
        self.pool.lock(n);
    }

    pub fn unlock(&mut self, n: NodeId) {
        self.pool.unlock(n);
    }

    pub fn lock_opt(&mut self, n: Option<NodeId>) {
        if let Some(n) = n {
            self.pool.lock(n);
        }
    }

    pub fn unlock_opt(&mut self, n: Option<NodeId>) {
        if let Some(n) = n {
            self.pool.unlock(n);
        }
    }
}

/// Handle on an open tree: the shared state plus the block store it
/// persists into.
pub struct Btree {
    pub lbs: BlockStore,
    state: RefCell<Tree>,
    /// Maximum key length accepted by this tree.
    pub keymax: usize,
    /// Maximum value length accepted by this tree.
    pub valmax: usize,
    tasks: RefCell<Vec<tokio::task::JoinHandle<()>>>,
}

impl Btree {
    /// Borrow the engine state mutably. Never held across an await.
    pub fn state(&self) -> RefMut<'_, Tree> {
        self.state.borrow_mut()
    }

    /// Borrow the engine state immutably.
    pub fn state_ref(&self) -> Ref<'_, Tree> {
        self.state.borrow()
    }

    /// Open a tree over `lbs`.
    ///
    /// Learns the page length from the store, validates the key/value
    /// limits against it, recovers the root by scanning back from the
    /// last written block (creating and syncing an empty root if the
    /// store is empty), and starts the background FREE and cleaner
    /// timers.
    ///
    /// ## Error Conditions
    /// - `InvalidCacheSize`: Resolved cache target outside [2^10, 2^30]
    /// - `LimitsTooLarge`: Key/value limits do not fit the page length
    /// - `RootNotFound`: The store has blocks but none is a root page
    pub async fn open(lbs: BlockStore, config: TreeConfig) -> StoreResult<Rc<Btree>> {
        let params = lbs.params2().await?;
        let pagelen = params.blklen;
        let mut storage_cost = config.storage_cost;

        // Resolve the cache target to whole pages.
        let npages = match (config.cache_pages, config.cache_bytes) {
            (Some(pages), None) => pages,
            (None, Some(bytes)) => bytes / pagelen as u64,
            (None, None) => (128 * 1024 * 1024) / pagelen as u64,
            (Some(_), Some(_)) => panic!("cache_pages and cache_bytes are mutually exclusive"),
        };
        if !(1024..=1024 * 1024 * 1024).contains(&npages) {
            return Err(StoreError::InvalidCacheSize { pages: npages });
        }

        // Default key/value limits, tighter for smaller pages.
        let keymax = config.keymax.unwrap_or(match pagelen {
            0..=1023 => 64,
            1024..=2047 => 128,
            _ => 255,
        });
        let valmax = config.valmax.unwrap_or(match pagelen {
            0..=1023 => 96,
            1024..=2047 => 192,
            _ => 255,
        });

        // The tree needs three max-size pairs per leaf and a sane
        // branching factor per parent.
        if (keymax + valmax + 2) as usize > pagelen / 3 {
            return Err(StoreError::LimitsTooLarge {
                keylen: keymax,
                vallen: valmax,
                pagelen,
            });
        }
        if 3 * keymax as usize + 3 + 4 * codec::PERCHILD + codec::OVERHEAD > pagelen * 2 / 3 {
            return Err(StoreError::LimitsTooLarge {
                keylen: keymax,
                vallen: valmax,
                pagelen,
            });
        }

        let tree = Tree {
            pagelen,
            poolsz: npages as usize,
            nextblk: params.nextblk,
            root_shadow: None,
            root_dirty: None,
            pool: Pool::new(npages as usize),
            nnodes: 0,
            npages: 0,
            cleaner: Cleaner::new(),
        };
        let bt = Rc::new(Btree {
            lbs,
            state: RefCell::new(tree),
            keymax: keymax as usize,
            valmax: valmax as usize,
            tasks: RefCell::new(Vec::new()),
        });

        // Look for a root page by scanning backwards from the last
        // block the store reports having written.
        let mut found = None;
        let mut rootblk = params.lastblk;
        while rootblk < params.nextblk {
            let n = {
                let mut t = bt.state();
                t.pool
                    .insert(Node::not_present(rootblk, PAGENUM_NONE, u32::MAX))
            };
            let present = nodeops::fetch_may_fail(&bt, n, true).await?;
            {
                let mut t = bt.state();
                if present && t.pool.get(n).root {
                    found = Some(n);
                    break;
                }
                nodeops::destroy(&mut t, n);
            }
            rootblk = rootblk.wrapping_sub(1);
        }

        match found {
            Some(root) => {
                let mut t = bt.state();
                let size = codec::serialize_size(&mut t.pool, root) as u32;
                t.pool.get_mut(root).pagesize = Some(size);

                // Recover oldestleaf from the child descriptors.
                let kids = match &t.pool.get(root).data {
                    NodeData::Parent { children, .. } => Some(children.clone()),
                    NodeData::Leaf { .. } => None,
                    _ => unreachable!(),
                };
                let oldestleaf = match kids {
                    Some(kids) => kids
                        .iter()
                        .fold(PAGENUM_NONE, |acc, &c| acc.min(t.pool.get(c).oldestleaf)),
                    None => t.pool.get(root).pagenum,
                };
                let node = t.pool.get_mut(root);
                node.oldestleaf = oldestleaf;
                node.oldestncleaf = oldestleaf;

                t.npages = t.nextblk - oldestleaf;

                // The node roots both views: it keeps the fetch lock as
                // the dirty-root lock and gains one as the shadow root.
                t.root_dirty = Some(root);
                t.root_shadow = Some(root);
                t.lock(root);
            }
            None => {
                // Any non-empty store must contain a root.
                if params.nextblk > 0 {
                    return Err(StoreError::RootNotFound {
                        nextblk: params.nextblk,
                    });
                }

                // Create an empty leaf root and sync it out.
                {
                    let mut t = bt.state();
                    let root = nodeops::mkleaf(&mut t, Vec::new());
                    t.pool.get_mut(root).root = true;
                    t.lock(root);
                    t.root_dirty = Some(root);
                    t.nnodes = 1;
                }
                sync::sync(&bt).await?;

                // A first APPEND landing anywhere but block 0 means the
                // block space is sparse; block-age arithmetic would be
                // meaningless, so disable the cleaner.
                if bt.state().nextblk != 1 {
                    storage_cost = 0.0;
                }
            }
        }

        bt.state().cleaner.set_rate(pagelen, storage_cost);
        bt.start_timers();

        Ok(bt)
    }

    /* Start the periodic FREE and cleaner debt tasks. */
    fn start_timers(self: &Rc<Self>) {
        let bt = Rc::clone(self);
        let free_task = tokio::task::spawn_local(async move {
            loop {
                tokio::time::sleep(TIMER_PERIOD).await;
                let oldest = {
                    let t = bt.state_ref();
                    match t.root_shadow {
                        Some(root) => t.pool.get(root).oldestleaf,
                        None => continue,
                    }
                };
                if let Err(e) = bt.lbs.free(oldest).await {
                    eprintln!("reedstore: FREE request failed: {}", e);
                    break;
                }
            }
        });

        let bt = Rc::clone(self);
        let clean_task = tokio::task::spawn_local(async move {
            loop {
                tokio::time::sleep(TIMER_PERIOD).await;
                cleaning::tick(&bt);
            }
        });

        let mut tasks = self.tasks.borrow_mut();
        tasks.push(free_task);
        tasks.push(clean_task);
    }

    /// Shut down the tree. There must be no uncommitted changes
    /// (`root_shadow == root_dirty`) and no requests in flight.
    pub async fn close(self: &Rc<Self>) {
        {
            let t = self.state_ref();
            assert_eq!(t.root_shadow, t.root_dirty, "closing a tree with dirty nodes");
        }

        for task in self.tasks.borrow_mut().drain(..) {
            task.abort();
        }

        // Let the cleaner finish or abandon whatever it was doing.
        cleaning::stop(self).await;

        let mut t = self.state();
        if let Some(root) = t.root_shadow {
            // Release the two root locks (one per view).
            t.unlock(root);
            t.unlock(root);
            nodeops::pageout_recursive(&mut t, root);
            t.pool.remove(root);
            t.root_shadow = None;
            t.root_dirty = None;
        }
    }

}

/* Sanity checks used by tests: walk the tree and verify the §3 lock
 * formula and parent/child invariants on every reachable node. */
#[cfg(test)]
pub(crate) mod sanity {
    use super::*;
    use crate::btree::node::NodeState;
    use std::collections::HashMap;

    fn walk(t: &Tree, n: NodeId, expected: &mut HashMap<NodeId, usize>) {
        if expected.contains_key(&n) {
            return;
        }
        let node = t.pool.get(n);
        let mut locks = 0;
        if node.root {
            // One root lock per view rooted here.
            if t.root_shadow == Some(n) {
                locks += 1;
            }
            if t.root_dirty == Some(n) {
                locks += 1;
            }
        }
        if node.state != NodeState::Clean {
            locks += 1;
        }
        if node.is_leaf() && node.state == NodeState::Clean && node.cstate.is_some() {
            locks += 1;
        }
        expected.insert(n, locks);
        if node.is_parent() {
            for &c in node.parent_children() {
                walk(t, c, expected);
                if t.pool.get(c).has_plock() {
                    // A fetched child locks each of its parents.
                    let child = t.pool.get(c);
                    if child.p_shadow == Some(n) {
                        *expected.get_mut(&n).unwrap() += 1;
                    }
                    if child.p_dirty == Some(n) {
                        *expected.get_mut(&n).unwrap() += 1;
                    }
                }
            }
        }
    }

    /// Check the lock-count formula on every reachable node. Only valid
    /// in quiescent states (no requests or fetches in flight).
    pub fn check_locks(t: &Tree) {
        let mut expected = HashMap::new();
        if let Some(root) = t.root_shadow {
            walk(t, root, &mut expected);
        }
        if let Some(root) = t.root_dirty {
            walk(t, root, &mut expected);
        }
        for (n, locks) in expected {
            if t.pool.get(n).present() || t.pool.get(n).is_reading() {
                assert_eq!(
                    t.pool.lockcount(n),
                    locks,
                    "lock count mismatch on {:?}",
                    n
                );
            }
        }
    }
}
