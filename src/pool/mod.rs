// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Record arena and page pool with lock-aware eviction.
//!
//! All B+Tree nodes live in a slab arena and are addressed by `NodeId`
//! handles rather than pointers; parent and child links between nodes are
//! handles into the same arena. The arena doubles as the page pool: a
//! record can be *pooled* (counted against the cache target and, while
//! its lock count is zero, queued for eviction) or merely allocated (a
//! not-present placeholder).
//!
//! ## Locking
//!
//! Locks are plain per-record counters, not mutexes. Locking a record
//! with count zero removes it from the eviction queue; unlocking back to
//! zero appends it to the tail. The queue is therefore an LRU over
//! unlocked pooled records, and eviction takes its head.
//!
//! ## Capacity
//!
//! The pool has a fixed target size. Inserting a pooled record beyond
//! the target returns an eviction victim if any record is unlocked; if
//! every record is locked the pool temporarily exceeds its target and
//! shrinks back through later removals.

use std::fmt;


/// Handle of a record in the arena.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Pool bookkeeping attached to every occupied slot.
struct Hook {
    /// Number of unlocks required before this record can be evicted.
    locks: usize,
    /// True if the record counts against the pool target.
    pooled: bool,
    /// Previous record in the eviction queue (locks == 0 only).
    prev: Option<NodeId>,
    /// Next record in the eviction queue (locks == 0 only).
    next: Option<NodeId>,
}

enum Slot<T> {
    Vacant { next_free: Option<u32> },
    Occupied { rec: T, hook: Hook },
}

/// Arena of records plus the eviction pool over those records.
pub struct Pool<T> {
    /// Target number of pooled records.
    target: usize,
    /// Current number of pooled records.
    used: usize,
    slots: Vec<Slot<T>>,
    free_head: Option<u32>,
    evict_head: Option<NodeId>,
    evict_tail: Option<NodeId>,
}

impl<T> Pool<T> {
    /// Create a pool aiming to keep at most `target` pooled records.
    pub fn new(target: usize) -> Self {
        Self {
            target,
            used: 0,
            slots: Vec::new(),
            free_head: None,
            evict_head: None,
            evict_tail: None,
        }
    }

    /// Target number of pooled records.
    pub fn target(&self) -> usize {
        self.target
    }

    /// Current number of pooled records.
    pub fn pooled(&self) -> usize {
        self.used
    }

    /// Allocate an arena slot for `rec` without pooling it.
    pub fn insert(&mut self, rec: T) -> NodeId {
        let hook = Hook {
            locks: 0,
            pooled: false,
            prev: None,
            next: None,
        };
        match self.free_head {
            Some(idx) => {
                let slot = &mut self.slots[idx as usize];
                self.free_head = match slot {
                    Slot::Vacant { next_free } => *next_free,
                    Slot::Occupied { .. } => unreachable!("free list points at occupied slot"),
                };
                *slot = Slot::Occupied { rec, hook };
                NodeId(idx)
            }
            None => {
                self.slots.push(Slot::Occupied { rec, hook });
                NodeId((self.slots.len() - 1) as u32)
            }
        }
    }

    /// Release the arena slot of `id`. The record must not be pooled.
    pub fn remove(&mut self, id: NodeId) -> T {
        let slot = std::mem::replace(
            &mut self.slots[id.index()],
            Slot::Vacant {
                next_free: self.free_head,
            },
        );
        self.free_head = Some(id.0);
        match slot {
            Slot::Occupied { rec, hook } => {
                assert!(!hook.pooled, "removing a pooled record");
                rec
            }
            Slot::Vacant { .. } => panic!("removing a vacant slot"),
        }
    }

    pub fn get(&self, id: NodeId) -> &T {
        match &self.slots[id.index()] {
            Slot::Occupied { rec, .. } => rec,
            Slot::Vacant { .. } => panic!("accessing a vacant slot"),
        }
    }

    pub fn get_mut(&mut self, id: NodeId) -> &mut T {
        match &mut self.slots[id.index()] {
            Slot::Occupied { rec, .. } => rec,
            Slot::Vacant { .. } => panic!("accessing a vacant slot"),
        }
    }

    fn hook(&self, id: NodeId) -> &Hook {
        match &self.slots[id.index()] {
            Slot::Occupied { hook, .. } => hook,
            Slot::Vacant { .. } => panic!("accessing a vacant slot"),
        }
    }

    fn hook_mut(&mut self, id: NodeId) -> &mut Hook {
        match &mut self.slots[id.index()] {
            Slot::Occupied { hook, .. } => hook,
            Slot::Vacant { .. } => panic!("accessing a vacant slot"),
        }
    }

    /// Pool the record `id` with lock count 1. If the pool is over target
    /// and some record is evictable, dequeue and unpool it and return its
    /// handle; the caller is responsible for discarding its contents.
    pub fn pool_add(&mut self, id: NodeId) -> Option<NodeId> {
        {
            let hook = self.hook_mut(id);
            assert!(!hook.pooled, "record already pooled");
            hook.pooled = true;
            hook.locks = 1;
        }
        self.used += 1;

        if self.used > self.target {
            if let Some(victim) = self.evict_head {
                self.queue_del(victim);
                let hook = self.hook_mut(victim);
                hook.pooled = false;
                self.used -= 1;
                return Some(victim);
            }
        }
        None
    }

    /// Unpool the record `id`, which must hold exactly one lock.
    pub fn pool_del(&mut self, id: NodeId) {
        let hook = self.hook_mut(id);
        assert!(hook.pooled, "record not pooled");
        debug_assert_eq!(hook.locks, 1, "unpooling a record with extra locks");
        hook.pooled = false;
        hook.locks = 0;
        self.used -= 1;
    }

    /// Increment the lock count of `id`.
    pub fn lock(&mut self, id: NodeId) {
        let hook = self.hook_mut(id);
        hook.locks += 1;
        if hook.locks == 1 && hook.pooled {
            self.queue_del(id);
        }
    }

    /// Decrement the lock count of `id`.
    pub fn unlock(&mut self, id: NodeId) {
        let hook = self.hook_mut(id);
        assert!(hook.locks > 0, "unlocking an unlocked record");
        hook.locks -= 1;
        if hook.locks == 0 && hook.pooled {
            self.queue_add(id);
        }
    }

    /// Lock count of `id`.
    pub fn lockcount(&self, id: NodeId) -> usize {
        self.hook(id).locks
    }

    /* Append to the tail of the eviction queue. */
    fn queue_add(&mut self, id: NodeId) {
        let tail = self.evict_tail;
        {
            let hook = self.hook_mut(id);
            hook.next = None;
            hook.prev = tail;
        }
        match tail {
            Some(t) => self.hook_mut(t).next = Some(id),
            None => self.evict_head = Some(id),
        }
        self.evict_tail = Some(id);
    }

    /* Unlink from the eviction queue. */
    fn queue_del(&mut self, id: NodeId) {
        let (prev, next) = {
            let hook = self.hook(id);
            (hook.prev, hook.next)
        };
        match prev {
            Some(p) => self.hook_mut(p).next = next,
            None => self.evict_head = next,
        }
        match next {
            Some(n) => self.hook_mut(n).prev = prev,
            None => self.evict_tail = prev,
        }
    }
}
