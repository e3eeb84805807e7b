// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! In-memory block store.
//!
//! An append-only vector of fixed-size blocks with the same observable
//! behaviour as an LBS daemon: strictly increasing block numbers, GET of
//! a freed or never-written block reports "does not exist", APPEND at
//! the wrong position reports a writer race, and FREE actually discards
//! blocks so that cleaner progress is visible to tests.
//!
//! The store lives behind `Rc`: tests keep their own handle and re-open
//! a fresh engine against it to exercise crash recovery.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::{StoreError, StoreResult};
use crate::lbs::StoreParams;

struct MemState {
    /// One entry per block ever appended; None once freed.
    blocks: Vec<Option<Vec<u8>>>,
    /// Everything below this block number has been freed.
    deleted_to: u64,
    /// Number of GET requests served; test observability.
    gets: usize,
}

/// In-memory append-only block store.
pub struct MemStore {
    blklen: usize,
    state: RefCell<MemState>,
}

impl MemStore {
    /// Create an empty store with `blklen`-byte blocks.
    pub fn new(blklen: usize) -> Rc<Self> {
        Rc::new(Self {
            blklen,
            state: RefCell::new(MemState {
                blocks: Vec::new(),
                deleted_to: 0,
                gets: 0,
            }),
        })
    }

    pub fn params2(&self) -> StoreParams {
        let state = self.state.borrow();
        StoreParams {
            blklen: self.blklen,
            nextblk: state.blocks.len() as u64,
            // Highest block ever written; wraps to u64::MAX when empty,
            // which ends a scan-back loop immediately.
            lastblk: (state.blocks.len() as u64).wrapping_sub(1),
        }
    }

    pub fn get(&self, blkno: u64) -> Option<Vec<u8>> {
        let mut state = self.state.borrow_mut();
        state.gets += 1;
        if blkno >= state.blocks.len() as u64 {
            return None;
        }
        state.blocks[blkno as usize].clone()
    }

    /// Number of GET requests served so far; test observability.
    pub fn get_count(&self) -> usize {
        self.state.borrow().gets
    }

    pub fn append(&self, blkno: u64, blklen: usize, pages: &[Rc<[u8]>]) -> StoreResult<u64> {
        if blklen != self.blklen {
            return Err(StoreError::BlockStoreFailed {
                operation: "APPEND".to_string(),
                reason: format!("block length {} does not match store {}", blklen, self.blklen),
            });
        }
        let mut state = self.state.borrow_mut();
        if blkno != state.blocks.len() as u64 {
            return Err(StoreError::AppendConflict { expected: blkno });
        }
        for page in pages {
            debug_assert_eq!(page.len(), self.blklen);
            state.blocks.push(Some(page.to_vec()));
        }
        Ok(state.blocks.len() as u64)
    }

    pub fn free(&self, blkno: u64) {
        let mut state = self.state.borrow_mut();
        let limit = (blkno.min(state.blocks.len() as u64)) as usize;
        for i in (state.deleted_to as usize)..limit {
            state.blocks[i] = None;
        }
        state.deleted_to = state.deleted_to.max(blkno.min(state.blocks.len() as u64));
    }

    /// Number of live (not freed) blocks; test observability.
    pub fn live_blocks(&self) -> usize {
        self.state
            .borrow()
            .blocks
            .iter()
            .filter(|b| b.is_some())
            .count()
    }

    /// Lowest live block number, if any; test observability.
    pub fn oldest_live(&self) -> Option<u64> {
        let state = self.state.borrow();
        state
            .blocks
            .iter()
            .position(|b| b.is_some())
            .map(|i| i as u64)
    }
}
