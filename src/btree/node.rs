// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! In-memory B+Tree node records.
//!
//! A node is clean (the durable copy), shadow (the durable copy of a
//! node which has been modified) or dirty (the not-yet-written copy).
//! Present nodes are pooled; a not-present node is a placeholder created
//! when its parent was parsed, holding only the child descriptor read
//! from the parent's page.
//!
//! Parent links come in pairs: `p_shadow` chains a node into the shadow
//! tree, `p_dirty` into the dirty tree.
//!
//! Invariants on nodes and their parents:
//! 1. A node is a root iff it has no parents.
//! 2. A clean non-root has a shadow parent and a dirty parent.
//! 3. A shadow non-root has only a shadow parent.
//! 4. A dirty non-root has only a dirty parent.
//! 5. A shadow parent is not a dirty node; a dirty parent is not a
//!    shadow node.
//!
//! A node is locked once if it is a root, once if it is not clean, once
//! if it is a clean leaf held by the cleaner, once per present child,
//! and once per pending fetch waiter (plus the fetch's own pool
//! reference while the read is in flight).

use std::cell::RefCell;
use std::rc::Rc;

use tokio::sync::oneshot;

use crate::btree::cleaning::CleaningGroup;
use crate::btree::mutate::KvHash;
use crate::error::StoreResult;
use crate::keys::{Bstr, KvPair};
use crate::pool::NodeId;

/// Sentinel page number: "no page" / "infinitely new".
pub const PAGENUM_NONE: u64 = u64::MAX;

/// Node state.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum NodeState {
    /// The only copy of this node.
    Clean,
    /// Old version of a modified node.
    Shadow,
    /// New version of a modified node.
    Dirty,
}

/// Fetch-in-progress state.
pub struct Reading {
    /// Fetchers waiting for the read; each holds one lock on the node.
    /// They are told whether the node came up present.
    pub waiters: Vec<oneshot::Sender<StoreResult<bool>>>,
    /// True while every waiter tolerates a missing page.
    pub may_fail: bool,
}

/// Type-dependent node payload.
pub enum NodeData {
    /// Placeholder: the page has not been fetched.
    NotPresent,
    /// The page is being fetched.
    Reading(Reading),
    /// Separator keys plus `keys.len() + 1` children.
    Parent {
        keys: Vec<Bstr>,
        children: Vec<NodeId>,
    },
    /// Sorted key-value pairs; `overflow` only while the leaf is mutable.
    Leaf {
        pairs: Vec<KvPair>,
        overflow: Option<KvHash>,
    },
}

/// A B+Tree node.
pub struct Node {
    /// Page number for clean/shadow nodes; PAGENUM_NONE for dirty nodes.
    pub pagenum: u64,

    /// Least page number of a leaf under this node (clean/shadow);
    /// PAGENUM_NONE for dirty nodes.
    pub oldestleaf: u64,

    /// As `oldestleaf` but ignoring leaves held by the cleaner
    /// (PAGENUM_NONE if every leaf under this node is being cleaned).
    pub oldestncleaf: u64,

    /// Cached serialised size in bytes; None if it must be recomputed.
    pub pagesize: Option<u32>,

    pub state: NodeState,

    /// True if this node is a root.
    pub root: bool,

    /// True if this node is to be merged into the next sibling.
    pub merging: bool,

    /// True if this node must be reconsidered for merging.
    pub needmerge: bool,

    /// Height (leaf = 0); -1 if not present.
    pub height: i8,

    /// Prefix length shared by every key in this subtree.
    pub mlen_t: u8,

    /// Prefix length shared by the keys held directly in this leaf.
    pub mlen_n: u8,

    /// Parent in the shadow tree.
    pub p_shadow: Option<NodeId>,

    /// Parent in the dirty tree.
    pub p_dirty: Option<NodeId>,

    pub data: NodeData,

    /// Retained serialised page for clean/shadow nodes. Keys and values
    /// in the payload are slices into this buffer.
    pub pagebuf: Option<Rc<[u8]>>,

    /// Cleaner hook: set while a clean leaf is attached to a cleaning
    /// group.
    pub cstate: Option<Rc<RefCell<CleaningGroup>>>,
}

impl Node {
    /// Create a not-present placeholder from a child descriptor.
    pub fn not_present(pagenum: u64, oldestleaf: u64, pagesize: u32) -> Self {
        Self {
            pagenum,
            oldestleaf,
            oldestncleaf: oldestleaf,
            pagesize: if pagesize == u32::MAX {
                None
            } else {
                Some(pagesize)
            },
            state: NodeState::Clean,
            root: false,
            merging: false,
            needmerge: false,
            height: -1,
            mlen_t: 0,
            mlen_n: 0,
            p_shadow: None,
            p_dirty: None,
            data: NodeData::NotPresent,
            pagebuf: None,
            cstate: None,
        }
    }

    /// True if the node is a parent or a leaf.
    pub fn present(&self) -> bool {
        matches!(self.data, NodeData::Parent { .. } | NodeData::Leaf { .. })
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.data, NodeData::Leaf { .. })
    }

    pub fn is_parent(&self) -> bool {
        matches!(self.data, NodeData::Parent { .. })
    }

    pub fn is_reading(&self) -> bool {
        matches!(self.data, NodeData::Reading(_))
    }

    pub fn is_not_present(&self) -> bool {
        matches!(self.data, NodeData::NotPresent)
    }

    /// True if the node holds locks on its parents (anything fetched or
    /// being fetched does; bare placeholders do not).
    pub fn has_plock(&self) -> bool {
        !matches!(self.data, NodeData::NotPresent)
    }

    /// Number of keys in a parent or leaf.
    pub fn nkeys(&self) -> usize {
        match &self.data {
            NodeData::Parent { keys, .. } => keys.len(),
            NodeData::Leaf { pairs, .. } => pairs.len(),
            _ => panic!("nkeys on a non-present node"),
        }
    }

    pub fn leaf_pairs(&self) -> &Vec<KvPair> {
        match &self.data {
            NodeData::Leaf { pairs, .. } => pairs,
            _ => panic!("not a leaf"),
        }
    }

    pub fn leaf_pairs_mut(&mut self) -> &mut Vec<KvPair> {
        match &mut self.data {
            NodeData::Leaf { pairs, .. } => pairs,
            _ => panic!("not a leaf"),
        }
    }

    pub fn parent_keys(&self) -> &Vec<Bstr> {
        match &self.data {
            NodeData::Parent { keys, .. } => keys,
            _ => panic!("not a parent"),
        }
    }

    pub fn parent_children(&self) -> &Vec<NodeId> {
        match &self.data {
            NodeData::Parent { children, .. } => children,
            _ => panic!("not a parent"),
        }
    }

    pub fn parent_child(&self, i: usize) -> NodeId {
        self.parent_children()[i]
    }
}
