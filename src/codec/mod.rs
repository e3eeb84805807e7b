// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! B+Tree page format.
//!
//! Every node serialises to exactly one fixed-length page:
//!
//! ```text
//! offset length data
//! ====== ====== ====
//!      0      6 "KVLDS\0"
//!      6      2 BE number of keys (N)
//!      8      1 X = height + 0x80 * rootedness (leaf <=> height 0)
//!      9      1 prefix length shared by all keys in this subtree
//! if root:
//!     10      8 BE number of nodes in the tree
//! then DATA, then zero padding to the page length.
//! ```
//!
//! Leaf DATA is N serialised keys followed by N serialised values. Parent
//! DATA is N serialised separator keys followed by N+1 child descriptors
//! of 20 bytes each (8 B child page number, 8 B page number of the oldest
//! leaf under the child, 4 B child page size). A serialised key or value
//! is a one-byte length followed by 0–255 bytes of content.
//!
//! Deserialisation retains the page buffer and leaves every key and value
//! as a slice into it; nothing is allocated per string. The serialiser
//! re-points a dirty node's strings into its freshly written buffer,
//! which is what finally releases any shadow page bytes the node was
//! still borrowing.

use std::rc::Rc;

use crate::btree::node::{Node, NodeData, NodeState, PAGENUM_NONE};
use crate::error::{StoreError, StoreResult};
use crate::keys::{Bstr, KvPair};
use crate::pool::{NodeId, Pool};


/// Page header bytes common to every node.
pub const OVERHEAD: usize = 10;

/// Extra header bytes carried by a root page.
pub const ROOT_EXTRA: usize = 8;

/// Bytes per child descriptor in a parent node.
pub const PERCHILD: usize = 20;

/// Tallest tree a root page may describe.
pub const MAX_HEIGHT: i8 = 63;

const MAGIC: &[u8; 6] = b"KVLDS\0";

/// Return (computing and caching if needed) the serialised size of the
/// node `n` in bytes.
///
/// For a parent, children marked `merging` contribute nothing: they are
/// about to be collapsed into a sibling and will not be written.
pub fn serialize_size(pool: &mut Pool<Node>, n: NodeId) -> usize {
    if let Some(size) = pool.get(n).pagesize {
        return size as usize;
    }

    let mut size = OVERHEAD;
    if pool.get(n).root {
        size += ROOT_EXTRA;
    }

    match &pool.get(n).data {
        NodeData::Leaf { pairs, .. } => {
            for pair in pairs {
                size += pair.key.serial_size();
                size += pair
                    .value
                    .as_ref()
                    .expect("sealed leaf pair without value")
                    .serial_size();
            }
        }
        NodeData::Parent { keys, children } => {
            let mut kidsize = PERCHILD; // last child
            for (i, key) in keys.iter().enumerate() {
                if !pool.get(children[i]).merging {
                    kidsize += PERCHILD;
                    kidsize += key.serial_size();
                }
            }
            size += kidsize;
        }
        _ => panic!("serialize_size on a non-present node"),
    }

    pool.get_mut(n).pagesize = Some(size as u32);
    size
}

/// Size by which a page grows when the node `n` is merged into it
/// (excluding any separator key).
pub fn merge_size(pool: &mut Pool<Node>, n: NodeId) -> usize {
    let headerlen = if pool.get(n).root {
        OVERHEAD + ROOT_EXTRA
    } else {
        OVERHEAD
    };
    serialize_size(pool, n) - headerlen
}

/// Serialise the dirty node `n` into a fresh `buflen`-byte page buffer,
/// re-pointing its keys and values into the new buffer. `nnodes` is
/// written into the extra root data if the node is a root.
///
/// ## Error Conditions
/// - `UnsplittableNode`: The node does not fit in `buflen` bytes
/// - `InvalidPage`: More than 65535 keys (unencodable header)
pub fn serialize(pool: &mut Pool<Node>, n: NodeId, buflen: usize, nnodes: u64) -> StoreResult<()> {
    debug_assert_eq!(pool.get(n).state, NodeState::Dirty);
    debug_assert!(pool.get(n).pagebuf.is_none());

    let pagelen = serialize_size(pool, n);
    if pagelen > buflen {
        return Err(StoreError::UnsplittableNode {
            pagesize: pagelen,
            pagelen: buflen,
        });
    }
    if pool.get(n).nkeys() > u16::MAX as usize {
        return Err(StoreError::InvalidPage {
            pagenum: pool.get(n).pagenum,
            reason: format!("{} keys cannot be encoded", pool.get(n).nkeys()),
        });
    }

    let mut buf = vec![0u8; buflen];
    let mut p = 0;

    buf[p..p + 6].copy_from_slice(MAGIC);
    p += 6;
    buf[p..p + 2].copy_from_slice(&(pool.get(n).nkeys() as u16).to_be_bytes());
    p += 2;
    let node = pool.get(n);
    buf[p] = if node.root {
        0x80 + node.height as u8
    } else {
        node.height as u8
    };
    p += 1;
    buf[p] = node.mlen_t;
    p += 1;
    if node.root {
        buf[p..p + 8].copy_from_slice(&nnodes.to_be_bytes());
        p += 8;
    }

    // Write the body, remembering where each string landed so the node
    // can be re-pointed into the retained buffer afterwards.
    let mut offsets: Vec<usize> = Vec::new();
    match &pool.get(n).data {
        NodeData::Leaf { pairs, .. } => {
            for pair in pairs {
                offsets.push(p);
                p += pair.key.serialize_into(&mut buf, p);
            }
            for pair in pairs {
                offsets.push(p);
                let value = pair.value.as_ref().expect("sealed leaf pair without value");
                p += value.serialize_into(&mut buf, p);
            }
        }
        NodeData::Parent { keys, children } => {
            for key in keys {
                offsets.push(p);
                p += key.serialize_into(&mut buf, p);
            }
            for &child in children {
                let c = pool.get(child);
                debug_assert!(!c.merging, "serialising a parent with unmerged children");
                buf[p..p + 8].copy_from_slice(&c.pagenum.to_be_bytes());
                buf[p + 8..p + 16].copy_from_slice(&c.oldestleaf.to_be_bytes());
                let csize = c.pagesize.expect("child without cached page size");
                buf[p + 16..p + 20].copy_from_slice(&csize.to_be_bytes());
                p += PERCHILD;
            }
        }
        _ => panic!("serialising a non-present node"),
    }
    debug_assert_eq!(p, pagelen);

    // Retain the page and re-point strings into it.
    let page: Rc<[u8]> = Rc::from(buf);
    let node = pool.get_mut(n);
    match &mut node.data {
        NodeData::Leaf { pairs, .. } => {
            let nkeys = pairs.len();
            for (i, pair) in pairs.iter_mut().enumerate() {
                pair.key = Bstr::slice(&page, offsets[i] + 1, pair.key.len() as u8);
                let vlen = pair.value.as_ref().expect("sealed leaf pair without value").len();
                pair.value = Some(Bstr::slice(&page, offsets[nkeys + i] + 1, vlen as u8));
            }
        }
        NodeData::Parent { keys, .. } => {
            for (i, key) in keys.iter_mut().enumerate() {
                *key = Bstr::slice(&page, offsets[i] + 1, key.len() as u8);
            }
        }
        _ => unreachable!(),
    }
    node.pagebuf = Some(page);

    Ok(())
}

/* Parse one length-prefixed string; advance the cursor. */
fn parse_str(page: &Rc<[u8]>, p: &mut usize, end: usize) -> StoreResult<Bstr> {
    if *p >= end {
        return Err(invalid("string runs past end of page"));
    }
    let len = page[*p] as usize;
    if *p + 1 + len > end {
        return Err(invalid("string runs past end of page"));
    }
    let s = Bstr::slice(page, *p + 1, len as u8);
    *p += 1 + len;
    Ok(s)
}

fn invalid(reason: &str) -> StoreError {
    StoreError::InvalidPage {
        pagenum: PAGENUM_NONE,
        reason: reason.to_string(),
    }
}

/// Deserialise a fetched page into the node `n`, which must be in the
/// reading state. Creates not-present placeholders for the children of a
/// parent node. Extra data held in a root page is not processed here;
/// see [`deserialize_root`].
///
/// ## Error Conditions
/// - `InvalidPage`: Bad magic, body overrun, oversize root height, or
///   non-zero tail padding
pub fn deserialize(pool: &mut Pool<Node>, n: NodeId, buf: &[u8]) -> StoreResult<()> {
    debug_assert!(pool.get(n).is_reading());
    debug_assert_eq!(pool.get(n).state, NodeState::Clean);

    let page: Rc<[u8]> = Rc::from(buf);
    let end = page.len();
    let mut p = 0;

    if end < OVERHEAD {
        return Err(invalid("page shorter than header"));
    }
    if &page[0..6] != MAGIC {
        return Err(invalid("bad magic"));
    }
    p += 6;

    let nkeys = u16::from_be_bytes([page[p], page[p + 1]]) as usize;
    p += 2;

    let root = page[p] & 0x80 != 0;
    let height = (page[p] & 0x7f) as i8;
    if root && height > MAX_HEIGHT {
        return Err(invalid("root height out of range"));
    }
    p += 1;

    let mlen_t = page[p];
    p += 1;

    if root {
        if end < OVERHEAD + ROOT_EXTRA {
            return Err(invalid("root page shorter than header"));
        }
        p += ROOT_EXTRA;
    }

    // Parse the body without touching the arena, so that a bad page can
    // be rejected without anything to unwind.
    let data;
    let mlen_n;
    if height == 0 {
        // Leaf: keys then values.
        let mut keys = Vec::with_capacity(nkeys);
        for _ in 0..nkeys {
            keys.push(parse_str(&page, &mut p, end)?);
        }
        let mut pairs = Vec::with_capacity(nkeys);
        for key in keys {
            let value = parse_str(&page, &mut p, end)?;
            pairs.push(KvPair::new(key, value));
        }
        if page[p..end].iter().any(|&b| b != 0) {
            return Err(invalid("non-zero tail padding"));
        }
        mlen_n = if nkeys > 0 {
            pairs[0].key.mlen(&pairs[nkeys - 1].key) as u8
        } else {
            255
        };
        data = NodeData::Leaf {
            pairs,
            overflow: None,
        };
    } else {
        // Parent: separator keys then child descriptors.
        let mut keys = Vec::with_capacity(nkeys);
        for _ in 0..nkeys {
            keys.push(parse_str(&page, &mut p, end)?);
        }
        let mut descriptors = Vec::with_capacity(nkeys + 1);
        for _ in 0..nkeys + 1 {
            if p + PERCHILD > end {
                return Err(invalid("child descriptor runs past end of page"));
            }
            let pagenum = u64::from_be_bytes(page[p..p + 8].try_into().unwrap());
            let oldestleaf = u64::from_be_bytes(page[p + 8..p + 16].try_into().unwrap());
            let pagesize = u32::from_be_bytes(page[p + 16..p + 20].try_into().unwrap());
            p += PERCHILD;
            descriptors.push((pagenum, oldestleaf, pagesize));
        }
        if page[p..end].iter().any(|&b| b != 0) {
            return Err(invalid("non-zero tail padding"));
        }
        let mut children = Vec::with_capacity(nkeys + 1);
        for (pagenum, oldestleaf, pagesize) in descriptors {
            let child = pool.insert(Node::not_present(pagenum, oldestleaf, pagesize));
            pool.get_mut(child).p_shadow = Some(n);
            pool.get_mut(child).p_dirty = Some(n);
            children.push(child);
        }
        mlen_n = 0;
        data = NodeData::Parent { keys, children };
    }

    let node = pool.get_mut(n);
    node.data = data;
    node.root = root;
    node.height = height;
    node.mlen_t = mlen_t;
    node.mlen_n = mlen_n;
    node.pagebuf = Some(page);

    Ok(())
}

/// Parse the extra data carried by a root page: the size of the tree.
pub fn deserialize_root(buf: &[u8]) -> u64 {
    u64::from_be_bytes(buf[OVERHEAD..OVERHEAD + ROOT_EXTRA].try_into().unwrap())
}
