// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Non-modifying requests: GET and RANGE.
//!
//! Both run against the shadow root, so they always observe the last
//! committed state and never see a batch in progress.
//!
//! RANGE descends to a node of height at most one and scans a window of
//! its leaves: enough leaves to cover `max` response bytes, stopping
//! early at the requested end key or when the serialised size of the
//! collected pairs would pass `max` (a lone oversize pair is still
//! returned so progress is always possible). The returned `next` key
//! tells the client where to resume: the requested end if the scan got
//! that far, otherwise the first key not returned.

use std::rc::Rc;

use crate::btree::node::NodeState;
use crate::btree::{find, nodeops, Btree};
use crate::error::StoreResult;
use crate::keys::Bstr;
use crate::server::proto;

/// Execute one non-modifying request; returns the response payload.
pub async fn run(bt: &Rc<Btree>, req: &proto::Request) -> StoreResult<Vec<u8>> {
    match req {
        proto::Request::Get { key } => run_get(bt, key).await,
        proto::Request::Range { max, start, end } => run_range(bt, *max, start, end).await,
        _ => panic!("not a non-modifying request"),
    }
}

async fn run_get(bt: &Rc<Btree>, key: &Bstr) -> StoreResult<Vec<u8>> {
    let root = bt
        .state_ref()
        .root_shadow
        .expect("serving a rootless tree");
    let leaf = find::find_leaf(bt, root, key).await?;

    let mut t = bt.state();
    let node = t.pool.get(leaf);
    let value = find::find_kvpair(node, key)
        .and_then(|i| node.leaf_pairs()[i].value.clone());
    t.unlock(leaf);

    Ok(proto::encode_get_response(value.as_ref()))
}

async fn run_range(bt: &Rc<Btree>, max: usize, start: &Bstr, req_end: &Bstr) -> StoreResult<Vec<u8>> {
    let root = bt
        .state_ref()
        .root_shadow
        .expect("serving a rootless tree");
    let (n, mut end) = find::find_range(bt, root, start, 1).await?;

    let mut pairs: Vec<(Bstr, Bstr)> = Vec::new();
    let mut rlen = 0usize;
    let mut break_key: Option<Bstr> = None;

    let height = bt.state_ref().pool.get(n).height;
    if height == 0 {
        scan_leaf(bt, n, start, req_end, max, &mut pairs, &mut rlen, &mut break_key);
        if let Some(k) = break_key.take() {
            end = k;
        }
        bt.state().unlock(n);
    } else {
        let (keys, children, start_idx, pagelen) = {
            let t = bt.state_ref();
            let node = t.pool.get(n);
            (
                node.parent_keys().clone(),
                node.parent_children().clone(),
                find::find_child(node, start),
                t.pagelen,
            )
        };

        // Enough leaves to cover `max` bytes, and always at least one.
        let stop = (start_idx + max / pagelen).max(start_idx + 1);

        let mut i = start_idx;
        while i < children.len() && i < stop {
            // The parent stays locked for the duration, pinning the
            // window while leaves page in.
            nodeops::descend(bt, children[i]).await?;
            let leaf = children[i];
            // The leaf may be the shadow side of a page dirtied since
            // the descent began; it still holds the committed pairs.
            debug_assert_ne!(bt.state_ref().pool.get(leaf).state, NodeState::Dirty);
            scan_leaf(bt, leaf, start, req_end, max, &mut pairs, &mut rlen, &mut break_key);
            bt.state().unlock(leaf);
            i += 1;
            if break_key.is_some() {
                break;
            }
            // Past the requested end ("" sorts low, so an unbounded
            // scan also stops here and resumes via `next`): later
            // leaves are irrelevant.
            if i <= keys.len() && *req_end < keys[i - 1] {
                break;
            }
        }

        // Bound what the window actually covered.
        if i < children.len() {
            end = keys[i - 1].clone();
        }
        if let Some(k) = break_key {
            end = k;
        }

        bt.state().unlock(n);
    }

    // The resumption point: the requested end if we got there, else the
    // first key not returned ("" means end of keyspace).
    let next = if end.is_empty() {
        req_end.clone()
    } else if req_end.is_empty() || end < *req_end {
        end
    } else {
        req_end.clone()
    };

    Ok(proto::encode_range_response(&next, &pairs))
}

/* Collect in-range pairs from one leaf; record the first key which no
 * longer fits. */
#[allow(clippy::too_many_arguments)]
fn scan_leaf(
    bt: &Rc<Btree>,
    leaf: crate::pool::NodeId,
    start: &Bstr,
    req_end: &Bstr,
    max: usize,
    pairs: &mut Vec<(Bstr, Bstr)>,
    rlen: &mut usize,
    break_key: &mut Option<Bstr>,
) {
    let t = bt.state_ref();
    let node = t.pool.get(leaf);
    for pair in node.leaf_pairs() {
        if pair.key < *start {
            continue;
        }
        // The end bound is exclusive; "" means end of keyspace.
        if !req_end.is_empty() && pair.key >= *req_end {
            continue;
        }
        let value = pair.value.as_ref().expect("committed leaf pair without value");
        *rlen += pair.key.serial_size() + value.serial_size();
        if !pairs.is_empty() && max < *rlen {
            *break_key = Some(pair.key.clone());
            break;
        }
        pairs.push((pair.key.clone(), value.clone()));
    }
}
