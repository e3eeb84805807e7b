// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Modifying-request batches.
//!
//! A batch runs in phases against the dirty tree:
//!
//! 1. Locate the leaf for every request, in parallel.
//! 2. Decide which leaves actually change (requests whose precondition
//!    already fails are no-ops and dirty nothing), copy-on-write
//!    exactly those, and let the cleaner absorb its parked leaves into
//!    the same batch.
//! 3. Make the dirty leaves mutable and apply the requests in arrival
//!    order; SET overwrites or inserts as needed.
//! 4. Seal the mutated leaves, rebalance, refresh the matching-prefix
//!    values, and sync everything out as one append.
//! 5. Emit one response per request: status 0 for work done (SET and
//!    DELETE always), status 1 for a precondition which did not hold.
//!
//! If nothing dirtied anything, balancing and syncing are skipped and
//! the responses go straight out.

use std::collections::HashMap;
use std::rc::Rc;

use futures_util::future::join_all;

use crate::btree::node::NodeState;
use crate::btree::{balance, cleaning, find, mlen, mutate, nodeops, sync, Btree};
use crate::error::StoreResult;
use crate::keys::Bstr;
use crate::pool::NodeId;
use crate::server::proto::{self, Request};
use crate::wire::Packet;

/// One queued modifying request.
pub struct MrRequest {
    pub id: u64,
    pub req: Request,
}

/// Execute a batch of modifying requests in order; returns the response
/// packets in the same order.
pub async fn run_batch(bt: &Rc<Btree>, reqs: Vec<MrRequest>) -> StoreResult<Vec<Packet>> {
    // Phase 1: locate every leaf in parallel.
    let root = bt.state_ref().root_dirty.expect("batch on a rootless tree");
    let found = join_all(
        reqs.iter()
            .map(|r| find::find_leaf(bt, root, r.req.key())),
    )
    .await;
    let mut leaves = Vec::with_capacity(reqs.len());
    for leaf in found {
        leaves.push(leaf?);
    }

    // Let every continuation woken by the descents settle before the
    // tree changes shape.
    tokio::task::yield_now().await;

    // Phase 2: dirty what will change.
    let (dirties, skip_commit) = {
        let mut t = bt.state();
        let mut shadow_dirty: HashMap<NodeId, NodeId> = HashMap::new();
        let mut dirties: Vec<NodeId> = Vec::new();

        for (r, &leaf) in reqs.iter().zip(leaves.iter()) {
            // Already copied for an earlier request in this batch.
            if t.pool.get(leaf).state != NodeState::Clean {
                continue;
            }
            let node = t.pool.get(leaf);
            let kv = find::find_kvpair(node, r.req.key());
            let effective = match &r.req {
                // SET always writes; distinguishing overwrites from
                // identical rewrites is not worth the compare.
                Request::Set { .. } => true,
                Request::Add { .. } => kv.is_none(),
                Request::Modify { .. } | Request::Delete { .. } => kv.is_some(),
                Request::Cas { oval, .. } | Request::Cad { oval, .. } => match kv {
                    None => false,
                    Some(i) => {
                        node.leaf_pairs()[i].value.as_ref() == Some(oval)
                    }
                },
                _ => unreachable!(),
            };
            if !effective {
                continue;
            }
            let nd = nodeops::dirty(&mut t, leaf);
            shadow_dirty.insert(leaf, nd);
            dirties.push(nd);
        }

        // Release the locks the leaf-finding took.
        for &leaf in &leaves {
            t.unlock(leaf);
        }

        // Requests whose leaf was copied now target the copy.
        for leaf in leaves.iter_mut() {
            if let Some(&nd) = shadow_dirty.get(leaf) {
                *leaf = nd;
            }
        }

        // The cleaner's parked leaves ride along with this batch.
        cleaning::clean(&mut t);

        let skip = t.pool.get(t.root_dirty.unwrap()).state == NodeState::Clean;
        (dirties, skip)
    };

    let mut opdone = vec![false; reqs.len()];

    if !skip_commit {
        // Phase 3: apply the requests in order.
        {
            let mut t = bt.state();
            for &d in &dirties {
                mutate::mutable(t.pool.get_mut(d));
            }

            for (i, (r, &leaf)) in reqs.iter().zip(leaves.iter()).enumerate() {
                if t.pool.get(leaf).state != NodeState::Dirty {
                    continue;
                }
                opdone[i] = apply(&mut t, leaf, &r.req);
            }

            // Phase 4a: seal.
            for &d in &dirties {
                mutate::immutable(t.pool.get_mut(d));
            }
        }

        // Phase 4b: rebalance, fix prefixes, commit.
        balance::balance(bt).await?;
        {
            let mut t = bt.state();
            mlen::update(&mut t);
        }
        sync::sync(bt).await?;
    }

    // Phase 5: responses, in request order.
    let mut responses = Vec::with_capacity(reqs.len());
    for (i, r) in reqs.iter().enumerate() {
        let status = match &r.req {
            Request::Set { .. } | Request::Delete { .. } => 0,
            _ => {
                if opdone[i] {
                    0
                } else {
                    1
                }
            }
        };
        responses.push(Packet::new(r.id, proto::encode_status_response(status)));
    }
    Ok(responses)
}

/* Apply one request against its mutable leaf; true if it changed
 * anything. */
fn apply(t: &mut crate::btree::Tree, leaf: NodeId, req: &Request) -> bool {
    enum Op {
        None,
        Add(Bstr, Bstr),
        Modify(Bstr),
        Delete,
    }

    let node = t.pool.get_mut(leaf);
    let slot = mutate::find(node, req.key());
    let val = mutate::value_at(node, slot);

    let op = match req {
        Request::Set { key, value } => Op::Add(key.clone(), value.clone()),
        Request::Cas { value, oval, .. } => {
            if val.as_ref() == Some(oval) {
                Op::Modify(value.clone())
            } else {
                Op::None
            }
        }
        Request::Add { key, value } => {
            if val.is_none() {
                Op::Add(key.clone(), value.clone())
            } else {
                Op::None
            }
        }
        Request::Modify { value, .. } => {
            if val.is_some() {
                Op::Modify(value.clone())
            } else {
                Op::None
            }
        }
        Request::Delete { .. } => {
            if val.is_some() {
                Op::Delete
            } else {
                Op::None
            }
        }
        Request::Cad { oval, .. } => {
            if val.as_ref() == Some(oval) {
                Op::Delete
            } else {
                Op::None
            }
        }
        _ => unreachable!(),
    };

    match op {
        Op::None => false,
        Op::Add(key, value) => {
            // The key may be present with no value (deleted earlier in
            // this batch); resurrect it in place.
            if !mutate::key_at(node, slot) {
                mutate::add(node, slot, key, value);
            } else {
                mutate::set_value(node, slot, Some(value));
            }
            true
        }
        Op::Modify(value) => {
            mutate::set_value(node, slot, Some(value));
            true
        }
        Op::Delete => {
            mutate::set_value(node, slot, None);
            true
        }
    }
}
