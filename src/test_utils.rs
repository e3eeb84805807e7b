// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Shared helpers for the unit tests: a single-threaded runtime and a
//! thin operation layer over an in-memory tree.

use std::rc::Rc;

use crate::btree::{Btree, TreeConfig};
use crate::keys::Bstr;
use crate::lbs::{BlockStore, MemStore};
use crate::server::mr::{self, MrRequest};
use crate::server::nmr;
use crate::server::proto::{self, Request};

/// Run a future on a fresh current-thread runtime with a local task
/// set, the way the daemon runs.
pub(crate) fn run<F>(future: F) -> F::Output
where
    F: std::future::Future,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, future)
}

/// Open a tree over a fresh in-memory store.
pub(crate) async fn open_mem(blklen: usize, storage_cost: f64) -> (Rc<MemStore>, Rc<Btree>) {
    let store = MemStore::new(blklen);
    let bt = Btree::open(
        BlockStore::Memory(Rc::clone(&store)),
        TreeConfig {
            storage_cost,
            ..TreeConfig::default()
        },
    )
    .await
    .unwrap();
    (store, bt)
}

/// Re-open a tree over an existing store, as after a crash.
pub(crate) async fn reopen(store: &Rc<MemStore>, storage_cost: f64) -> Rc<Btree> {
    Btree::open(
        BlockStore::Memory(Rc::clone(store)),
        TreeConfig {
            storage_cost,
            ..TreeConfig::default()
        },
    )
    .await
    .unwrap()
}

/// Run one modifying batch; returns the per-request status codes.
pub(crate) async fn batch(bt: &Rc<Btree>, reqs: Vec<Request>) -> Vec<u32> {
    let reqs = reqs
        .into_iter()
        .enumerate()
        .map(|(i, req)| MrRequest { id: i as u64, req })
        .collect();
    let responses = mr::run_batch(bt, reqs).await.unwrap();
    responses
        .iter()
        .map(|p| proto::decode_status_response(&p.payload).unwrap())
        .collect()
}

pub(crate) async fn set(bt: &Rc<Btree>, key: &str, value: &str) {
    let statuses = batch(
        bt,
        vec![Request::Set {
            key: Bstr::from(key),
            value: Bstr::from(value),
        }],
    )
    .await;
    assert_eq!(statuses, vec![0]);
}

pub(crate) async fn get(bt: &Rc<Btree>, key: &str) -> Option<Vec<u8>> {
    let payload = nmr::run(
        bt,
        &Request::Get {
            key: Bstr::from(key),
        },
    )
    .await
    .unwrap();
    proto::decode_get_response(&payload)
        .unwrap()
        .map(|v| v.as_bytes().to_vec())
}
