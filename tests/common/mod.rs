// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::rc::Rc;

use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};

use reedstore::btree::{Btree, TreeConfig};
use reedstore::keys::Bstr;
use reedstore::lbs::{BlockStore, MemStore};
use reedstore::server::mr::{self, MrRequest};
use reedstore::server::nmr;
use reedstore::server::proto::{self, Request};
use reedstore::wire::{read_packet, write_packet, Packet};

/// Run a future the way the daemon runs: one thread, local tasks.
pub fn run<F>(future: F) -> F::Output
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
pub async fn open_mem(blklen: usize, storage_cost: f64) -> (Rc<MemStore>, Rc<Btree>) {
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
pub async fn reopen(store: &Rc<MemStore>) -> Rc<Btree> {
    Btree::open(
        BlockStore::Memory(Rc::clone(store)),
        TreeConfig {
            storage_cost: 0.0,
            ..TreeConfig::default()
        },
    )
    .await
    .unwrap()
}

/// Run one modifying batch; returns the per-request status codes.
pub async fn batch(bt: &Rc<Btree>, reqs: Vec<Request>) -> Vec<u32> {
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

pub async fn set(bt: &Rc<Btree>, key: &str, value: &[u8]) -> u32 {
    one(bt, Request::Set {
        key: Bstr::from(key),
        value: Bstr::new(value),
    })
    .await
}

pub async fn add(bt: &Rc<Btree>, key: &str, value: &[u8]) -> u32 {
    one(bt, Request::Add {
        key: Bstr::from(key),
        value: Bstr::new(value),
    })
    .await
}

pub async fn modify(bt: &Rc<Btree>, key: &str, value: &[u8]) -> u32 {
    one(bt, Request::Modify {
        key: Bstr::from(key),
        value: Bstr::new(value),
    })
    .await
}

pub async fn cas(bt: &Rc<Btree>, key: &str, oval: &[u8], value: &[u8]) -> u32 {
    one(bt, Request::Cas {
        key: Bstr::from(key),
        oval: Bstr::new(oval),
        value: Bstr::new(value),
    })
    .await
}

pub async fn cad(bt: &Rc<Btree>, key: &str, oval: &[u8]) -> u32 {
    one(bt, Request::Cad {
        key: Bstr::from(key),
        oval: Bstr::new(oval),
    })
    .await
}

pub async fn del(bt: &Rc<Btree>, key: &str) -> u32 {
    one(bt, Request::Delete {
        key: Bstr::from(key),
    })
    .await
}

async fn one(bt: &Rc<Btree>, req: Request) -> u32 {
    batch(bt, vec![req]).await[0]
}

pub async fn get(bt: &Rc<Btree>, key: &str) -> Option<Vec<u8>> {
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

/// RANGE over the engine; returns (next, pairs).
pub async fn range(
    bt: &Rc<Btree>,
    start: &str,
    end: &str,
    max: usize,
) -> (Vec<u8>, Vec<(Vec<u8>, Vec<u8>)>) {
    let payload = nmr::run(
        bt,
        &Request::Range {
            max,
            start: Bstr::from(start),
            end: Bstr::from(end),
        },
    )
    .await
    .unwrap();
    let (next, pairs) = proto::decode_range_response(&payload).unwrap();
    (
        next.as_bytes().to_vec(),
        pairs
            .into_iter()
            .map(|(k, v)| (k.as_bytes().to_vec(), v.as_bytes().to_vec()))
            .collect(),
    )
}

/// A packet-level client for a served connection.
pub struct Client<S> {
    pub reader: ReadHalf<S>,
    pub writer: WriteHalf<S>,
    next_id: u64,
}

impl<S: AsyncRead + AsyncWrite> Client<S> {
    pub fn new(stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader,
            writer,
            next_id: 0,
        }
    }

    /// Send one request and wait for its response payload.
    pub async fn request(&mut self, req: &Request) -> Vec<u8> {
        let id = self.next_id;
        self.next_id += 1;
        write_packet(&mut self.writer, &Packet::new(id, proto::encode_request(req)))
            .await
            .unwrap();
        let packet = read_packet(&mut self.reader).await.unwrap();
        assert_eq!(packet.id, id);
        packet.payload
    }
}
