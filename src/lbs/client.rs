// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Socket client for an LBS daemon.
//!
//! A single connection multiplexes any number of outstanding requests:
//! each request is assigned a fresh 64-bit ID, responses are matched
//! back to their callers by ID, and ordering between different requests
//! is unconstrained. Writes funnel through a writer task so concurrent
//! callers never interleave partial packets; a reader task routes
//! response payloads to per-request channels.
//!
//! If the connection drops, every pending and future request fails; the
//! engine treats that as fatal (the block store is the durability
//! layer, so there is nothing useful to retry against).

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use tokio::io::{AsyncRead, AsyncWrite, BufWriter};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{StoreError, StoreResult};
use crate::lbs::proto;
use crate::lbs::StoreParams;
use crate::wire::{read_packet, write_packet, Packet};

struct Mux {
    next_id: u64,
    pending: HashMap<u64, oneshot::Sender<Vec<u8>>>,
    /// Set once the connection has failed; all requests fail fast.
    dead: bool,
}

/// Multiplexed request queue over one LBS connection.
pub struct LbsClient {
    mux: Rc<RefCell<Mux>>,
    tx: mpsc::UnboundedSender<Packet>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl LbsClient {
    /// Connect to the block store at `addr`: a Unix socket path if it
    /// contains a '/', otherwise a TCP `host:port` address.
    pub async fn connect(addr: &str) -> StoreResult<Rc<Self>> {
        if addr.contains('/') {
            let sock = UnixStream::connect(addr).await.map_err(|e| StoreError::IoError {
                operation: format!("connect {}", addr),
                reason: e.to_string(),
            })?;
            let (r, w) = sock.into_split();
            Ok(Self::start(r, w))
        } else {
            let sock = TcpStream::connect(addr).await.map_err(|e| StoreError::IoError {
                operation: format!("connect {}", addr),
                reason: e.to_string(),
            })?;
            let (r, w) = sock.into_split();
            Ok(Self::start(r, w))
        }
    }

    /// Start the reader and writer tasks over a connected stream pair.
    pub fn start<R, W>(read_half: R, write_half: W) -> Rc<Self>
    where
        R: AsyncRead + Unpin + 'static,
        W: AsyncWrite + Unpin + 'static,
    {
        let mux = Rc::new(RefCell::new(Mux {
            next_id: 0,
            pending: HashMap::new(),
            dead: false,
        }));
        let (tx, mut rx) = mpsc::unbounded_channel::<Packet>();

        let writer = tokio::task::spawn_local(async move {
            let mut w = BufWriter::new(write_half);
            while let Some(packet) = rx.recv().await {
                if write_packet(&mut w, &packet).await.is_err() {
                    break;
                }
            }
        });

        let mux_reader = Rc::clone(&mux);
        let reader = tokio::task::spawn_local(async move {
            let mut r = read_half;
            loop {
                match read_packet(&mut r).await {
                    Ok(packet) => {
                        let sender = mux_reader.borrow_mut().pending.remove(&packet.id);
                        if let Some(sender) = sender {
                            let _ = sender.send(packet.payload);
                        }
                        // A response with no waiter is simply dropped.
                    }
                    Err(_) => {
                        // Connection lost: fail everything outstanding.
                        let mut mux = mux_reader.borrow_mut();
                        mux.dead = true;
                        mux.pending.clear();
                        break;
                    }
                }
            }
        });

        Rc::new(Self {
            mux,
            tx,
            reader,
            writer,
        })
    }

    /// Issue one request and await its response payload.
    async fn request(&self, operation: &str, payload: Vec<u8>) -> StoreResult<Vec<u8>> {
        let (sender, receiver) = oneshot::channel();
        let id;
        {
            let mut mux = self.mux.borrow_mut();
            if mux.dead {
                return Err(StoreError::BlockStoreFailed {
                    operation: operation.to_string(),
                    reason: "connection lost".to_string(),
                });
            }
            id = mux.next_id;
            mux.next_id += 1;
            mux.pending.insert(id, sender);
        }

        if self.tx.send(Packet::new(id, payload)).is_err() {
            self.mux.borrow_mut().pending.remove(&id);
            return Err(StoreError::BlockStoreFailed {
                operation: operation.to_string(),
                reason: "connection lost".to_string(),
            });
        }

        receiver.await.map_err(|_| StoreError::BlockStoreFailed {
            operation: operation.to_string(),
            reason: "connection lost".to_string(),
        })
    }

    pub async fn params2(&self) -> StoreResult<StoreParams> {
        let buf = self.request("PARAMS2", proto::encode_params2()).await?;
        let (blklen, nextblk, lastblk) = proto::decode_params2_response(&buf)?;
        Ok(StoreParams {
            blklen,
            nextblk,
            lastblk,
        })
    }

    pub async fn get(&self, blkno: u64, len: usize) -> StoreResult<Option<Vec<u8>>> {
        let buf = self.request("GET", proto::encode_get(blkno, len)).await?;
        proto::decode_get_response(&buf, len)
    }

    pub async fn append(
        &self,
        blkno: u64,
        blklen: usize,
        pages: &[Rc<[u8]>],
    ) -> StoreResult<u64> {
        let buf = self
            .request("APPEND", proto::encode_append(blkno, blklen, pages))
            .await?;
        let (status, next) = proto::decode_append_response(&buf)?;
        if status != 0 {
            return Err(StoreError::AppendConflict { expected: blkno });
        }
        Ok(next)
    }

    pub async fn free(&self, blkno: u64) -> StoreResult<()> {
        self.request("FREE", proto::encode_free(blkno)).await?;
        Ok(())
    }
}

impl Drop for LbsClient {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}
