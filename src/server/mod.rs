// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Per-connection request dispatcher.
//!
//! Incoming requests are classified into two queues. Non-modifying
//! requests (GET, RANGE) run concurrently against the shadow root,
//! throttled by the number of pages their descents may touch.
//! Modifying requests accumulate and run as one group-committed batch
//! against the dirty root; a batch launches when the commit window
//! expires, when enough requests are queued, or when the cleaner has
//! parked leaves waiting for a batch to ride along with (a five-second
//! flush guarantees cleaner progress under pure read load — that batch
//! may be empty).
//!
//! Batches are strictly serial: all of batch N's responses are emitted
//! before batch N+1 starts executing. PARAMS is answered inline.
//!
//! A malformed packet costs the connection: queued requests are
//! dropped, the read side stops, and anything already executing runs to
//! completion with its response discarded. The connection is finished
//! once every accepted request has been answered or dropped.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

use crate::btree::{cleaning, Btree};
use crate::codec::PERCHILD;
use crate::error::{StoreError, StoreResult};
use crate::server::mr::MrRequest;
use crate::server::proto::Request;
use crate::wire::{read_packet, write_packet, Packet};

pub mod mr;
pub mod nmr;
pub mod proto;


/// Maximum number of requests in flight per connection.
pub const MAXREQS: usize = 4096;

/// Cleaning-flush period: how long to wait for organic modifying
/// traffic before forcing a batch for the cleaner's sake.
const CLEAN_FLUSH: Duration = Duration::from_secs(5);

/// Dispatcher tuning.
#[derive(Clone)]
pub struct ServerConfig {
    /// Group-commit window in seconds, [0, 1].
    pub commit_delay: f64,
    /// Queue depth which forces a batch without waiting for the window;
    /// `usize::MAX` leaves commits purely window-driven.
    pub min_batch: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            commit_delay: 0.0,
            min_batch: usize::MAX,
        }
    }
}

struct DispatchState {
    /// The connection is going away; stop reading, drop the queues.
    dying: bool,
    /// Responses still owed (or to be discarded).
    nrequests: usize,

    /// Non-modifying queue and its page budget.
    nmr_queue: VecDeque<(u64, Request)>,
    nmr_inflight_pages: usize,

    /// Modifying queue.
    mr_queue: VecDeque<(u64, Request)>,
    mr_inprogress: bool,
    mr_deadline: Option<Instant>,
    mr_timer_expired: bool,

    /// Cleaning-flush timer and its verdict.
    flush_deadline: Instant,
    docleans: bool,

    /// First fatal engine error; ends the connection loop.
    fatal: Option<StoreError>,
}

struct Conn {
    bt: Rc<Btree>,
    config: ServerConfig,
    state: RefCell<DispatchState>,
    resp_tx: mpsc::UnboundedSender<Packet>,
    /// Woken whenever a request completes, to re-poke the queues.
    notify: Notify,
}

/// Serve one connection until it closes or fails.
///
/// Returns `Ok` when the connection wound down normally (including
/// protocol-error teardown) and `Err` only for engine-fatal conditions,
/// which the caller must treat as unrecoverable.
pub async fn serve_connection<R, W>(
    bt: Rc<Btree>,
    read_half: R,
    write_half: W,
    config: ServerConfig,
) -> StoreResult<()>
where
    R: AsyncRead + Unpin + 'static,
    W: AsyncWrite + Unpin + 'static,
{
    let (resp_tx, mut resp_rx) = mpsc::unbounded_channel::<Packet>();

    // Writer task: responses funnel through one channel so concurrent
    // requests never interleave partial packets. Write errors stop the
    // writing; the packets are discarded, as promised on teardown.
    let writer = tokio::task::spawn_local(async move {
        let mut w = write_half;
        let mut broken = false;
        while let Some(packet) = resp_rx.recv().await {
            if !broken && write_packet(&mut w, &packet).await.is_err() {
                broken = true;
            }
        }
    });

    // Reader task: one packet in flight; the dispatcher takes packets
    // only while it is willing to accept requests.
    let (pkt_tx, mut pkt_rx) = mpsc::channel::<StoreResult<Packet>>(1);
    let reader = tokio::task::spawn_local(async move {
        let mut r = read_half;
        loop {
            let result = read_packet(&mut r).await;
            let failed = result.is_err();
            if pkt_tx.send(result).await.is_err() || failed {
                break;
            }
        }
    });

    let conn = Rc::new(Conn {
        bt,
        config,
        state: RefCell::new(DispatchState {
            dying: false,
            nrequests: 0,
            nmr_queue: VecDeque::new(),
            nmr_inflight_pages: 0,
            mr_queue: VecDeque::new(),
            mr_inprogress: false,
            mr_deadline: None,
            mr_timer_expired: false,
            flush_deadline: Instant::now() + CLEAN_FLUSH,
            docleans: false,
            fatal: None,
        }),
        resp_tx,
        notify: Notify::new(),
    });

    loop {
        // Finished once nothing more will arrive and nothing is owed.
        let (done, can_read, mr_deadline, flush_deadline) = {
            let s = conn.state.borrow();
            (
                s.dying && s.nrequests == 0,
                !s.dying && s.nrequests < MAXREQS,
                s.mr_deadline,
                s.flush_deadline,
            )
        };
        if done {
            break;
        }

        tokio::select! {
            msg = pkt_rx.recv(), if can_read => {
                match msg {
                    Some(Ok(packet)) => got_packet(&conn, packet),
                    // Read failure or EOF: tear the connection down.
                    Some(Err(_)) | None => drop_connection(&conn),
                }
            }
            _ = tokio::time::sleep_until(mr_deadline.unwrap_or_else(Instant::now)),
                if mr_deadline.is_some() =>
            {
                let mut s = conn.state.borrow_mut();
                s.mr_deadline = None;
                s.mr_timer_expired = true;
            }
            _ = tokio::time::sleep_until(flush_deadline) => {
                let mut s = conn.state.borrow_mut();
                if cleaning::possible(&conn.bt.state_ref()) {
                    // Force a (possibly empty) batch so the cleaner's
                    // parked leaves get absorbed.
                    s.docleans = true;
                }
                s.flush_deadline = Instant::now() + CLEAN_FLUSH;
            }
            _ = conn.notify.notified() => {}
        }

        poke_nmr(&conn);
        poke_mr(&conn);

        if let Some(e) = conn.state.borrow_mut().fatal.take() {
            reader.abort();
            writer.abort();
            return Err(e);
        }
    }

    reader.abort();
    drop(conn);
    // Closing the response channel lets the writer drain and exit.
    let _ = writer.await;
    Ok(())
}

/* Classify and enqueue one packet. */
fn got_packet(conn: &Rc<Conn>, packet: Packet) {
    let req = match proto::decode_request(&packet.payload) {
        Ok(req) => req,
        Err(e) => {
            eprintln!("reedstore: dropping connection: {}", e);
            drop_connection(conn);
            return;
        }
    };

    let mut s = conn.state.borrow_mut();
    s.nrequests += 1;

    match &req {
        Request::Params => {
            // Answered inline, no queueing.
            let payload = proto::encode_params_response(conn.bt.keymax, conn.bt.valmax);
            let _ = conn.resp_tx.send(Packet::new(packet.id, payload));
            s.nrequests -= 1;
        }
        Request::Set { key, value }
        | Request::Cas { key, value, .. }
        | Request::Add { key, value }
        | Request::Modify { key, value } => {
            if key.len() > conn.bt.keymax || value.len() > conn.bt.valmax {
                s.nrequests -= 1;
                drop(s);
                eprintln!("reedstore: dropping connection: oversize key or value");
                drop_connection(conn);
                return;
            }
            s.mr_queue.push_back((packet.id, req));
        }
        Request::Delete { .. } | Request::Cad { .. } => {
            s.mr_queue.push_back((packet.id, req));
        }
        Request::Get { .. } | Request::Range { .. } => {
            s.nmr_queue.push_back((packet.id, req));
        }
    }
}

/* Tear the connection down: stop reading, drop everything queued. */
fn drop_connection(conn: &Rc<Conn>) {
    let mut s = conn.state.borrow_mut();
    s.dying = true;
    s.nrequests -= s.nmr_queue.len();
    s.nmr_queue.clear();
    s.nrequests -= s.mr_queue.len();
    s.mr_queue.clear();
    s.mr_deadline = None;
    s.mr_timer_expired = false;
}

/* Launch queued non-modifying requests while the page budget allows. */
fn poke_nmr(conn: &Rc<Conn>) {
    loop {
        let (id, req, npages) = {
            let mut s = conn.state.borrow_mut();
            let Some((_, front)) = s.nmr_queue.front() else {
                return;
            };

            // Page budget: a GET walks one root-to-leaf path; a RANGE
            // additionally scans up to a window of leaves.
            let t = conn.bt.state_ref();
            let height = t.pool.get(t.root_shadow.expect("serving a rootless tree")).height;
            let npages = match front {
                Request::Get { .. } => height as usize + 1,
                _ => height as usize + t.pagelen / PERCHILD,
            };
            let budget = t.poolsz / 4;
            drop(t);

            if s.nmr_inflight_pages > 0 && s.nmr_inflight_pages + npages > budget {
                return;
            }
            let (id, req) = s.nmr_queue.pop_front().unwrap();
            s.nmr_inflight_pages += npages;
            (id, req, npages)
        };

        let conn = Rc::clone(conn);
        tokio::task::spawn_local(async move {
            match nmr::run(&conn.bt, &req).await {
                Ok(payload) => {
                    let _ = conn.resp_tx.send(Packet::new(id, payload));
                }
                Err(e) => {
                    conn.state.borrow_mut().fatal = Some(e);
                }
            }
            let mut s = conn.state.borrow_mut();
            s.nmr_inflight_pages -= npages;
            s.nrequests -= 1;
            drop(s);
            conn.notify.notify_one();
        });
    }
}

/* Launch a modifying batch when a trigger has fired, and keep the
 * group-commit timer honest. */
fn poke_mr(conn: &Rc<Conn>) {
    let batch = {
        let mut s = conn.state.borrow_mut();
        let triggered = !s.mr_inprogress
            && (s.mr_timer_expired || s.docleans || s.mr_queue.len() >= conn.config.min_batch);

        let batch = if triggered {
            // Cap the batch so its leaf descents fit the page budget.
            let t = conn.bt.state_ref();
            let pages_per_op =
                t.pool.get(t.root_dirty.expect("serving a rootless tree")).height as usize + 1;
            let budget = t.poolsz / 4;
            drop(t);
            let max_reqs = (budget / pages_per_op).max(1);
            let n = s.mr_queue.len().min(max_reqs);

            let batch: Vec<MrRequest> = s
                .mr_queue
                .drain(..n)
                .map(|(id, req)| MrRequest { id, req })
                .collect();

            s.mr_inprogress = true;
            s.mr_deadline = None;
            s.mr_timer_expired = false;
            // The batch will absorb whatever the cleaner has parked.
            s.docleans = false;
            s.flush_deadline = Instant::now() + CLEAN_FLUSH;
            Some(batch)
        } else {
            None
        };

        // Anything (still) queued with no window running: start the
        // clock. Even a zero window is useful — already-arrived packets
        // are classified before the expiry is serviced, so simultaneous
        // arrivals share a batch.
        if s.mr_deadline.is_none() && !s.mr_timer_expired && !s.mr_queue.is_empty() {
            s.mr_deadline =
                Some(Instant::now() + Duration::from_secs_f64(conn.config.commit_delay));
        }

        batch
    };

    let Some(batch) = batch else { return };
    let nreqs = batch.len();
    let conn = Rc::clone(conn);
    tokio::task::spawn_local(async move {
        match mr::run_batch(&conn.bt, batch).await {
            Ok(responses) => {
                for packet in responses {
                    let _ = conn.resp_tx.send(packet);
                }
            }
            Err(e) => {
                conn.state.borrow_mut().fatal = Some(e);
            }
        }
        let mut s = conn.state.borrow_mut();
        s.nrequests -= nreqs;
        s.mr_inprogress = false;
        drop(s);
        conn.notify.notify_one();
    });
}
