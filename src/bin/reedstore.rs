// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! ReedStore daemon: serve the key-value protocol over a socket,
//! backed by a log-structured block store daemon.

use std::rc::Rc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::net::{TcpListener, UnixListener};

use reedstore::btree::{Btree, TreeConfig};
use reedstore::lbs::{BlockStore, LbsClient};
use reedstore::server::{serve_connection, ServerConfig};

#[derive(Parser)]
#[command(name = "reedstore", about = "Durable ordered key-value store")]
struct Args {
    /// Block store socket (path, or host:port)
    #[arg(short = 'l', long = "lbs")]
    lbs: String,

    /// Listening socket (path, or host:port)
    #[arg(short = 's', long = "socket")]
    socket: String,

    /// Cache size in pages
    #[arg(short = 'C', long)]
    cache_pages: Option<u64>,

    /// Cache size in bytes
    #[arg(short = 'c', long)]
    cache_bytes: Option<u64>,

    /// Maximum key length in bytes (at most 255)
    #[arg(short = 'k', long)]
    keymax: Option<u64>,

    /// Maximum value length in bytes (at most 255)
    #[arg(short = 'v', long)]
    valmax: Option<u64>,

    /// Cost of storage per GB-month, in units of 10^6 I/Os
    #[arg(short = 'S', long, default_value_t = 1.0)]
    storage_cost: f64,

    /// Group commit delay in seconds, [0, 1]
    #[arg(short = 'w', long, default_value_t = 0.0)]
    commit_delay: f64,

    /// Queue depth which forces a commit, [1, 1024]
    #[arg(short = 'g', long)]
    min_batch: Option<usize>,

    /// Serve a single connection, then exit
    #[arg(short = '1', long = "once")]
    once: bool,
}

enum Listener {
    Unix(UnixListener),
    Tcp(TcpListener),
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.cache_pages.is_some() && args.cache_bytes.is_some() {
        bail!("-C and -c are mutually exclusive");
    }
    if let Some(k) = args.keymax {
        if k > 255 {
            bail!("keys longer than 255 bytes are not supported");
        }
    }
    if let Some(v) = args.valmax {
        if v > 255 {
            bail!("values longer than 255 bytes are not supported");
        }
    }
    if !(0.0..=1.0).contains(&args.commit_delay) {
        bail!("commit delay must be in [0.0, 1.0]");
    }
    if let Some(g) = args.min_batch {
        if !(1..=1024).contains(&g) {
            bail!("forced commit size must be in [1, 1024]");
        }
    }

    // Single-threaded by design: the engine is cooperative and shares
    // unsynchronised state between its tasks.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")?;
    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, run(args))
}

async fn run(args: Args) -> Result<()> {
    let lbs = LbsClient::connect(&args.lbs)
        .await
        .with_context(|| format!("cannot connect to block store at {}", args.lbs))?;

    let tree = Btree::open(
        BlockStore::Socket(lbs),
        TreeConfig {
            cache_pages: args.cache_pages,
            cache_bytes: args.cache_bytes,
            keymax: args.keymax,
            valmax: args.valmax,
            storage_cost: args.storage_cost,
        },
    )
    .await
    .context("cannot initialise tree")?;

    let listener = if args.socket.contains('/') {
        let _ = std::fs::remove_file(&args.socket);
        Listener::Unix(
            UnixListener::bind(&args.socket)
                .with_context(|| format!("cannot listen on {}", args.socket))?,
        )
    } else {
        Listener::Tcp(
            TcpListener::bind(&args.socket)
                .await
                .with_context(|| format!("cannot listen on {}", args.socket))?,
        )
    };
    println!("reedstore: serving on {}", args.socket);

    let config = ServerConfig {
        commit_delay: args.commit_delay,
        // Unset means commits are purely window-driven.
        min_batch: args.min_batch.unwrap_or(usize::MAX),
    };

    // Connections are served one at a time.
    loop {
        let result = match &listener {
            Listener::Unix(l) => {
                let (stream, _) = l.accept().await.context("accept failed")?;
                let (r, w) = stream.into_split();
                serve_connection(Rc::clone(&tree), r, w, config.clone()).await
            }
            Listener::Tcp(l) => {
                let (stream, _) = l.accept().await.context("accept failed")?;
                let (r, w) = stream.into_split();
                serve_connection(Rc::clone(&tree), r, w, config.clone()).await
            }
        };
        if let Err(e) = result {
            bail!("fatal engine error: {}", e);
        }
        if args.once {
            break;
        }
    }

    tree.close().await;
    Ok(())
}
