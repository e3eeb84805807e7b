// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! ReedStore - durable ordered key-value store over a log-structured
//! block store.
//!
//! A copy-on-write B+Tree engine: reads are served from the last
//! committed tree, modifications are group-committed in batches which
//! append every changed page to the block store in one write, and a
//! cost-driven cleaner compacts the log in the background.
//!
//! ## Architecture
//!
//! - **keys**: byte-string keys and values with prefix-aware compares
//! - **codec**: the on-page node format
//! - **pool**: node arena and lock-aware page cache
//! - **btree**: the engine — node management, search, mutation,
//!   balancing, cleaning, commit
//! - **lbs**: the block-store interface (socket client and in-memory
//!   test double)
//! - **server**: the served wire protocol and request dispatcher
//!
//! Everything runs single-threaded on a cooperative (current-thread
//! tokio) runtime; the only suspension points are block-store I/O,
//! timers and the sockets.

pub mod btree;
pub mod codec;
pub mod error;
pub mod keys;
pub mod lbs;
pub mod pool;
pub mod server;
pub mod wire;

#[cfg(test)]
pub(crate) mod test_utils;

// Re-export commonly used types
pub use btree::{Btree, TreeConfig};
pub use error::{StoreError, StoreResult};
pub use keys::{Bstr, KvPair};
pub use lbs::{BlockStore, MemStore};
pub use server::{serve_connection, ServerConfig};
