// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Error types for ReedStore operations.
//!
//! Provides structured error handling with detailed context for debugging.

use std::fmt;

/// Standard Result type for all ReedStore operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Error types for ReedStore operations.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// I/O error during socket or block-store operations.
    IoError { operation: String, reason: String },

    /// A page read from the block store is not a valid serialised node.
    InvalidPage { pagenum: u64, reason: String },

    /// A mandatory page does not exist in the block store.
    PageMissing { pagenum: u64 },

    /// The block store reported an APPEND at an unexpected position.
    AppendConflict { expected: u64 },

    /// A request from the block store failed outright.
    BlockStoreFailed { operation: String, reason: String },

    /// No root page could be located during recovery.
    RootNotFound { nextblk: u64 },

    /// Key or value length limits do not fit the page size.
    LimitsTooLarge {
        keylen: u64,
        vallen: u64,
        pagelen: usize,
    },

    /// Cache size out of the supported range.
    InvalidCacheSize { pages: u64 },

    /// Malformed packet or payload on a client connection.
    ProtocolError { reason: String },

    /// Connection closed by the peer.
    ConnectionClosed,

    /// A node grew beyond one page and could not be split.
    UnsplittableNode { pagesize: usize, pagelen: usize },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IoError { operation, reason } => {
                write!(f, "I/O error during '{}': {}", operation, reason)
            }
            Self::InvalidPage { pagenum, reason } => {
                write!(f, "Invalid page {}: {}", pagenum, reason)
            }
            Self::PageMissing { pagenum } => {
                write!(f, "Mandatory page {} does not exist", pagenum)
            }
            Self::AppendConflict { expected } => {
                write!(f, "APPEND at block {} lost a writer race", expected)
            }
            Self::BlockStoreFailed { operation, reason } => {
                write!(f, "Block store '{}' request failed: {}", operation, reason)
            }
            Self::RootNotFound { nextblk } => {
                write!(f, "No root page found below block {}", nextblk)
            }
            Self::LimitsTooLarge {
                keylen,
                vallen,
                pagelen,
            } => {
                write!(
                    f,
                    "Key/value limits {}/{} too large for page size {}",
                    keylen, vallen, pagelen
                )
            }
            Self::InvalidCacheSize { pages } => {
                write!(f, "Cache size in pages must be in [2^10, 2^30]: {}", pages)
            }
            Self::ProtocolError { reason } => {
                write!(f, "Protocol error: {}", reason)
            }
            Self::ConnectionClosed => {
                write!(f, "Connection closed by peer")
            }
            Self::UnsplittableNode { pagesize, pagelen } => {
                write!(
                    f,
                    "Node of {} bytes cannot be split to fit {}-byte pages",
                    pagesize, pagelen
                )
            }
        }
    }
}

impl std::error::Error for StoreError {}

// Convenience conversion from std::io::Error
impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::IoError {
            operation: "unknown".to_string(),
            reason: err.to_string(),
        }
    }
}
