// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Payload encoding for the block-store protocol.
//!
//! Request payloads start with a 4-byte big-endian type code; response
//! payloads carry only the fields below. Framing (IDs, lengths, CRC) is
//! provided by the wire layer.

use crate::error::{StoreError, StoreResult};

/// Request type codes.
pub const OP_GET: u32 = 0x00000001;
pub const OP_APPEND: u32 = 0x00000002;
pub const OP_FREE: u32 = 0x00000003;
pub const OP_PARAMS2: u32 = 0x00000004;

fn short(what: &str) -> StoreError {
    StoreError::ProtocolError {
        reason: format!("truncated {} payload", what),
    }
}

/// PARAMS2 request: just the type code.
pub fn encode_params2() -> Vec<u8> {
    OP_PARAMS2.to_be_bytes().to_vec()
}

/// PARAMS2 response: 4B blklen, 8B nextblk, 8B lastblk.
pub fn decode_params2_response(buf: &[u8]) -> StoreResult<(usize, u64, u64)> {
    if buf.len() != 20 {
        return Err(short("PARAMS2 response"));
    }
    let blklen = u32::from_be_bytes(buf[0..4].try_into().unwrap()) as usize;
    let nextblk = u64::from_be_bytes(buf[4..12].try_into().unwrap());
    let lastblk = u64::from_be_bytes(buf[12..20].try_into().unwrap());
    Ok((blklen, nextblk, lastblk))
}

/// GET request: 8B block number, 4B block length.
pub fn encode_get(blkno: u64, len: usize) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16);
    buf.extend_from_slice(&OP_GET.to_be_bytes());
    buf.extend_from_slice(&blkno.to_be_bytes());
    buf.extend_from_slice(&(len as u32).to_be_bytes());
    buf
}

/// GET response: 4B status (0 = present), then the block if present.
pub fn decode_get_response(buf: &[u8], len: usize) -> StoreResult<Option<Vec<u8>>> {
    if buf.len() < 4 {
        return Err(short("GET response"));
    }
    let status = u32::from_be_bytes(buf[0..4].try_into().unwrap());
    if status != 0 {
        return Ok(None);
    }
    if buf.len() != 4 + len {
        return Err(short("GET response"));
    }
    Ok(Some(buf[4..].to_vec()))
}

/// APPEND request: 4B nblks, 8B expected block number, 4B block length,
/// then the concatenated blocks.
pub fn encode_append(blkno: u64, blklen: usize, pages: &[std::rc::Rc<[u8]>]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(20 + pages.len() * blklen);
    buf.extend_from_slice(&OP_APPEND.to_be_bytes());
    buf.extend_from_slice(&(pages.len() as u32).to_be_bytes());
    buf.extend_from_slice(&blkno.to_be_bytes());
    buf.extend_from_slice(&(blklen as u32).to_be_bytes());
    for page in pages {
        buf.extend_from_slice(page);
    }
    buf
}

/// APPEND response: 4B status (0 = ok), 8B next writable block number.
pub fn decode_append_response(buf: &[u8]) -> StoreResult<(u32, u64)> {
    if buf.len() < 4 {
        return Err(short("APPEND response"));
    }
    let status = u32::from_be_bytes(buf[0..4].try_into().unwrap());
    if status != 0 {
        return Ok((status, 0));
    }
    if buf.len() != 12 {
        return Err(short("APPEND response"));
    }
    let next = u64::from_be_bytes(buf[4..12].try_into().unwrap());
    Ok((0, next))
}

/// FREE request: 8B block number.
pub fn encode_free(blkno: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(12);
    buf.extend_from_slice(&OP_FREE.to_be_bytes());
    buf.extend_from_slice(&blkno.to_be_bytes());
    buf
}
