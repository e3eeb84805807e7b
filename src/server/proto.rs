// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Request and response payload encoding for the served protocol.
//!
//! Request payloads begin with a 4-byte big-endian type code; keys and
//! values use the usual one-byte-length serialisation. Response layouts
//! depend on the request: most are a 4-byte status (0 = applied, 1 =
//! precondition unmet), GET carries the value after a zero status, and
//! RANGE carries a count, a next-key bound and the pairs.
//!
//! The decode half is strict: trailing bytes, truncated strings and
//! unknown type codes are protocol errors and cost the sender its
//! connection.

use crate::error::{StoreError, StoreResult};
use crate::keys::Bstr;

pub const OP_PARAMS: u32 = 0x00000100;
pub const OP_SET: u32 = 0x00000110;
pub const OP_CAS: u32 = 0x00000111;
pub const OP_ADD: u32 = 0x00000112;
pub const OP_MODIFY: u32 = 0x00000113;
pub const OP_DELETE: u32 = 0x00000120;
pub const OP_CAD: u32 = 0x00000121;
pub const OP_GET: u32 = 0x00000130;
pub const OP_RANGE: u32 = 0x00000131;

/// A decoded client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Params,
    Set { key: Bstr, value: Bstr },
    Cas { key: Bstr, oval: Bstr, value: Bstr },
    Add { key: Bstr, value: Bstr },
    Modify { key: Bstr, value: Bstr },
    Delete { key: Bstr },
    Cad { key: Bstr, oval: Bstr },
    Get { key: Bstr },
    Range { max: usize, start: Bstr, end: Bstr },
}

impl Request {
    /// True for requests executed against the dirty tree.
    pub fn is_modifying(&self) -> bool {
        !matches!(self, Request::Params | Request::Get { .. } | Request::Range { .. })
    }

    /// The key a modifying request targets.
    pub fn key(&self) -> &Bstr {
        match self {
            Request::Set { key, .. }
            | Request::Cas { key, .. }
            | Request::Add { key, .. }
            | Request::Modify { key, .. }
            | Request::Delete { key }
            | Request::Cad { key, .. }
            | Request::Get { key } => key,
            _ => panic!("request has no key"),
        }
    }
}

fn bad(reason: &str) -> StoreError {
    StoreError::ProtocolError {
        reason: reason.to_string(),
    }
}

fn parse_str(buf: &[u8], p: &mut usize) -> StoreResult<Bstr> {
    if *p >= buf.len() {
        return Err(bad("truncated string"));
    }
    let len = buf[*p] as usize;
    if *p + 1 + len > buf.len() {
        return Err(bad("truncated string"));
    }
    let s = Bstr::new(&buf[*p + 1..*p + 1 + len]);
    *p += 1 + len;
    Ok(s)
}

fn parse_u32(buf: &[u8], p: &mut usize) -> StoreResult<u32> {
    if *p + 4 > buf.len() {
        return Err(bad("truncated field"));
    }
    let v = u32::from_be_bytes(buf[*p..*p + 4].try_into().unwrap());
    *p += 4;
    Ok(v)
}

/// Decode one request payload.
pub fn decode_request(payload: &[u8]) -> StoreResult<Request> {
    let mut p = 0;
    let op = parse_u32(payload, &mut p)?;
    let req = match op {
        OP_PARAMS => Request::Params,
        OP_SET => Request::Set {
            key: parse_str(payload, &mut p)?,
            value: parse_str(payload, &mut p)?,
        },
        OP_CAS => Request::Cas {
            key: parse_str(payload, &mut p)?,
            oval: parse_str(payload, &mut p)?,
            value: parse_str(payload, &mut p)?,
        },
        OP_ADD => Request::Add {
            key: parse_str(payload, &mut p)?,
            value: parse_str(payload, &mut p)?,
        },
        OP_MODIFY => Request::Modify {
            key: parse_str(payload, &mut p)?,
            value: parse_str(payload, &mut p)?,
        },
        OP_DELETE => Request::Delete {
            key: parse_str(payload, &mut p)?,
        },
        OP_CAD => Request::Cad {
            key: parse_str(payload, &mut p)?,
            oval: parse_str(payload, &mut p)?,
        },
        OP_GET => Request::Get {
            key: parse_str(payload, &mut p)?,
        },
        OP_RANGE => Request::Range {
            max: parse_u32(payload, &mut p)? as usize,
            start: parse_str(payload, &mut p)?,
            end: parse_str(payload, &mut p)?,
        },
        other => {
            return Err(bad(&format!("unrecognized request type 0x{:08x}", other)));
        }
    };
    if p != payload.len() {
        return Err(bad("trailing bytes after request"));
    }
    Ok(req)
}

/// Encode a request payload (client side).
pub fn encode_request(req: &Request) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut put = |s: &Bstr, buf: &mut Vec<u8>| {
        buf.push(s.len() as u8);
        buf.extend_from_slice(s.as_bytes());
    };
    match req {
        Request::Params => buf.extend_from_slice(&OP_PARAMS.to_be_bytes()),
        Request::Set { key, value } => {
            buf.extend_from_slice(&OP_SET.to_be_bytes());
            put(key, &mut buf);
            put(value, &mut buf);
        }
        Request::Cas { key, oval, value } => {
            buf.extend_from_slice(&OP_CAS.to_be_bytes());
            put(key, &mut buf);
            put(oval, &mut buf);
            put(value, &mut buf);
        }
        Request::Add { key, value } => {
            buf.extend_from_slice(&OP_ADD.to_be_bytes());
            put(key, &mut buf);
            put(value, &mut buf);
        }
        Request::Modify { key, value } => {
            buf.extend_from_slice(&OP_MODIFY.to_be_bytes());
            put(key, &mut buf);
            put(value, &mut buf);
        }
        Request::Delete { key } => {
            buf.extend_from_slice(&OP_DELETE.to_be_bytes());
            put(key, &mut buf);
        }
        Request::Cad { key, oval } => {
            buf.extend_from_slice(&OP_CAD.to_be_bytes());
            put(key, &mut buf);
            put(oval, &mut buf);
        }
        Request::Get { key } => {
            buf.extend_from_slice(&OP_GET.to_be_bytes());
            put(key, &mut buf);
        }
        Request::Range { max, start, end } => {
            buf.extend_from_slice(&OP_RANGE.to_be_bytes());
            buf.extend_from_slice(&(*max as u32).to_be_bytes());
            put(start, &mut buf);
            put(end, &mut buf);
        }
    }
    buf
}

/// PARAMS response: 4B kmax, 4B vmax.
pub fn encode_params_response(kmax: usize, vmax: usize) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8);
    buf.extend_from_slice(&(kmax as u32).to_be_bytes());
    buf.extend_from_slice(&(vmax as u32).to_be_bytes());
    buf
}

/// Plain status response (SET/CAS/ADD/MODIFY/DELETE/CAD).
pub fn encode_status_response(status: u32) -> Vec<u8> {
    status.to_be_bytes().to_vec()
}

/// GET response: status, then the value when found.
pub fn encode_get_response(value: Option<&Bstr>) -> Vec<u8> {
    match value {
        Some(v) => {
            let mut buf = Vec::with_capacity(5 + v.len());
            buf.extend_from_slice(&0u32.to_be_bytes());
            buf.push(v.len() as u8);
            buf.extend_from_slice(v.as_bytes());
            buf
        }
        None => 1u32.to_be_bytes().to_vec(),
    }
}

/// RANGE response: status 0, pair count, next key, then the pairs.
pub fn encode_range_response(next: &Bstr, pairs: &[(Bstr, Bstr)]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&0u32.to_be_bytes());
    buf.extend_from_slice(&(pairs.len() as u32).to_be_bytes());
    buf.push(next.len() as u8);
    buf.extend_from_slice(next.as_bytes());
    for (k, v) in pairs {
        buf.push(k.len() as u8);
        buf.extend_from_slice(k.as_bytes());
        buf.push(v.len() as u8);
        buf.extend_from_slice(v.as_bytes());
    }
    buf
}

/// Decode a status response (client side).
pub fn decode_status_response(payload: &[u8]) -> StoreResult<u32> {
    let mut p = 0;
    let status = parse_u32(payload, &mut p)?;
    if p != payload.len() {
        return Err(bad("trailing bytes after status"));
    }
    Ok(status)
}

/// Decode a PARAMS response (client side).
pub fn decode_params_response(payload: &[u8]) -> StoreResult<(usize, usize)> {
    let mut p = 0;
    let kmax = parse_u32(payload, &mut p)? as usize;
    let vmax = parse_u32(payload, &mut p)? as usize;
    if p != payload.len() {
        return Err(bad("trailing bytes after PARAMS response"));
    }
    Ok((kmax, vmax))
}

/// Decode a GET response (client side).
pub fn decode_get_response(payload: &[u8]) -> StoreResult<Option<Bstr>> {
    let mut p = 0;
    let status = parse_u32(payload, &mut p)?;
    if status != 0 {
        return Ok(None);
    }
    let value = parse_str(payload, &mut p)?;
    if p != payload.len() {
        return Err(bad("trailing bytes after GET response"));
    }
    Ok(Some(value))
}

/// Decode a RANGE response (client side).
pub fn decode_range_response(payload: &[u8]) -> StoreResult<(Bstr, Vec<(Bstr, Bstr)>)> {
    let mut p = 0;
    let _status = parse_u32(payload, &mut p)?;
    let nkeys = parse_u32(payload, &mut p)? as usize;
    let next = parse_str(payload, &mut p)?;
    let mut pairs = Vec::with_capacity(nkeys);
    for _ in 0..nkeys {
        let k = parse_str(payload, &mut p)?;
        let v = parse_str(payload, &mut p)?;
        pairs.push((k, v));
    }
    if p != payload.len() {
        return Err(bad("trailing bytes after RANGE response"));
    }
    Ok((next, pairs))
}
