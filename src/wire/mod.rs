// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Packet framing shared by the served protocol and the block-store
//! client.
//!
//! Every packet on a connection is:
//!
//! ```text
//! offset length data
//! ====== ====== ====
//!      0      8 BE request ID
//!      8      4 BE payload length
//!     12      n payload
//!   12+n      4 BE CRC32 of everything before the trailer
//! ```
//!
//! Request IDs are chosen by the requesting side and echoed on the
//! response; payloads are opaque at this layer.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{StoreError, StoreResult};

#[cfg(test)]
mod mod_test;

/// Largest payload accepted on a connection. Generous compared to any
/// legal request or response (pages and values are both bounded), tight
/// enough to stop a corrupt length prefix from allocating wildly.
pub const MAX_PAYLOAD: usize = 1 << 26;

/// One framed packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: u64,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(id: u64, payload: Vec<u8>) -> Self {
        Self { id, payload }
    }
}

/// Read one packet.
///
/// ## Error Conditions
/// - `ConnectionClosed`: EOF before the first header byte
/// - `ProtocolError`: Truncated packet, oversize length, or CRC mismatch
pub async fn read_packet<R>(r: &mut R) -> StoreResult<Packet>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 12];
    match r.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(StoreError::ConnectionClosed);
        }
        Err(e) => {
            return Err(StoreError::IoError {
                operation: "read_packet".to_string(),
                reason: e.to_string(),
            });
        }
    }

    let id = u64::from_be_bytes(header[0..8].try_into().unwrap());
    let len = u32::from_be_bytes(header[8..12].try_into().unwrap()) as usize;
    if len > MAX_PAYLOAD {
        return Err(StoreError::ProtocolError {
            reason: format!("payload length {} exceeds limit", len),
        });
    }

    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).await.map_err(|e| StoreError::IoError {
        operation: "read_packet".to_string(),
        reason: e.to_string(),
    })?;

    let mut trailer = [0u8; 4];
    r.read_exact(&mut trailer).await.map_err(|e| StoreError::IoError {
        operation: "read_packet".to_string(),
        reason: e.to_string(),
    })?;

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&header);
    hasher.update(&payload);
    let crc = hasher.finalize();
    if crc != u32::from_be_bytes(trailer) {
        return Err(StoreError::ProtocolError {
            reason: "packet CRC mismatch".to_string(),
        });
    }

    Ok(Packet { id, payload })
}

/// Write one packet.
pub async fn write_packet<W>(w: &mut W, packet: &Packet) -> StoreResult<()>
where
    W: AsyncWrite + Unpin,
{
    let mut header = [0u8; 12];
    header[0..8].copy_from_slice(&packet.id.to_be_bytes());
    header[8..12].copy_from_slice(&(packet.payload.len() as u32).to_be_bytes());

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&header);
    hasher.update(&packet.payload);
    let crc = hasher.finalize();

    let mut buf = Vec::with_capacity(16 + packet.payload.len());
    buf.extend_from_slice(&header);
    buf.extend_from_slice(&packet.payload);
    buf.extend_from_slice(&crc.to_be_bytes());

    w.write_all(&buf).await.map_err(|e| StoreError::IoError {
        operation: "write_packet".to_string(),
        reason: e.to_string(),
    })?;
    w.flush().await.map_err(|e| StoreError::IoError {
        operation: "write_packet".to_string(),
        reason: e.to_string(),
    })?;

    Ok(())
}
