// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Tests for packet framing.

#[cfg(test)]
mod tests {
    use crate::error::StoreError;
    use crate::wire::{read_packet, write_packet, Packet};

    #[tokio::test]
    async fn test_roundtrip() {
        let mut buf = Vec::new();
        let packet = Packet::new(42, vec![1, 2, 3, 4, 5]);
        write_packet(&mut buf, &packet).await.unwrap();

        let mut reader = &buf[..];
        let parsed = read_packet(&mut reader).await.unwrap();
        assert_eq!(parsed, packet);
    }

    #[tokio::test]
    async fn test_empty_payload() {
        let mut buf = Vec::new();
        write_packet(&mut buf, &Packet::new(0, vec![])).await.unwrap();
        assert_eq!(buf.len(), 16);
        let mut reader = &buf[..];
        let parsed = read_packet(&mut reader).await.unwrap();
        assert_eq!(parsed.id, 0);
        assert!(parsed.payload.is_empty());
    }

    #[tokio::test]
    async fn test_crc_mismatch_detected() {
        let mut buf = Vec::new();
        write_packet(&mut buf, &Packet::new(7, vec![9, 9, 9])).await.unwrap();
        buf[13] ^= 0xff; // corrupt the payload
        let mut reader = &buf[..];
        assert!(matches!(
            read_packet(&mut reader).await,
            Err(StoreError::ProtocolError { .. })
        ));
    }

    #[tokio::test]
    async fn test_eof_is_connection_closed() {
        let mut reader: &[u8] = &[];
        assert!(matches!(
            read_packet(&mut reader).await,
            Err(StoreError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_truncated_packet_is_io_error() {
        let mut buf = Vec::new();
        write_packet(&mut buf, &Packet::new(1, vec![1, 2, 3])).await.unwrap();
        buf.truncate(buf.len() - 2);
        let mut reader = &buf[..];
        assert!(matches!(
            read_packet(&mut reader).await,
            Err(StoreError::IoError { .. })
        ));
    }

    #[tokio::test]
    async fn test_oversize_length_rejected() {
        let mut buf = vec![0u8; 12];
        buf[8..12].copy_from_slice(&u32::MAX.to_be_bytes());
        let mut reader = &buf[..];
        assert!(matches!(
            read_packet(&mut reader).await,
            Err(StoreError::ProtocolError { .. })
        ));
    }
}
