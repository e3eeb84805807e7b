// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Tests for the block-store client against a scripted daemon.

#[cfg(test)]
mod tests {
    use crate::error::StoreError;
    use crate::lbs::{proto, LbsClient};
    use crate::test_utils::run;
    use crate::wire::{read_packet, write_packet, Packet};
    use std::rc::Rc;
    use tokio::io::DuplexStream;

    const BLKLEN: usize = 64;

    /* A daemon which answers PARAMS2/GET/APPEND/FREE from a canned
     * three-block store. */
    async fn fake_daemon(stream: DuplexStream) {
        let (mut r, mut w) = tokio::io::split(stream);
        while let Ok(packet) = read_packet(&mut r).await {
            let op = u32::from_be_bytes(packet.payload[0..4].try_into().unwrap());
            let body = &packet.payload[4..];
            let response = match op {
                proto::OP_PARAMS2 => {
                    let mut buf = Vec::new();
                    buf.extend_from_slice(&(BLKLEN as u32).to_be_bytes());
                    buf.extend_from_slice(&3u64.to_be_bytes());
                    buf.extend_from_slice(&2u64.to_be_bytes());
                    buf
                }
                proto::OP_GET => {
                    let blkno = u64::from_be_bytes(body[0..8].try_into().unwrap());
                    if blkno < 3 {
                        let mut buf = 0u32.to_be_bytes().to_vec();
                        buf.extend_from_slice(&vec![blkno as u8; BLKLEN]);
                        buf
                    } else {
                        1u32.to_be_bytes().to_vec()
                    }
                }
                proto::OP_APPEND => {
                    let nblks = u32::from_be_bytes(body[0..4].try_into().unwrap()) as u64;
                    let blkno = u64::from_be_bytes(body[4..12].try_into().unwrap());
                    if blkno == 3 {
                        let mut buf = 0u32.to_be_bytes().to_vec();
                        buf.extend_from_slice(&(blkno + nblks).to_be_bytes());
                        buf
                    } else {
                        1u32.to_be_bytes().to_vec()
                    }
                }
                proto::OP_FREE => 0u32.to_be_bytes().to_vec(),
                _ => panic!("unexpected op"),
            };
            if write_packet(&mut w, &Packet::new(packet.id, response))
                .await
                .is_err()
            {
                break;
            }
        }
    }

    fn client() -> Rc<LbsClient> {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        tokio::task::spawn_local(fake_daemon(remote));
        let (r, w) = tokio::io::split(local);
        LbsClient::start(r, w)
    }

    #[test]
    fn test_params2() {
        run(async {
            let c = client();
            let params = c.params2().await.unwrap();
            assert_eq!(params.blklen, BLKLEN);
            assert_eq!(params.nextblk, 3);
            assert_eq!(params.lastblk, 2);
        });
    }

    #[test]
    fn test_get_present_and_missing() {
        run(async {
            let c = client();
            let block = c.get(1, BLKLEN).await.unwrap();
            assert_eq!(block, Some(vec![1u8; BLKLEN]));
            let missing = c.get(9, BLKLEN).await.unwrap();
            assert!(missing.is_none());
        });
    }

    #[test]
    fn test_append_and_conflict() {
        run(async {
            let c = client();
            let pages: Vec<Rc<[u8]>> = vec![Rc::from(vec![9u8; BLKLEN])];
            let next = c.append(3, BLKLEN, &pages).await.unwrap();
            assert_eq!(next, 4);
            // Wrong position: a writer race.
            assert!(matches!(
                c.append(7, BLKLEN, &pages).await,
                Err(StoreError::AppendConflict { .. })
            ));
        });
    }

    #[test]
    fn test_concurrent_requests_multiplex() {
        run(async {
            let c = client();
            let (a, b, f) = tokio::join!(c.get(0, BLKLEN), c.get(2, BLKLEN), c.free(1));
            assert_eq!(a.unwrap(), Some(vec![0u8; BLKLEN]));
            assert_eq!(b.unwrap(), Some(vec![2u8; BLKLEN]));
            f.unwrap();
        });
    }

    #[test]
    fn test_lost_connection_fails_requests() {
        run(async {
            let (local, remote) = tokio::io::duplex(1024);
            // No daemon: the far end closes immediately.
            drop(remote);
            let (r, w) = tokio::io::split(local);
            let c = LbsClient::start(r, w);
            tokio::task::yield_now().await;
            assert!(matches!(
                c.params2().await,
                Err(StoreError::BlockStoreFailed { .. })
            ));
        });
    }
}
