// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Crash-recovery behaviour: a fresh instance over the same block store
//! must see exactly the committed state.

mod common;

use common::*;
use reedstore::keys::Bstr;
use reedstore::server::proto::Request;

#[test]
fn test_recover_last_committed_value() {
    run(async {
        let (store, bt) = open_mem(512, 0.0).await;
        set(&bt, "a", b"1").await;
        set(&bt, "b", b"2").await;
        set(&bt, "a", b"11").await;
        // Crash: no clean shutdown.
        drop(bt);

        let bt = reopen(&store).await;
        // Every response was emitted after its batch's append, so the
        // recovered state is exactly what was acknowledged.
        assert_eq!(get(&bt, "a").await, Some(b"11".to_vec()));
        assert_eq!(get(&bt, "b").await, Some(b"2".to_vec()));
        assert_eq!(get(&bt, "c").await, None);
    });
}

#[test]
fn test_recover_multi_level_tree() {
    run(async {
        let (store, bt) = open_mem(512, 0.0).await;
        let reqs: Vec<Request> = (0..120)
            .map(|i| Request::Set {
                key: Bstr::new(format!("key{:04}", i).as_bytes()),
                value: Bstr::new(format!("val{:04}", i).as_bytes()),
            })
            .collect();
        batch(&bt, reqs).await;
        drop(bt);

        let bt = reopen(&store).await;
        for i in [0usize, 17, 63, 119] {
            let key = format!("key{:04}", i);
            let val = format!("val{:04}", i);
            assert_eq!(get(&bt, &key).await, Some(val.into_bytes()));
        }
        assert_eq!(get(&bt, "key9999").await, None);

        // The recovered tree keeps serving writes.
        set(&bt, "key0000", b"rewritten").await;
        assert_eq!(get(&bt, "key0000").await, Some(b"rewritten".to_vec()));
    });
}

#[test]
fn test_recover_after_deletes() {
    run(async {
        let (store, bt) = open_mem(512, 0.0).await;
        for i in 0..30 {
            set(&bt, &format!("key{:02}", i), b"v").await;
        }
        for i in 0..15 {
            del(&bt, &format!("key{:02}", i)).await;
        }
        drop(bt);

        let bt = reopen(&store).await;
        assert_eq!(get(&bt, "key00").await, None);
        assert_eq!(get(&bt, "key14").await, None);
        assert_eq!(get(&bt, "key15").await, Some(b"v".to_vec()));
        assert_eq!(get(&bt, "key29").await, Some(b"v".to_vec()));
    });
}

#[test]
fn test_repeated_crashes() {
    run(async {
        let (store, bt) = open_mem(512, 0.0).await;
        set(&bt, "counter", b"0").await;
        drop(bt);

        for i in 1..=5u8 {
            let bt = reopen(&store).await;
            set(&bt, "counter", &[b'0' + i]).await;
            drop(bt);
        }

        let bt = reopen(&store).await;
        assert_eq!(get(&bt, "counter").await, Some(b"5".to_vec()));
    });
}

#[test]
fn test_recovery_scans_past_non_root_pages() {
    run(async {
        let (store, bt) = open_mem(512, 0.0).await;
        // A multi-node batch writes leaves after the previous root, so
        // the last block really is a root but the ones before the
        // previous root are leaves: the scan-back must stop at the
        // first root it meets.
        let reqs: Vec<Request> = (0..60)
            .map(|i| Request::Set {
                key: Bstr::new(format!("key{:04}", i).as_bytes()),
                value: Bstr::new(&[b'v'; 24]),
            })
            .collect();
        batch(&bt, reqs).await;
        let nextblk = store.params2().nextblk;
        drop(bt);

        let bt = reopen(&store).await;
        // The newest root is the last block written.
        assert_eq!(bt.state_ref().nextblk, nextblk);
        assert_eq!(get(&bt, "key0000").await, Some(vec![b'v'; 24]));
    });
}
