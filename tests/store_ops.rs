// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! End-to-end operation semantics against an in-memory block store.

mod common;

use common::*;
use reedstore::btree::sync;
use reedstore::keys::Bstr;
use reedstore::server::proto::Request;

#[test]
fn test_fresh_tree_set_get_range() {
    run(async {
        let (_store, bt) = open_mem(512, 0.0).await;

        assert_eq!(set(&bt, "a", b"1").await, 0);
        assert_eq!(set(&bt, "b", b"2").await, 0);
        assert_eq!(get(&bt, "a").await, Some(b"1".to_vec()));
        assert_eq!(get(&bt, "b").await, Some(b"2".to_vec()));
        assert_eq!(get(&bt, "c").await, None);

        let (next, pairs) = range(&bt, "", "", 1000).await;
        assert_eq!(next, b"");
        assert_eq!(
            pairs,
            vec![
                (b"a".to_vec(), b"1".to_vec()),
                (b"b".to_vec(), b"2".to_vec()),
            ]
        );
    });
}

#[test]
fn test_cas_cad_semantics() {
    run(async {
        let (_store, bt) = open_mem(512, 0.0).await;
        set(&bt, "a", b"1").await;
        set(&bt, "b", b"2").await;

        assert_eq!(cas(&bt, "a", b"1", b"11").await, 0);
        assert_eq!(get(&bt, "a").await, Some(b"11".to_vec()));
        // The old value no longer matches.
        assert_eq!(cas(&bt, "a", b"1", b"22").await, 1);
        assert_eq!(get(&bt, "a").await, Some(b"11".to_vec()));

        assert_eq!(cad(&bt, "a", b"22").await, 0);
        assert_eq!(get(&bt, "a").await, None);
        // Gone already: the precondition fails.
        assert_eq!(cad(&bt, "a", b"22").await, 1);
    });
}

#[test]
fn test_add_modify_distinction() {
    run(async {
        let (_store, bt) = open_mem(512, 0.0).await;

        assert_eq!(add(&bt, "k", b"v").await, 0);
        assert_eq!(add(&bt, "k", b"w").await, 1);
        assert_eq!(get(&bt, "k").await, Some(b"v".to_vec()));

        assert_eq!(modify(&bt, "k", b"w").await, 0);
        assert_eq!(get(&bt, "k").await, Some(b"w".to_vec()));
        assert_eq!(modify(&bt, "z", b"w").await, 1);
        assert_eq!(get(&bt, "z").await, None);
    });
}

#[test]
fn test_delete_then_get_missing() {
    run(async {
        let (_store, bt) = open_mem(512, 0.0).await;
        set(&bt, "k", b"v").await;
        assert_eq!(del(&bt, "k").await, 0);
        assert_eq!(get(&bt, "k").await, None);
        // DELETE of a missing key still reports success.
        assert_eq!(del(&bt, "k").await, 0);
    });
}

#[test]
fn test_forced_split_grows_tree() {
    run(async {
        let (_store, bt) = open_mem(2048, 0.0).await;
        assert_eq!(bt.state_ref().pool.get(bt.state_ref().root_dirty.unwrap()).height, 0);

        let reqs: Vec<Request> = (0..20)
            .map(|i| Request::Set {
                key: Bstr::new(format!("key{:02}", i).as_bytes()),
                value: Bstr::new(&[b'x'; 240]),
            })
            .collect();
        let statuses = batch(&bt, reqs).await;
        assert!(statuses.iter().all(|&s| s == 0));

        {
            let t = bt.state_ref();
            assert_eq!(t.pool.get(t.root_dirty.unwrap()).height, 1);
            assert!(t.npages <= 10, "used {} pages", t.npages);
        }
        for i in 0..20 {
            let key = format!("key{:02}", i);
            assert_eq!(get(&bt, &key).await, Some(vec![b'x'; 240]));
        }
    });
}

#[test]
fn test_empty_keys_and_values() {
    run(async {
        let (_store, bt) = open_mem(512, 0.0).await;
        assert_eq!(set(&bt, "", b"").await, 0);
        assert_eq!(get(&bt, "").await, Some(Vec::new()));
        assert_eq!(set(&bt, "", b"x").await, 0);
        assert_eq!(get(&bt, "").await, Some(b"x".to_vec()));
        assert_eq!(del(&bt, "").await, 0);
        assert_eq!(get(&bt, "").await, None);
    });
}

#[test]
fn test_max_length_keys_and_values() {
    run(async {
        let (_store, bt) = open_mem(4096, 0.0).await;
        assert_eq!(bt.keymax, 255);
        let key = "k".repeat(255);
        let value = vec![0xffu8; 255];
        assert_eq!(set(&bt, &key, &value).await, 0);
        assert_eq!(get(&bt, &key).await, Some(value));
    });
}

#[test]
fn test_empty_tree_reads() {
    run(async {
        let (_store, bt) = open_mem(512, 0.0).await;
        assert_eq!(get(&bt, "anything").await, None);
        let (next, pairs) = range(&bt, "", "", 1000).await;
        assert_eq!(next, b"");
        assert!(pairs.is_empty());
    });
}

#[test]
fn test_range_respects_bounds_and_budget() {
    run(async {
        let (_store, bt) = open_mem(512, 0.0).await;
        for i in 0..20 {
            set(&bt, &format!("key{:02}", i), b"value").await;
        }

        // Bounded range: [key05, key10).
        let (next, pairs) = range(&bt, "key05", "key10", 10_000).await;
        assert_eq!(next, b"key10");
        let keys: Vec<&[u8]> = pairs.iter().map(|(k, _)| k.as_slice()).collect();
        assert_eq!(
            keys,
            vec![b"key05" as &[u8], b"key06", b"key07", b"key08", b"key09"]
        );

        // A tiny budget still returns at least one pair, and `next`
        // names the first key not returned.
        let (next, pairs) = range(&bt, "key05", "key10", 1).await;
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].0, b"key05".to_vec());
        assert_eq!(next, b"key06".to_vec());

        // Results are sorted and inside [start, next).
        let (next, pairs) = range(&bt, "key03", "", 10_000).await;
        let keys: Vec<&[u8]> = pairs.iter().map(|(k, _)| k.as_slice()).collect();
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
        for k in &keys {
            assert!(*k >= b"key03" as &[u8]);
            if !next.is_empty() {
                assert!(*k < next.as_slice());
            }
        }
    });
}

#[test]
fn test_range_resumes_through_whole_tree() {
    run(async {
        let (_store, bt) = open_mem(512, 0.0).await;
        let reqs: Vec<Request> = (0..80)
            .map(|i| Request::Set {
                key: Bstr::new(format!("key{:03}", i).as_bytes()),
                value: Bstr::new(&[b'v'; 20]),
            })
            .collect();
        batch(&bt, reqs).await;

        // Walk the keyspace by chaining `next` cursors.
        let mut cursor = String::new();
        let mut collected = Vec::new();
        loop {
            let (next, pairs) = range(&bt, &cursor, "", 100_000).await;
            collected.extend(pairs.into_iter().map(|(k, _)| k));
            if next.is_empty() {
                break;
            }
            cursor = String::from_utf8(next).unwrap();
        }
        assert_eq!(collected.len(), 80);
        assert!(collected.windows(2).all(|w| w[0] < w[1]));
    });
}

#[test]
fn test_group_commit_batches_cas_chain() {
    run(async {
        let (_store, bt) = open_mem(512, 0.0).await;
        set(&bt, "x", b"0").await;

        // In one batch, each CAS sees the previous request's effect.
        let statuses = batch(
            &bt,
            vec![
                Request::Cas {
                    key: Bstr::from("x"),
                    oval: Bstr::from("0"),
                    value: Bstr::from("1"),
                },
                Request::Cas {
                    key: Bstr::from("x"),
                    oval: Bstr::from("1"),
                    value: Bstr::from("2"),
                },
                Request::Cas {
                    key: Bstr::from("x"),
                    oval: Bstr::from("0"),
                    value: Bstr::from("9"),
                },
            ],
        )
        .await;
        assert_eq!(statuses, vec![0, 0, 1]);
        assert_eq!(get(&bt, "x").await, Some(b"2".to_vec()));
    });
}

#[test]
fn test_oldestleaf_never_regresses() {
    run(async {
        let (_store, bt) = open_mem(512, 0.0).await;
        let mut prev = 0;
        for i in 0..50 {
            set(&bt, &format!("key{:03}", i % 17), b"v").await;
            let t = bt.state_ref();
            let oldest = sync::oldest_leaf(&t);
            assert!(oldest >= prev);
            prev = oldest;
        }
    });
}
