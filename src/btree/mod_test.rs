// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Tests for tree open, close and recovery.

#[cfg(test)]
mod tests {
    use crate::btree::{sanity, Btree, TreeConfig};
    use crate::error::StoreError;
    use crate::lbs::{BlockStore, MemStore};
    use crate::test_utils::{get, open_mem, reopen, run, set};
    use std::rc::Rc;

    #[test]
    fn test_open_empty_store_bootstraps_root() {
        run(async {
            let (store, bt) = open_mem(512, 0.0).await;
            {
                let t = bt.state_ref();
                assert_eq!(t.root_shadow, t.root_dirty);
                assert_eq!(t.nnodes, 1);
                assert_eq!(t.nextblk, 1);
                assert_eq!(t.npages, 1);
                sanity::check_locks(&t);
            }
            assert_eq!(store.params2().nextblk, 1);
            bt.close().await;
        });
    }

    #[test]
    fn test_close_releases_everything() {
        run(async {
            let (_store, bt) = open_mem(512, 0.0).await;
            set(&bt, "a", "1").await;
            bt.close().await;
            let t = bt.state_ref();
            assert!(t.root_shadow.is_none());
            assert_eq!(t.pool.pooled(), 0);
        });
    }

    #[test]
    fn test_reopen_finds_root_by_scan_back() {
        run(async {
            let (store, bt) = open_mem(512, 0.0).await;
            set(&bt, "a", "1").await;
            set(&bt, "b", "2").await;
            // Abandon without closing, as a crash would.
            drop(bt);

            let bt = reopen(&store, 0.0).await;
            assert_eq!(get(&bt, "a").await, Some(b"1".to_vec()));
            assert_eq!(get(&bt, "b").await, Some(b"2".to_vec()));
            assert_eq!(get(&bt, "c").await, None);
            let t = bt.state_ref();
            assert_eq!(t.npages, t.nextblk - crate::btree::sync::oldest_leaf(&t));
        });
    }

    #[test]
    fn test_reopen_recovers_nnodes_from_root_page() {
        run(async {
            let (store, bt) = open_mem(512, 0.0).await;
            set(&bt, "a", "1").await;
            let nnodes = bt.state_ref().nnodes;
            drop(bt);

            let bt = reopen(&store, 0.0).await;
            assert_eq!(bt.state_ref().nnodes, nnodes);
        });
    }

    #[test]
    fn test_open_rejects_tiny_cache() {
        run(async {
            let store = MemStore::new(512);
            let result = Btree::open(
                BlockStore::Memory(store),
                TreeConfig {
                    cache_pages: Some(16),
                    ..TreeConfig::default()
                },
            )
            .await;
            assert!(matches!(result, Err(StoreError::InvalidCacheSize { .. })));
        });
    }

    #[test]
    fn test_open_rejects_oversize_limits() {
        run(async {
            let store = MemStore::new(512);
            let result = Btree::open(
                BlockStore::Memory(store),
                TreeConfig {
                    keymax: Some(255),
                    valmax: Some(255),
                    ..TreeConfig::default()
                },
            )
            .await;
            assert!(matches!(result, Err(StoreError::LimitsTooLarge { .. })));
        });
    }

    #[test]
    fn test_default_limits_scale_with_page_size() {
        run(async {
            let (_store, bt) = open_mem(512, 0.0).await;
            assert_eq!(bt.keymax, 64);
            assert_eq!(bt.valmax, 96);
            let (_store, bt) = open_mem(4096, 0.0).await;
            assert_eq!(bt.keymax, 255);
            assert_eq!(bt.valmax, 255);
        });
    }

    #[test]
    fn test_open_store_with_no_valid_root_fails() {
        run(async {
            // A store whose only block is not a valid page.
            let store = MemStore::new(512);
            store
                .append(0, 512, &[Rc::from(vec![0xabu8; 512])])
                .unwrap();
            let result = Btree::open(BlockStore::Memory(store), TreeConfig::default()).await;
            assert!(matches!(result, Err(StoreError::InvalidPage { .. })));
        });
    }

    #[test]
    fn test_open_fully_freed_store_fails() {
        run(async {
            let (store, bt) = open_mem(512, 0.0).await;
            set(&bt, "a", "1").await;
            drop(bt);
            // Everything freed: no root can be recovered.
            let nextblk = store.params2().nextblk;
            store.free(nextblk);
            let result = Btree::open(
                BlockStore::Memory(Rc::clone(&store)),
                TreeConfig::default(),
            )
            .await;
            assert!(matches!(result, Err(StoreError::RootNotFound { .. })));
        });
    }
}
