// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Tests for the in-memory block store.

#[cfg(test)]
mod tests {
    use crate::error::StoreError;
    use crate::lbs::MemStore;
    use std::rc::Rc;

    fn page(byte: u8, len: usize) -> Rc<[u8]> {
        Rc::from(vec![byte; len])
    }

    #[test]
    fn test_empty_params() {
        let store = MemStore::new(512);
        let params = store.params2();
        assert_eq!(params.blklen, 512);
        assert_eq!(params.nextblk, 0);
        assert_eq!(params.lastblk, u64::MAX);
    }

    #[test]
    fn test_append_and_get() {
        let store = MemStore::new(16);
        let next = store.append(0, 16, &[page(1, 16), page(2, 16)]).unwrap();
        assert_eq!(next, 2);
        assert_eq!(store.get(0), Some(vec![1; 16]));
        assert_eq!(store.get(1), Some(vec![2; 16]));
        assert_eq!(store.get(2), None);
        let params = store.params2();
        assert_eq!(params.nextblk, 2);
        assert_eq!(params.lastblk, 1);
    }

    #[test]
    fn test_append_conflict() {
        let store = MemStore::new(16);
        store.append(0, 16, &[page(1, 16)]).unwrap();
        assert!(matches!(
            store.append(0, 16, &[page(2, 16)]),
            Err(StoreError::AppendConflict { .. })
        ));
    }

    #[test]
    fn test_free_discards_blocks() {
        let store = MemStore::new(16);
        store
            .append(0, 16, &[page(1, 16), page(2, 16), page(3, 16)])
            .unwrap();
        store.free(2);
        assert_eq!(store.get(0), None);
        assert_eq!(store.get(1), None);
        assert_eq!(store.get(2), Some(vec![3; 16]));
        assert_eq!(store.live_blocks(), 1);
        assert_eq!(store.oldest_live(), Some(2));
    }

    #[test]
    fn test_free_past_end_is_safe() {
        let store = MemStore::new(16);
        store.append(0, 16, &[page(1, 16)]).unwrap();
        store.free(100);
        assert_eq!(store.live_blocks(), 0);
        // Appends continue at the old position.
        assert_eq!(store.append(1, 16, &[page(2, 16)]).unwrap(), 2);
    }
}
