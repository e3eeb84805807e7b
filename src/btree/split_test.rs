// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Tests for node splitting.

#[cfg(test)]
mod tests {
    use crate::btree::cleaning::Cleaner;
    use crate::btree::node::{Node, NodeData, NodeState, PAGENUM_NONE};
    use crate::btree::{nodeops, split, Tree};
    use crate::codec;
    use crate::keys::{Bstr, KvPair};
    use crate::pool::{NodeId, Pool};

    const PAGELEN: usize = 512;

    fn tree() -> Tree {
        Tree {
            pagelen: PAGELEN,
            poolsz: 1024,
            nextblk: 0,
            root_shadow: None,
            root_dirty: None,
            pool: Pool::new(1024),
            nnodes: 1,
            npages: 0,
            cleaner: Cleaner::new(),
        }
    }

    fn big_leaf(t: &mut Tree, npairs: usize) -> NodeId {
        let pairs: Vec<KvPair> = (0..npairs)
            .map(|i| {
                KvPair::new(
                    Bstr::new(format!("key{:04}", i).as_bytes()),
                    Bstr::new(&[b'v'; 24]),
                )
            })
            .collect();
        nodeops::mkleaf(t, pairs)
    }

    #[test]
    fn test_small_node_is_one_part() {
        let mut t = tree();
        let n = big_leaf(&mut t, 3);
        assert_eq!(split::nparts(&t, n), 1);
    }

    #[test]
    fn test_nparts_matches_split() {
        let mut t = tree();
        // ~34 bytes per pair: 40 pairs is ~1360 body bytes, well past
        // one page.
        let n = big_leaf(&mut t, 40);
        let expected = split::nparts(&t, n);
        assert!(expected > 1);
        let (seps, parts) = split::split(&mut t, n);
        assert_eq!(parts.len(), expected);
        assert_eq!(seps.len(), expected - 1);
    }

    #[test]
    fn test_split_preserves_pairs_and_fits_pages() {
        let mut t = tree();
        let n = big_leaf(&mut t, 40);
        let (seps, parts) = split::split(&mut t, n);

        let mut all: Vec<Vec<u8>> = Vec::new();
        for &part in &parts {
            assert!(codec::serialize_size(&mut t.pool, part) <= PAGELEN);
            for pair in t.pool.get(part).leaf_pairs() {
                all.push(pair.key.as_bytes().to_vec());
            }
        }
        assert_eq!(all.len(), 40);
        assert!(all.windows(2).all(|w| w[0] < w[1]));

        // Each separator is the first key of the part to its right.
        for (i, sep) in seps.iter().enumerate() {
            let right = t.pool.get(parts[i + 1]).leaf_pairs();
            assert_eq!(sep.as_bytes(), right[0].key.as_bytes());
        }
    }

    #[test]
    fn test_split_updates_tree_size() {
        let mut t = tree();
        let n = big_leaf(&mut t, 40);
        let before = t.nnodes;
        let (_, parts) = split::split(&mut t, n);
        assert_eq!(t.nnodes, before + parts.len() as u64 - 1);
    }

    #[test]
    fn test_split_parent_redistributes_children() {
        let mut t = tree();
        // A parent with enough separator keys to overflow a page:
        // 20 bytes per child descriptor plus long separators.
        let nkeys = 30;
        let kids: Vec<NodeId> = (0..nkeys + 1)
            .map(|i| t.pool.insert(Node::not_present(i as u64, i as u64, 64)))
            .collect();
        let keys: Vec<Bstr> = (0..nkeys)
            .map(|i| Bstr::new(format!("separator-key-{:04}", i).as_bytes()))
            .collect();
        let n = nodeops::mkparent(&mut t, 1, keys, kids.clone());
        assert!(codec::serialize_size(&mut t.pool, n) > PAGELEN);
        t.pool.get_mut(n).pagesize = None;

        let (seps, parts) = split::split(&mut t, n);
        assert!(parts.len() > 1);
        assert_eq!(seps.len(), parts.len() - 1);

        // Every child survives, in order, under exactly one part.
        let mut seen: Vec<NodeId> = Vec::new();
        for &part in &parts {
            assert!(codec::serialize_size(&mut t.pool, part) <= PAGELEN);
            for &c in t.pool.get(part).parent_children() {
                assert_eq!(t.pool.get(c).p_dirty, Some(part));
                seen.push(c);
            }
        }
        assert_eq!(seen, kids);
    }

    #[test]
    fn test_split_parts_are_dirty_nodes() {
        let mut t = tree();
        let n = big_leaf(&mut t, 40);
        let (_, parts) = split::split(&mut t, n);
        for &part in &parts {
            let node = t.pool.get(part);
            assert_eq!(node.state, NodeState::Dirty);
            assert_eq!(node.pagenum, PAGENUM_NONE);
            assert!(node.p_dirty.is_none());
            assert!(matches!(node.data, NodeData::Leaf { .. }));
            assert_eq!(t.pool.lockcount(part), 1);
        }
    }
}
