//! # Tree Operation Scenarios
//!
//! Black-box coverage of the public tree API: ordered scans, duplicate and
//! missing-key error kinds, slot recycling at the slab layer, and randomized
//! operation sequences checked against a shadow `BTreeMap` with a structural
//! `verify()` pass after every batch.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;

use crimson::{Entry, Item, Tree, TreeError, TreeOptions};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tempfile::tempdir;

fn open_tree(dir: &tempfile::TempDir, page_size: u16) -> Tree<u32, u32> {
    Tree::open(
        dir.path().join("tree"),
        TreeOptions {
            page_size,
            read_only: false,
        },
    )
    .unwrap()
}

fn collect(tree: &Tree<u32, u32>, from: u32) -> Vec<(u32, u32)> {
    let mut out = Vec::new();
    tree.scan(from, |k, v| {
        out.push((*k, *v));
        Ok(false)
    })
    .unwrap();
    out
}

mod ordering {
    use super::*;

    #[test]
    fn scan_yields_sorted_entries() {
        let dir = tempdir().unwrap();
        let tree = open_tree(&dir, 256);

        for k in [5u32, 3, 8, 1, 4, 7, 9, 2, 6] {
            tree.insert(Entry::new(k, k)).unwrap();
        }

        let expected: Vec<(u32, u32)> = (1..=9).map(|k| (k, k)).collect();
        assert_eq!(collect(&tree, 0), expected);
        assert_eq!(tree.count(), 9);
        tree.verify().unwrap();
    }

    #[test]
    fn deleting_the_root_keeps_order_and_balance() {
        let dir = tempdir().unwrap();
        let tree = open_tree(&dir, 256);

        for k in [5u32, 3, 8, 1, 4, 7, 9, 2, 6] {
            tree.insert(Entry::new(k, k)).unwrap();
        }
        tree.delete(&5).unwrap();

        let expected: Vec<(u32, u32)> =
            (1..=9).filter(|k| *k != 5).map(|k| (k, k)).collect();
        assert_eq!(collect(&tree, 0), expected);
        assert_eq!(tree.count(), 8);
        tree.verify().unwrap();
    }

    #[test]
    fn keyed_scan_starts_at_the_lower_bound() {
        let dir = tempdir().unwrap();
        let tree = open_tree(&dir, 256);

        for k in [10u32, 20, 30, 40, 50] {
            tree.insert(Entry::new(k, k)).unwrap();
        }

        assert_eq!(collect(&tree, 25), vec![(30, 30), (40, 40), (50, 50)]);
        assert_eq!(collect(&tree, 30), vec![(30, 30), (40, 40), (50, 50)]);
        assert_eq!(collect(&tree, 51), vec![]);
    }

    #[test]
    fn scan_stops_when_the_callback_says_so() {
        let dir = tempdir().unwrap();
        let tree = open_tree(&dir, 256);

        for k in 1..=20u32 {
            tree.insert_mem(Entry::new(k, k)).unwrap();
        }

        let mut seen = Vec::new();
        tree.scan(0, |k, _| {
            seen.push(*k);
            Ok(seen.len() == 3)
        })
        .unwrap();

        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[test]
    fn scan_propagates_callback_errors() {
        let dir = tempdir().unwrap();
        let tree = open_tree(&dir, 256);

        for k in 1..=5u32 {
            tree.insert_mem(Entry::new(k, k)).unwrap();
        }

        let err = tree
            .scan(0, |k, _| {
                if *k == 3 {
                    eyre::bail!("callback gave up at {k}")
                }
                Ok(false)
            })
            .unwrap_err();

        assert!(err.to_string().contains("gave up at 3"), "{err}");
    }

    #[test]
    fn scan_on_empty_tree_visits_nothing() {
        let dir = tempdir().unwrap();
        let tree = open_tree(&dir, 256);

        assert_eq!(collect(&tree, 0), vec![]);
        assert_eq!(tree.count(), 0);
    }
}

mod errors {
    use super::*;

    #[test]
    fn duplicate_insert_is_rejected_without_side_effects() {
        let dir = tempdir().unwrap();
        let tree = open_tree(&dir, 256);

        for k in [5u32, 3, 8, 1, 4, 7, 9, 2, 6] {
            tree.insert(Entry::new(k, k)).unwrap();
        }

        let err = tree.insert(Entry::new(7, 70)).unwrap_err();
        assert_eq!(
            TreeError::from_report(&err),
            Some(TreeError::KeyAlreadyExists)
        );

        assert_eq!(tree.count(), 9);
        assert_eq!(tree.get(&7).unwrap().val, 7);
        tree.verify().unwrap();
    }

    #[test]
    fn get_and_delete_report_missing_keys() {
        let dir = tempdir().unwrap();
        let tree = open_tree(&dir, 256);
        tree.insert(Entry::new(1, 1)).unwrap();

        let err = tree.get(&2).unwrap_err();
        assert_eq!(TreeError::from_report(&err), Some(TreeError::NotFound));

        let err = tree.delete(&2).unwrap_err();
        assert_eq!(TreeError::from_report(&err), Some(TreeError::NotFound));
        assert_eq!(tree.count(), 1);
    }

    #[test]
    fn insert_then_delete_then_get_is_not_found() {
        let dir = tempdir().unwrap();
        let tree = open_tree(&dir, 256);

        tree.insert(Entry::new(11, 110)).unwrap();
        assert_eq!(tree.get(&11).unwrap(), Entry::new(11, 110));

        tree.delete(&11).unwrap();
        let err = tree.get(&11).unwrap_err();
        assert_eq!(TreeError::from_report(&err), Some(TreeError::NotFound));
    }

    /// A key type whose instances can disagree with the tree's configured
    /// encoding size, to drive the size-mismatch path.
    #[derive(Debug, Clone, PartialEq)]
    struct VarKey(Vec<u8>);

    impl Default for VarKey {
        fn default() -> Self {
            VarKey(vec![0; 4])
        }
    }

    impl Item for VarKey {
        fn size(&self) -> usize {
            self.0.len()
        }

        fn encode(&self, buf: &mut [u8]) {
            buf.copy_from_slice(&self.0);
        }

        fn decode(buf: &[u8]) -> Self {
            VarKey(buf.to_vec())
        }

        fn is_nil(&self) -> bool {
            self.0.iter().all(|b| *b == 0)
        }
    }

    #[test]
    fn mismatched_key_size_is_rejected() {
        let dir = tempdir().unwrap();
        let tree: Tree<VarKey, u32> = Tree::open(
            dir.path().join("tree"),
            TreeOptions {
                page_size: 256,
                read_only: false,
            },
        )
        .unwrap();

        tree.insert(Entry::new(VarKey(vec![0, 0, 0, 1]), 1)).unwrap();

        let oversized = VarKey(vec![1, 2, 3, 4, 5]);
        let err = tree.insert(Entry::new(oversized.clone(), 2)).unwrap_err();
        assert_eq!(
            TreeError::from_report(&err),
            Some(TreeError::InvalidKeySize { required: 4, got: 5 })
        );

        let err = tree.get(&oversized).unwrap_err();
        assert_eq!(
            TreeError::from_report(&err),
            Some(TreeError::InvalidKeySize { required: 4, got: 5 })
        );

        let err = tree.delete(&oversized).unwrap_err();
        assert_eq!(
            TreeError::from_report(&err),
            Some(TreeError::InvalidKeySize { required: 4, got: 5 })
        );

        assert_eq!(tree.count(), 1);
    }
}

mod slab {
    use super::*;

    #[test]
    fn deleting_the_top_slot_needs_no_relocation() {
        let dir = tempdir().unwrap();
        let tree = open_tree(&dir, 256);

        for k in 1..=10u32 {
            tree.insert_mem(Entry::new(k, k)).unwrap();
        }

        // key 10 was inserted last, so its node sits in the topmost slot
        tree.delete_mem(&10).unwrap();
        tree.verify().unwrap();

        let expected: Vec<(u32, u32)> = (1..=9).map(|k| (k, k)).collect();
        assert_eq!(collect(&tree, 0), expected);
    }

    #[test]
    fn deleting_interior_slots_relocates_without_corruption() {
        let dir = tempdir().unwrap();
        let tree = open_tree(&dir, 256);

        for k in 1..=10u32 {
            tree.insert_mem(Entry::new(k, k)).unwrap();
        }

        // free slots from the middle of the slab so the topmost node is
        // relocated each time
        for k in [1u32, 5, 3, 8] {
            tree.delete_mem(&k).unwrap();
            tree.verify().unwrap();
        }

        let expected: Vec<(u32, u32)> = [2u32, 4, 6, 7, 9, 10]
            .iter()
            .map(|k| (*k, *k))
            .collect();
        assert_eq!(collect(&tree, 0), expected);
        assert_eq!(tree.count(), 6);
    }

    #[test]
    fn matched_insert_delete_pairs_return_the_file_to_two_pages() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tree.idx");
        let tree = open_tree(&dir, 256);

        // 256-byte pages hold 12 nodes of 21 bytes; 100 keys plus the
        // sentinel span 9 node pages
        for k in 1..=100u32 {
            tree.insert(Entry::new(k, k)).unwrap();
        }
        let grown = std::fs::metadata(&path).unwrap().len();
        assert!(grown > 2 * 256, "file should have grown, got {grown}");

        for k in (1..=100u32).rev() {
            tree.delete(&k).unwrap();
        }

        assert_eq!(tree.count(), 0);
        tree.verify().unwrap();
        tree.close().unwrap();

        // metadata page + the page holding the null sentinel
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 2 * 256);
    }
}

mod random_ops {
    use super::*;

    #[test]
    fn randomized_sequence_matches_a_shadow_map() {
        let dir = tempdir().unwrap();
        let tree = open_tree(&dir, 256);
        let mut shadow: BTreeMap<u32, u32> = BTreeMap::new();
        let mut rng = rand::rngs::StdRng::seed_from_u64(0xC0FFEE);

        for round in 0..20 {
            for _ in 0..50 {
                let key = rng.random_range(1..400u32);
                if rng.random_bool(0.6) {
                    let val = rng.random_range(0..u32::MAX);
                    let result = tree.insert_mem(Entry::new(key, val));
                    if shadow.contains_key(&key) {
                        assert_eq!(
                            TreeError::from_report(&result.unwrap_err()),
                            Some(TreeError::KeyAlreadyExists)
                        );
                    } else {
                        result.unwrap();
                        shadow.insert(key, val);
                    }
                } else {
                    let result = tree.delete_mem(&key);
                    if shadow.remove(&key).is_some() {
                        result.unwrap();
                    } else {
                        assert_eq!(
                            TreeError::from_report(&result.unwrap_err()),
                            Some(TreeError::NotFound)
                        );
                    }
                }
            }

            tree.verify()
                .unwrap_or_else(|e| panic!("invariants broken in round {round}: {e}"));
            assert_eq!(tree.count() as usize, shadow.len());
        }

        let expected: Vec<(u32, u32)> = shadow.iter().map(|(k, v)| (*k, *v)).collect();
        assert_eq!(collect(&tree, 0), expected);

        for (k, v) in &shadow {
            assert_eq!(tree.get(k).unwrap().val, *v);
        }
    }

    #[test]
    fn shuffled_bulk_insert_scans_in_order() {
        let dir = tempdir().unwrap();
        let tree = open_tree(&dir, 512);
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);

        let mut keys: Vec<u32> = (1..=500).collect();
        keys.shuffle(&mut rng);
        for k in &keys {
            tree.insert_mem(Entry::new(*k, k * 2)).unwrap();
        }

        let scanned = collect(&tree, 0);
        assert_eq!(scanned.len(), 500);
        assert!(scanned.windows(2).all(|w| w[0].0 < w[1].0));
        tree.verify().unwrap();
    }
}

mod concurrency {
    use super::*;

    #[test]
    fn readers_run_alongside_a_writer() {
        let dir = tempdir().unwrap();
        let tree = Arc::new(open_tree(&dir, 512));

        for k in 1..=200u32 {
            tree.insert_mem(Entry::new(k, k)).unwrap();
        }

        thread::scope(|s| {
            for _ in 0..3 {
                let tree = Arc::clone(&tree);
                s.spawn(move || {
                    for _ in 0..50 {
                        let mut last = 0u32;
                        tree.scan(0, |k, _| {
                            assert!(*k > last, "scan went backwards");
                            last = *k;
                            Ok(false)
                        })
                        .unwrap();
                        assert!(tree.count() >= 200);
                    }
                });
            }

            let writer = Arc::clone(&tree);
            s.spawn(move || {
                for k in 201..=400u32 {
                    writer.insert_mem(Entry::new(k, k)).unwrap();
                }
            });
        });

        assert_eq!(tree.count(), 400);
        tree.verify().unwrap();
    }
}
