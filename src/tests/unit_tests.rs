mod aa_tree {
    use std::collections::BTreeSet;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering::Relaxed;
    use std::sync::{Arc, Barrier, Mutex};
    use std::thread;

    use proptest::prelude::*;
    use rand::seq::SliceRandom;

    use crate::{AaTree, WalkOrder};

    static_assertions::assert_impl_all!(AaTree<u64, u64>: Send, Sync);
    static_assertions::assert_impl_all!(AaTree<u64, String>: Send, Sync);
    static_assertions::assert_not_impl_any!(AaTree<u64, *const u64>: Send, Sync);

    fn ordered() -> AaTree<u64, u64> {
        AaTree::new(|key: &u64, entry: &u64| key.cmp(entry), |_| ())
    }

    #[test]
    fn insert_search() {
        let tree = ordered();
        for v in 0..256 {
            assert!(tree.insert(&v, v).is_ok());
        }
        for v in 0..256 {
            assert_eq!(tree.read(&v, |entry| *entry), Some(v));
        }
        assert!(!tree.contains(&256));
        assert_eq!(tree.len(), 256);
        assert!(tree.validate(|a, b| a.cmp(b)).is_ok());
    }

    #[test]
    fn duplicate_insert() {
        let tree = ordered();
        assert!(tree.insert(&11, 11).is_ok());
        assert_eq!(tree.insert(&11, 17), Err(17));
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.read(&11, |entry| *entry), Some(11));
        assert!(tree.validate(|a, b| a.cmp(b)).is_ok());
    }

    #[test]
    fn remove_search() {
        let tree = ordered();
        for v in 0..128 {
            assert!(tree.insert(&v, v).is_ok());
        }
        for v in (0..128).step_by(2) {
            assert!(tree.remove(&v));
        }
        for v in (0..128).step_by(2) {
            assert!(!tree.contains(&v));
            assert!(!tree.remove(&v));
        }
        for v in (1..128).step_by(2) {
            assert!(tree.contains(&v));
        }
        assert_eq!(tree.len(), 64);
        assert!(tree.validate(|a, b| a.cmp(b)).is_ok());
    }

    #[test]
    fn shuffled_insert_remove() {
        let tree = ordered();
        let mut values: Vec<u64> = (0..512).collect();
        values.shuffle(&mut rand::rng());
        for v in &values {
            assert!(tree.insert(v, *v).is_ok());
        }
        assert_eq!(tree.len(), 512);
        assert!(tree.validate(|a, b| a.cmp(b)).is_ok());
        values.shuffle(&mut rand::rng());
        for v in values.iter().take(256) {
            assert!(tree.remove(v));
            assert!(tree.validate(|a, b| a.cmp(b)).is_ok());
        }
        assert_eq!(tree.len(), 256);
        for v in values.iter().skip(256) {
            assert!(tree.contains(v));
        }
    }

    #[test]
    fn walk_orders() {
        let tree = ordered();
        for v in [1, 2, 3] {
            assert!(tree.insert(&v, v).is_ok());
        }
        // The split of `1 -> 2 -> 3` makes `2` the root.
        let mut entries = Vec::new();
        tree.walk(WalkOrder::PreOrder, |entry| entries.push(*entry));
        assert_eq!(entries, [2, 1, 3]);
        entries.clear();
        tree.walk(WalkOrder::InOrder, |entry| entries.push(*entry));
        assert_eq!(entries, [1, 2, 3]);
        entries.clear();
        tree.walk(WalkOrder::PostOrder, |entry| entries.push(*entry));
        assert_eq!(entries, [1, 3, 2]);
    }

    #[test]
    fn in_order_walk_is_sorted() {
        let tree = ordered();
        let mut values: Vec<u64> = (0..300).collect();
        values.shuffle(&mut rand::rng());
        for v in values {
            assert!(tree.insert(&v, v).is_ok());
        }
        let mut entries = Vec::new();
        tree.walk(WalkOrder::InOrder, |entry| entries.push(*entry));
        assert_eq!(entries, (0..300).collect::<Vec<u64>>());
    }

    #[test]
    fn release_on_remove() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        let tree: AaTree<u64, u64> = AaTree::new(
            |key: &u64, entry: &u64| key.cmp(entry),
            move |_| {
                counter.fetch_add(1, Relaxed);
            },
        );
        for v in 0..64 {
            assert!(tree.insert(&v, v).is_ok());
        }
        for v in 0..32 {
            assert!(tree.remove(&v));
        }
        assert_eq!(released.load(Relaxed), 32);
        tree.clear();
        assert_eq!(released.load(Relaxed), 64);
        assert!(tree.is_empty());
        assert!(tree.insert(&0, 0).is_ok());
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn clear_releases_post_order() {
        let released = Arc::new(Mutex::new(Vec::new()));
        let recorder = released.clone();
        let tree: AaTree<u64, u64> = AaTree::new(
            |key: &u64, entry: &u64| key.cmp(entry),
            move |entry| recorder.lock().unwrap().push(*entry),
        );
        for v in [1, 2, 3] {
            assert!(tree.insert(&v, v).is_ok());
        }
        tree.clear();
        // Children go before their parent; `2` is the root.
        assert_eq!(*released.lock().unwrap(), [1, 3, 2]);
    }

    #[test]
    fn drop_releases_all() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        let tree: AaTree<u64, u64> = AaTree::new(
            |key: &u64, entry: &u64| key.cmp(entry),
            move |_| {
                counter.fetch_add(1, Relaxed);
            },
        );
        for v in 0..100 {
            assert!(tree.insert(&v, v).is_ok());
        }
        drop(tree);
        assert_eq!(released.load(Relaxed), 100);
    }

    #[test]
    fn interior_remove_rebalances_successor_path() {
        let tree = ordered();
        for v in 0..999 {
            assert!(tree.insert(&v, v).is_ok());
        }
        // Removing every third key keeps hitting nodes with two children,
        // so the entry moves over from the in-order successor.
        for v in 0..333 {
            assert!(tree.remove(&(v * 3 + 1)));
            assert!(tree.validate(|a, b| a.cmp(b)).is_ok());
        }
        assert_eq!(tree.len(), 666);
        for v in 0..333 {
            assert!(!tree.contains(&(v * 3 + 1)));
            assert!(tree.contains(&(v * 3)));
            assert!(tree.contains(&(v * 3 + 2)));
        }
    }

    #[test]
    fn depth_stays_logarithmic() {
        let tree = ordered();
        for v in 0..1024 {
            assert!(tree.insert(&v, v).is_ok());
        }
        // A node at level `L` roots at least `2^L - 1` nodes, and the
        // longest path holds at most two nodes per level.
        assert!((6..=10).contains(&tree.depth()));
        assert!(tree.validate(|a, b| a.cmp(b)).is_ok());
    }

    #[test]
    fn concurrent_disjoint_insert() {
        let num_threads = 4;
        let tree: Arc<AaTree<u64, u64>> = Arc::new(ordered());
        let barrier = Arc::new(Barrier::new(num_threads));
        let mut handles = Vec::with_capacity(num_threads);
        for thread_id in 0..num_threads as u64 {
            let tree = tree.clone();
            let barrier = barrier.clone();
            handles.push(thread::spawn(move || {
                barrier.wait();
                for v in (thread_id * 1000)..(thread_id * 1000 + 100) {
                    assert!(tree.insert(&v, v).is_ok());
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(tree.len(), 400);
        for thread_id in 0..num_threads as u64 {
            for v in (thread_id * 1000)..(thread_id * 1000 + 100) {
                assert_eq!(tree.read(&v, |entry| *entry), Some(v));
            }
        }
        assert!(tree.validate(|a, b| a.cmp(b)).is_ok());
    }

    #[test]
    fn search_never_misses_present_keys() {
        let num_inserters = 4;
        let num_searchers = 2;
        let tree: Arc<AaTree<u64, u64>> = Arc::new(ordered());
        for v in 0..100 {
            assert!(tree.insert(&v, v).is_ok());
        }
        let barrier = Arc::new(Barrier::new(num_inserters + num_searchers));
        let mut handles = Vec::with_capacity(num_inserters + num_searchers);
        for thread_id in 0..num_inserters as u64 {
            let tree = tree.clone();
            let barrier = barrier.clone();
            handles.push(thread::spawn(move || {
                barrier.wait();
                for v in (1000 + thread_id * 1000)..(1000 + thread_id * 1000 + 100) {
                    assert!(tree.insert(&v, v).is_ok());
                }
            }));
        }
        for _ in 0..num_searchers {
            let tree = tree.clone();
            let barrier = barrier.clone();
            handles.push(thread::spawn(move || {
                barrier.wait();
                for _ in 0..64 {
                    for v in 0..100 {
                        assert!(tree.contains(&v));
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(tree.len(), 500);
        assert!(tree.validate(|a, b| a.cmp(b)).is_ok());
    }

    #[test]
    fn concurrent_insert_remove() {
        let tree: Arc<AaTree<u64, u64>> = Arc::new(ordered());
        for v in 0..200 {
            assert!(tree.insert(&v, v).is_ok());
        }
        let barrier = Arc::new(Barrier::new(3));
        let mut handles = Vec::with_capacity(3);
        for range in [0..100_u64, 100..200_u64] {
            let tree = tree.clone();
            let barrier = barrier.clone();
            handles.push(thread::spawn(move || {
                barrier.wait();
                for v in range {
                    assert!(tree.remove(&v));
                }
            }));
        }
        {
            let tree = tree.clone();
            let barrier = barrier.clone();
            handles.push(thread::spawn(move || {
                barrier.wait();
                for v in 1000..1100 {
                    assert!(tree.insert(&v, v).is_ok());
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(tree.len(), 100);
        for v in 0..200 {
            assert!(!tree.contains(&v));
        }
        for v in 1000..1100 {
            assert!(tree.contains(&v));
        }
        assert!(tree.validate(|a, b| a.cmp(b)).is_ok());
    }

    #[test]
    fn mixed_workload_releases_each_entry_once() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        let tree: Arc<AaTree<u64, u64>> = Arc::new(AaTree::new(
            |key: &u64, entry: &u64| key.cmp(entry),
            move |_| {
                counter.fetch_add(1, Relaxed);
            },
        ));
        for v in 0..400 {
            assert!(tree.insert(&v, v).is_ok());
        }
        for v in 10_000..10_100 {
            assert!(tree.insert(&v, v).is_ok());
        }
        let barrier = Arc::new(Barrier::new(5));
        let mut handles = Vec::with_capacity(5);
        for range in [0..200_u64, 200..400_u64] {
            let tree = tree.clone();
            let barrier = barrier.clone();
            handles.push(thread::spawn(move || {
                barrier.wait();
                for v in range {
                    assert!(tree.remove(&v));
                }
            }));
        }
        for base in [1000_u64, 2000_u64] {
            let tree = tree.clone();
            let barrier = barrier.clone();
            handles.push(thread::spawn(move || {
                barrier.wait();
                for v in base..base + 350 {
                    assert!(tree.insert(&v, v).is_ok());
                }
            }));
        }
        {
            let tree = tree.clone();
            let barrier = barrier.clone();
            handles.push(thread::spawn(move || {
                barrier.wait();
                for _ in 0..64 {
                    for v in 10_000..10_100 {
                        assert!(tree.contains(&v));
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(released.load(Relaxed), 400);
        assert_eq!(tree.len(), 800);
        assert!(tree.validate(|a, b| a.cmp(b)).is_ok());
        tree.clear();
        assert_eq!(released.load(Relaxed), 1200);
        assert!(tree.is_empty());
    }

    #[test]
    fn clear_concurrent_insert() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        let tree: Arc<AaTree<u64, u64>> = Arc::new(AaTree::new(
            |key: &u64, entry: &u64| key.cmp(entry),
            move |_| {
                counter.fetch_add(1, Relaxed);
            },
        ));
        for v in 0..256 {
            assert!(tree.insert(&v, v).is_ok());
        }
        let barrier = Arc::new(Barrier::new(2));
        let inserter = {
            let tree = tree.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                for v in 1000..1256 {
                    assert!(tree.insert(&v, v).is_ok());
                }
            })
        };
        barrier.wait();
        tree.clear();
        inserter.join().unwrap();
        // Whatever the interleaving, every inserted entry is either still
        // in the tree or has been released, never both and never neither.
        let remaining = tree.len();
        assert_eq!(released.load(Relaxed) + remaining, 512);
        assert!(tree.validate(|a, b| a.cmp(b)).is_ok());
        tree.clear();
        assert_eq!(released.load(Relaxed), 512);
        assert!(tree.is_empty());
    }

    proptest! {
        #[test]
        fn model_check(ops in proptest::collection::vec((any::<bool>(), 0_u64..64), 1..256)) {
            let tree = ordered();
            let mut model = BTreeSet::new();
            for (insert, key) in ops {
                if insert {
                    prop_assert_eq!(tree.insert(&key, key).is_ok(), model.insert(key));
                } else {
                    prop_assert_eq!(tree.remove(&key), model.remove(&key));
                }
                prop_assert!(tree.validate(|a, b| a.cmp(b)).is_ok());
            }
            for key in 0..64 {
                prop_assert_eq!(tree.contains(&key), model.contains(&key));
            }
            prop_assert_eq!(tree.len(), model.len());
        }
    }
}

#[cfg(feature = "serde")]
mod serde {
    use serde_test::{assert_ser_tokens, Token};

    use crate::AaTree;

    #[test]
    fn serialize_in_order() {
        let tree: AaTree<u64, u64> = AaTree::new(|key: &u64, entry: &u64| key.cmp(entry), |_| ());
        for v in [3, 1, 2] {
            assert!(tree.insert(&v, v).is_ok());
        }
        assert_ser_tokens(
            &tree,
            &[
                Token::Seq { len: Some(3) },
                Token::U64(1),
                Token::U64(2),
                Token::U64(3),
                Token::SeqEnd,
            ],
        );
    }
}
