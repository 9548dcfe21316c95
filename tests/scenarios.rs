//! End-to-end scenarios exercising both map variants through the public
//! API only.

use densemap::sync::SegmentedMap;
use densemap::unsync::DenseMap;

#[test]
fn dense_map_lifecycle() {
    let mut map = DenseMap::new();

    for i in 0..100u64 {
        let (value, inserted) = map.try_insert(i, i * 2);
        assert_eq!(*value, i * 2);
        assert!(inserted);
    }

    assert_eq!(map.len(), 100);
    assert_eq!(map.get(&12), Some(&24));

    for i in 25..30u64 {
        assert_eq!(map.remove(&i), Some(i * 2));
    }

    assert_eq!(map.len(), 95);
    assert_eq!(map.get(&27), None);
    assert_eq!(map.get(&50), Some(&100));

    // Every surviving key round-trips through iteration as well.
    let mut seen: Vec<_> = map.iter().map(|(k, v)| (*k, *v)).collect();
    seen.sort_unstable();
    let expected: Vec<_> = (0..100u64)
        .filter(|i| !(25..30).contains(i))
        .map(|i| (i, i * 2))
        .collect();
    assert_eq!(seen, expected);
}

#[test]
fn dense_map_with_custom_hasher() {
    // A faster, non-default hasher slots in through the constructor
    // family without any behavioral change.
    let mut map = DenseMap::with_hasher(ahash::RandomState::new());

    map.insert_batch([("apple", 1), ("banana", 2), ("cherry", 3)]);

    assert_eq!(map.remove("apple"), Some(1));
    assert_eq!(map.len(), 2);
    assert!(!map.contains_key("apple"));
    assert_eq!(map.get("banana"), Some(&2));
    assert_eq!(map["cherry"], 3);
}

#[test]
fn segmented_map_lifecycle() {
    let map = SegmentedMap::with_hasher(ahash::RandomState::new());

    for i in 0..100u64 {
        assert!(map.insert(i, i * 2));
    }
    assert_eq!(map.get(&12), Some(24));

    for i in 25..30u64 {
        assert_eq!(map.remove(&i), Some(i * 2));
    }

    assert_eq!(map.len(), 95);
    assert_eq!(map.get(&27), None);
    assert_eq!(map.get(&50), Some(100));
}

#[test]
fn segmented_map_parallel_smoke() {
    const THREADS: u64 = 8;
    const PER_THREAD: u64 = 5_000;

    let map = SegmentedMap::new();

    std::thread::scope(|s| {
        // Disjoint writers and one reader that continuously samples keys
        // that are never erased.
        for t in 0..THREADS {
            let map = map.clone();
            s.spawn(move || {
                for i in (t * PER_THREAD)..((t + 1) * PER_THREAD) {
                    assert!(map.insert(i, i.wrapping_mul(7)));
                }
            });
        }

        let reader = map.clone();
        s.spawn(move || {
            for _ in 0..1_000 {
                if let Some(value) = reader.get(&0) {
                    assert_eq!(value, 0);
                }
            }
        });
    });

    assert_eq!(map.len(), (THREADS * PER_THREAD) as usize);
    for i in 0..(THREADS * PER_THREAD) {
        assert_eq!(map.get(&i), Some(i.wrapping_mul(7)));
    }
}
