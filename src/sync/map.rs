use super::{iter::Iter, segment::Segment};
use crate::common::{self, error::TryInsertError, hash, hash::DefaultHashBuilder};

use crossbeam_utils::CachePadded;
use std::{
    borrow::Borrow,
    fmt,
    hash::{BuildHasher, Hash},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

/// A thread-safe hash map with multiple internal segments.
///
/// `SegmentedMap` routes every key to one of its segments (64 by default)
/// using the most significant bits of the key's hash, so that unrelated
/// keys contend on nothing. Within a segment, buckets are single 64-bit
/// words packing a fingerprint, probe distance, liveness flags and an
/// entry-store index; inserts and erases transition them with
/// compare-and-swap, and the segment's reader/writer lock is only taken
/// exclusively while that segment resizes.
///
/// Unlike [`unsync::DenseMap`](crate::unsync::DenseMap), the concurrent
/// variant probes strictly linearly (no Robin Hood displacement) and its
/// entry store is append-only: erased entries are marked dead in place and
/// reclaimed by the next resize of their segment.
///
/// Reads are guaranteed to observe every operation that completed before
/// they began. An operation racing a concurrent insert of the same key may
/// miss it; linearizability is only promised with respect to fully
/// completed operations. [`len`](SegmentedMap::len) is an eventually
/// consistent aggregate that can transiently disagree with the per-segment
/// state during concurrent mutation.
///
/// # Examples
///
/// ```rust
/// use densemap::sync::SegmentedMap;
///
/// let map = SegmentedMap::new();
///
/// std::thread::scope(|s| {
///     for t in 0..4u64 {
///         let map = map.clone();
///         s.spawn(move || {
///             for i in (t * 250)..((t + 1) * 250) {
///                 assert!(map.insert(i, i * 2));
///             }
///         });
///     }
/// });
///
/// assert_eq!(map.len(), 1000);
/// assert_eq!(map.get(&123), Some(246));
/// assert_eq!(map.remove(&123), Some(246));
/// assert!(!map.contains_key(&123));
/// ```
pub struct SegmentedMap<K, V, S = DefaultHashBuilder> {
    inner: Arc<Inner<K, V, S>>,
}

struct Inner<K, V, S> {
    segments: Box<[CachePadded<Segment<K, V>>]>,
    build_hasher: S,
    len: AtomicUsize,
    segment_shift: u32,
}

impl<K, V, S> Clone for SegmentedMap<K, V, S> {
    /// Makes a clone of this shared map.
    ///
    /// This operation is cheap: it only creates a thread-safe reference
    /// counted pointer to the shared internal data structures.
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> SegmentedMap<K, V, DefaultHashBuilder> {
    /// Creates an empty `SegmentedMap` with the default number of segments
    /// (64), each starting at the default capacity.
    pub fn new() -> Self {
        Self::with_num_segments_capacity_and_hasher(
            common::DEFAULT_NUM_SEGMENTS,
            0,
            DefaultHashBuilder::default(),
        )
    }

    /// Creates an empty `SegmentedMap` with the specified number of
    /// segments, rounded up to the next power of two.
    ///
    /// # Panics
    ///
    /// Panics if `num_segments` is 0.
    pub fn with_num_segments(num_segments: usize) -> Self {
        Self::with_num_segments_capacity_and_hasher(
            num_segments,
            0,
            DefaultHashBuilder::default(),
        )
    }

    /// Creates an empty `SegmentedMap` sized to hold at least `capacity`
    /// entries across its segments without resizing.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_num_segments_capacity_and_hasher(
            common::DEFAULT_NUM_SEGMENTS,
            capacity,
            DefaultHashBuilder::default(),
        )
    }
}

impl<K, V, S> SegmentedMap<K, V, S> {
    /// Creates an empty `SegmentedMap` using `build_hasher` to hash the
    /// keys.
    pub fn with_hasher(build_hasher: S) -> Self {
        Self::with_num_segments_capacity_and_hasher(common::DEFAULT_NUM_SEGMENTS, 0, build_hasher)
    }

    /// Creates an empty `SegmentedMap` with the specified number of
    /// segments and total capacity, using `build_hasher` to hash the keys.
    ///
    /// # Panics
    ///
    /// Panics if `num_segments` is 0.
    pub fn with_num_segments_capacity_and_hasher(
        num_segments: usize,
        capacity: usize,
        build_hasher: S,
    ) -> Self {
        assert!(num_segments > 0);

        let actual_num_segments = num_segments.next_power_of_two();
        let segment_shift = 64 - actual_num_segments.trailing_zeros();
        let per_segment =
            common::slots_for((capacity + actual_num_segments - 1) / actual_num_segments);

        let segments = (0..actual_num_segments)
            .map(|_| CachePadded::new(Segment::with_capacity(per_segment)))
            .collect();

        Self {
            inner: Arc::new(Inner {
                segments,
                build_hasher,
                len: AtomicUsize::new(0),
                segment_shift,
            }),
        }
    }

    /// Returns the number of entries in the map.
    ///
    /// The count is an eventually consistent aggregate maintained
    /// independently of the per-segment structures; a snapshot taken
    /// during concurrent mutation can transiently disagree with the sum of
    /// live entries.
    pub fn len(&self) -> usize {
        self.inner.len.load(Ordering::Relaxed)
    }

    /// Returns `true` if the map contains no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of segments in the map.
    pub fn num_segments(&self) -> usize {
        self.inner.segments.len()
    }

    /// A weakly consistent iterator yielding cloned key-value pairs. See
    /// [`Iter`] for the exact guarantees.
    pub fn iter(&self) -> Iter<'_, K, V, S>
    where
        K: Clone,
        V: Clone,
    {
        Iter::new(self)
    }

    pub(super) fn scan_segment(&self, segment_index: usize, start: usize) -> Option<(usize, (K, V))>
    where
        K: Clone,
        V: Clone,
    {
        self.inner.segments[segment_index].scan_from(start)
    }
}

impl<K, V, S> SegmentedMap<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    /// Inserts a key-value pair into the map, unless the key is already
    /// present. Returns `true` if this call inserted the pair.
    ///
    /// Returns `false` and drops the pair when the key is present or when
    /// the target segment's probe bound is exhausted; use
    /// [`try_insert`](SegmentedMap::try_insert) to tell the two apart.
    pub fn insert(&self, key: K, value: V) -> bool {
        self.try_insert(key, value).is_ok()
    }

    /// Inserts a key-value pair into the map, unless the key is already
    /// present, distinguishing the failure reasons.
    ///
    /// `Err(TryInsertError::CapacityExhausted)` reports that the segment's
    /// probe bound or entry store ran out before a bucket could be
    /// claimed. The map does not resize on that path; the caller may
    /// retry.
    pub fn try_insert(&self, key: K, value: V) -> Result<(), TryInsertError> {
        let (segment, hash, fingerprint) = self.segment_for(&key);
        segment.insert(&self.inner.build_hasher, hash, fingerprint, key, value)?;
        self.inner.len.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Returns a clone of the value corresponding to the key.
    ///
    /// The key may be any borrowed form of the map's key type, but
    /// [`Hash`] and [`Eq`] on the borrowed form *must* match those for the
    /// key type.
    pub fn get<Q: Hash + Eq + ?Sized>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        V: Clone,
    {
        self.get_and(key, |_, value| value.clone())
    }

    /// Returns a clone of the key-value pair corresponding to the key.
    pub fn get_key_value<Q: Hash + Eq + ?Sized>(&self, key: &Q) -> Option<(K, V)>
    where
        K: Borrow<Q> + Clone,
        V: Clone,
    {
        self.get_and(key, |slot_key, value| (slot_key.clone(), value.clone()))
    }

    /// Returns the result of invoking a function with a reference to the
    /// key-value pair corresponding to the key. Useful when the value is
    /// expensive to clone or only partially needed.
    pub fn get_and<Q: Hash + Eq + ?Sized, F: FnOnce(&K, &V) -> T, T>(
        &self,
        key: &Q,
        with_entry: F,
    ) -> Option<T>
    where
        K: Borrow<Q>,
    {
        let (segment, hash, fingerprint) = self.segment_for(key);
        segment.get_and(hash, fingerprint, key, with_entry)
    }

    /// Returns `true` if the map contains a value for the specified key.
    pub fn contains_key<Q: Hash + Eq + ?Sized>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
    {
        self.get_and(key, |_, _| ()).is_some()
    }

    /// Removes a key from the map, returning a clone of the value
    /// previously corresponding to the key.
    pub fn remove<Q: Hash + Eq + ?Sized>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        V: Clone,
    {
        self.remove_and(key, |_, value| value.clone())
    }

    /// Removes a key from the map, returning the result of invoking a
    /// function with a reference to the erased key-value pair.
    pub fn remove_and<Q: Hash + Eq + ?Sized, F: FnOnce(&K, &V) -> T, T>(
        &self,
        key: &Q,
        with_entry: F,
    ) -> Option<T>
    where
        K: Borrow<Q>,
    {
        let (segment, hash, fingerprint) = self.segment_for(key);
        let result = segment.remove_and(hash, fingerprint, key, with_entry);
        if result.is_some() {
            self.inner.len.fetch_sub(1, Ordering::Relaxed);
        }
        result
    }

    /// Selects the segment for `key` from the top bits of its adjusted
    /// hash. The bucket index within the segment uses the low bits, so the
    /// two stay independent.
    fn segment_for<Q: Hash + ?Sized>(&self, key: &Q) -> (&Segment<K, V>, u64, u8) {
        let (hash, fingerprint) = hash::adjust(hash::hash(&self.inner.build_hasher, key));
        let index = if self.inner.segment_shift == 64 {
            0
        } else {
            (hash >> self.inner.segment_shift) as usize
        };
        let segment: &Segment<K, V> = &self.inner.segments[index];
        (segment, hash, fingerprint)
    }
}

impl<K, V> Default for SegmentedMap<K, V, DefaultHashBuilder> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S> fmt::Debug for SegmentedMap<K, V, S>
where
    K: fmt::Debug + Clone,
    V: fmt::Debug + Clone,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d_map = f.debug_map();

        for (k, v) in self.iter() {
            d_map.entry(&k, &v);
        }

        d_map.finish()
    }
}

impl<'a, K, V, S> IntoIterator for &'a SegmentedMap<K, V, S>
where
    K: Clone,
    V: Clone,
{
    type Item = (K, V);
    type IntoIter = Iter<'a, K, V, S>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::SegmentedMap;
    use crate::common::error::TryInsertError;
    use std::hash::{BuildHasher, Hasher};

    /// Every key hashes to 1: one segment, one ideal slot, maximal
    /// clustering.
    #[derive(Clone, Default)]
    struct Constant;

    struct ConstantHasher;

    impl BuildHasher for Constant {
        type Hasher = ConstantHasher;

        fn build_hasher(&self) -> ConstantHasher {
            ConstantHasher
        }
    }

    impl Hasher for ConstantHasher {
        fn write(&mut self, _bytes: &[u8]) {}

        fn finish(&self) -> u64 {
            1
        }
    }

    /// Forces every hash's low byte to zero, exercising the fingerprint
    /// re-mix path on each operation.
    #[derive(Clone, Default)]
    struct ZeroLowByte;

    struct ZeroLowByteHasher(std::collections::hash_map::DefaultHasher);

    impl BuildHasher for ZeroLowByte {
        type Hasher = ZeroLowByteHasher;

        fn build_hasher(&self) -> ZeroLowByteHasher {
            ZeroLowByteHasher(Default::default())
        }
    }

    impl Hasher for ZeroLowByteHasher {
        fn write(&mut self, bytes: &[u8]) {
            self.0.write(bytes);
        }

        fn finish(&self) -> u64 {
            self.0.finish() << 8
        }
    }

    #[test]
    fn round_trip() {
        let map = SegmentedMap::new();

        assert!(map.is_empty());
        assert!(map.insert("foo", 5));
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("foo"), Some(5));
        assert!(map.contains_key("foo"));
        assert_eq!(map.get_key_value("foo"), Some(("foo", 5)));
        assert_eq!(map.get_and("foo", |_, v| v * 10), Some(50));

        assert_eq!(map.remove("foo"), Some(5));
        assert!(map.is_empty());
        assert!(!map.contains_key("foo"));
    }

    #[test]
    fn no_duplicate_insert() {
        let map = SegmentedMap::new();

        assert!(map.insert("a", 1));
        assert!(!map.insert("a", 9));
        assert_eq!(map.try_insert("a", 9), Err(TryInsertError::AlreadyPresent));
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("a"), Some(1));
    }

    #[test]
    fn erase_absent_key_is_noop() {
        let map = SegmentedMap::new();
        map.insert(1u64, "one");

        assert_eq!(map.remove(&2), None);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn numeric_scenario() {
        let map = SegmentedMap::new();

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
    fn string_scenario() {
        let map = SegmentedMap::new();
        map.insert("apple".to_string(), 1);
        map.insert("banana".to_string(), 2);
        map.insert("cherry".to_string(), 3);

        assert_eq!(map.remove("apple"), Some(1));
        assert_eq!(map.len(), 2);
        assert!(!map.contains_key("apple"));
        assert_eq!(map.get("banana"), Some(2));
    }

    #[test]
    fn growth_keeps_entries_findable() {
        let map = SegmentedMap::with_num_segments(4);

        for i in 0..10_000u64 {
            assert!(map.insert(i, i.wrapping_mul(31)));
        }

        assert_eq!(map.len(), 10_000);
        for i in 0..10_000u64 {
            assert_eq!(map.get(&i), Some(i.wrapping_mul(31)), "key {i} lost");
        }
    }

    #[test]
    fn resize_reclaims_dead_slots() {
        let map = SegmentedMap::with_num_segments(1);

        // Insert/erase churn consumes store slots; the load-factor resize
        // must compact them away instead of failing.
        for round in 0..50u64 {
            for i in 0..100u64 {
                let key = round * 100 + i;
                assert!(map.insert(key, key), "insert failed in round {round}");
            }
            for i in 0..100u64 {
                let key = round * 100 + i;
                assert_eq!(map.remove(&key), Some(key));
            }
        }

        assert_eq!(map.len(), 0);
    }

    #[test]
    fn zero_fingerprint_guard() {
        let map = SegmentedMap::with_hasher(ZeroLowByte);

        for i in 0..100u32 {
            assert!(map.insert(format!("key-{i}"), i));
        }

        for i in 0..100u32 {
            assert_eq!(map.get(format!("key-{i}").as_str()), Some(i));
        }

        assert_eq!(map.remove("key-7"), Some(7));
        assert!(!map.contains_key("key-7"));
        assert_eq!(map.len(), 99);
    }

    #[test]
    fn tombstone_ahead_of_key_does_not_duplicate() {
        let map = SegmentedMap::with_hasher(Constant);

        // One cluster; erasing its head leaves a tombstone in front of the
        // probe path of every later key.
        map.insert("head", 0);
        map.insert("mid", 1);
        map.insert("tail", 2);
        assert_eq!(map.remove("head"), Some(0));

        assert_eq!(
            map.try_insert("tail", 9),
            Err(TryInsertError::AlreadyPresent)
        );
        assert_eq!(map.len(), 2);
        assert_eq!(map.get("tail"), Some(2));

        // The tombstone is reusable for a genuinely new key.
        assert!(map.insert("new", 3));
        assert_eq!(map.get("mid"), Some(1));
        assert_eq!(map.get("new"), Some(3));
    }

    #[test]
    fn probe_bound_exhaustion_surfaces_as_error() {
        let map = SegmentedMap::with_hasher(Constant);

        // Identical hashes put every key in one cluster; the probe bound
        // caps it at 255 entries, and the 256th insert must report
        // exhaustion rather than loop or resize.
        for i in 0..255u32 {
            assert_eq!(map.try_insert(i, i), Ok(()), "insert {i} failed");
        }
        assert_eq!(
            map.try_insert(255u32, 255),
            Err(TryInsertError::CapacityExhausted)
        );
        assert!(!map.insert(255u32, 255));
        assert_eq!(map.len(), 255);

        for i in 0..255u32 {
            assert_eq!(map.get(&i), Some(i));
        }

        // Erasing makes the cluster claimable again.
        assert_eq!(map.remove(&0), Some(0));
        assert_eq!(map.try_insert(255u32, 255), Ok(()));
        assert_eq!(map.get(&255), Some(255));
    }

    #[test]
    fn concurrent_disjoint_inserts() {
        const THREADS: u64 = 8;
        const PER_THREAD: u64 = 2_000;

        let map = SegmentedMap::new();

        std::thread::scope(|s| {
            for t in 0..THREADS {
                let map = map.clone();
                s.spawn(move || {
                    for i in (t * PER_THREAD)..((t + 1) * PER_THREAD) {
                        assert!(map.insert(i, i * 2));
                    }
                });
            }
        });

        assert_eq!(map.len(), (THREADS * PER_THREAD) as usize);
        for i in 0..(THREADS * PER_THREAD) {
            assert_eq!(map.get(&i), Some(i * 2), "key {i} lost");
        }
    }

    #[test]
    fn concurrent_same_key_inserts_keep_one_winner() {
        let map = SegmentedMap::new();

        std::thread::scope(|s| {
            for _ in 0..8 {
                let map = map.clone();
                s.spawn(move || {
                    map.insert("contended", 7);
                });
            }
        });

        assert_eq!(map.get("contended"), Some(7));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn concurrent_insert_erase_churn() {
        const THREADS: u64 = 4;
        const PER_THREAD: u64 = 1_000;

        let map = SegmentedMap::new();

        std::thread::scope(|s| {
            for t in 0..THREADS {
                let map = map.clone();
                s.spawn(move || {
                    for i in (t * PER_THREAD)..((t + 1) * PER_THREAD) {
                        assert!(map.insert(i, i));
                    }
                    for i in (t * PER_THREAD)..((t + 1) * PER_THREAD) {
                        assert_eq!(map.remove(&i), Some(i));
                    }
                });
            }
        });

        assert_eq!(map.len(), 0);
        for i in 0..(THREADS * PER_THREAD) {
            assert_eq!(map.get(&i), None);
        }
    }

    #[test]
    fn erase_is_visible_across_threads() {
        let map = SegmentedMap::new();
        map.insert("shared", 1);

        std::thread::scope(|s| {
            let map = map.clone();
            s.spawn(move || {
                assert_eq!(map.remove("shared"), Some(1));
            });
        });

        assert_eq!(map.get("shared"), None);
        assert_eq!(map.len(), 0);
    }

    #[test]
    fn weak_iteration_sees_settled_state() {
        let map = SegmentedMap::new();
        for i in 0..500u64 {
            map.insert(i, i * 3);
        }
        for i in (0..500u64).step_by(5) {
            map.remove(&i);
        }

        let mut pairs: Vec<_> = map.iter().collect();
        pairs.sort_unstable();

        let expected: Vec<_> = (0..500u64).filter(|i| i % 5 != 0).map(|i| (i, i * 3)).collect();
        assert_eq!(pairs, expected);

        // IntoIterator for &map agrees.
        assert_eq!((&map).into_iter().count(), expected.len());
    }

    #[test]
    fn segment_count_rounds_to_power_of_two() {
        let map: SegmentedMap<u64, u64> = SegmentedMap::with_num_segments(5);
        assert_eq!(map.num_segments(), 8);

        let map: SegmentedMap<u64, u64> = SegmentedMap::new();
        assert_eq!(map.num_segments(), 64);
    }

    #[test]
    fn with_capacity_bulk_load() {
        let map: SegmentedMap<u64, u64> = SegmentedMap::with_capacity(10_000);

        for i in 0..10_000u64 {
            assert!(map.insert(i, i));
        }
        assert_eq!(map.len(), 10_000);
    }

    #[test]
    fn values_do_not_need_clone_for_closure_reads() {
        // A value type without `Clone`.
        struct Opaque(u64);

        let map = SegmentedMap::new();
        map.insert("k", Opaque(9));

        assert_eq!(map.get_and("k", |_, v| v.0), Some(9));
        assert_eq!(map.remove_and("k", |_, v| v.0), Some(9));
        assert!(!map.contains_key("k"));
    }

    #[test]
    fn debug_formats_entries() {
        let map = SegmentedMap::new();
        map.insert("a", 1);

        assert_eq!(format!("{map:?}"), r#"{"a": 1}"#);
    }
}
