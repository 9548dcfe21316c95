use super::iter::{IntoIter, Iter, IterMut};
use crate::common::{
    self,
    bucket::Bucket,
    hash::{self, DefaultHashBuilder},
    MAX_PROBE_DISTANCE,
};

use std::{
    borrow::Borrow,
    fmt,
    hash::{BuildHasher, Hash},
    mem,
    ops::Index,
};

/// One owned key-value pair in the dense entry store.
#[derive(Clone)]
pub(crate) struct Entry<K, V> {
    pub(crate) key: K,
    pub(crate) value: V,
}

/// A hash map that is _not_ thread-safe.
///
/// `DenseMap` stores its key-value pairs contiguously in a gap-free entry
/// store and keeps a separate bucket table of compact metadata: an 8-bit
/// fingerprint for fast rejection, the Robin Hood probe distance, and the
/// index of the entry the bucket denotes. Collisions are resolved with
/// Robin Hood open addressing: an insert displaces a resident whose probe
/// distance is shorter than its own, which bounds the variance of probe
/// lengths. Erasing swaps the last entry into the vacated store slot, so
/// the store stays dense and iteration runs at array speed.
///
/// Inserting never overwrites: [`try_insert`](DenseMap::try_insert) returns
/// the already-present value instead, mirroring the lookup contract. The
/// table doubles its bucket capacity whenever the load factor would exceed
/// 0.75; capacity never shrinks.
///
/// # Examples
///
/// ```rust
/// use densemap::unsync::DenseMap;
///
/// let mut map = DenseMap::new();
///
/// for i in 0..100u64 {
///     map.try_insert(i, i * 2);
/// }
///
/// assert_eq!(map.len(), 100);
/// assert_eq!(map.get(&12), Some(&24));
///
/// for i in 25..30u64 {
///     map.remove(&i);
/// }
///
/// assert_eq!(map.len(), 95);
/// assert_eq!(map.get(&27), None);
/// assert_eq!(map.get(&50), Some(&100));
/// ```
///
/// The hashing algorithm can be replaced on a per-map basis with the
/// [`with_hasher`](DenseMap::with_hasher) and
/// [`with_capacity_and_hasher`](DenseMap::with_capacity_and_hasher)
/// constructors.
pub struct DenseMap<K, V, S = DefaultHashBuilder> {
    buckets: Box<[Bucket]>,
    entries: Vec<Entry<K, V>>,
    build_hasher: S,
}

impl<K, V> DenseMap<K, V, DefaultHashBuilder> {
    /// Creates an empty `DenseMap` with the default initial capacity of 16
    /// bucket slots.
    pub fn new() -> Self {
        Self::with_hasher(DefaultHashBuilder::default())
    }

    /// Creates an empty `DenseMap` sized to hold at least `capacity`
    /// entries without growing.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_and_hasher(capacity, DefaultHashBuilder::default())
    }
}

impl<K, V, S> DenseMap<K, V, S> {
    /// Creates an empty `DenseMap` using `build_hasher` to hash the keys.
    pub fn with_hasher(build_hasher: S) -> Self {
        Self {
            buckets: vec![Bucket::EMPTY; common::INITIAL_CAPACITY].into_boxed_slice(),
            entries: Vec::new(),
            build_hasher,
        }
    }

    /// Creates an empty `DenseMap` sized to hold at least `capacity`
    /// entries without growing, using `build_hasher` to hash the keys.
    pub fn with_capacity_and_hasher(capacity: usize, build_hasher: S) -> Self {
        Self {
            buckets: vec![Bucket::EMPTY; common::slots_for(capacity)].into_boxed_slice(),
            entries: Vec::with_capacity(capacity),
            build_hasher,
        }
    }

    /// Returns the number of entries in the map.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the map contains no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the number of bucket slots the map currently holds.
    pub fn capacity(&self) -> usize {
        self.buckets.len()
    }

    /// An iterator visiting all entries in storage order, which is
    /// insertion order until an erase compacts the store.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter::new(&self.entries)
    }

    /// An iterator visiting all entries in storage order, with mutable
    /// references to the values.
    pub fn iter_mut(&mut self) -> IterMut<'_, K, V> {
        IterMut::new(&mut self.entries)
    }

    /// Removes all entries. The bucket capacity is retained.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.buckets.fill(Bucket::EMPTY);
    }
}

impl<K, V, S> DenseMap<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    /// Inserts a key-value pair into the map, unless the key is already
    /// present.
    ///
    /// Returns a reference to the value now associated with the key, and
    /// `true` if this call inserted it. When the key was already present
    /// the existing value is kept, `value` is dropped, and `false` is
    /// returned.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use densemap::unsync::DenseMap;
    ///
    /// let mut map = DenseMap::new();
    ///
    /// assert_eq!(map.try_insert("a", 1), (&mut 1, true));
    /// assert_eq!(map.try_insert("a", 7), (&mut 1, false));
    /// assert_eq!(map.len(), 1);
    /// ```
    pub fn try_insert(&mut self, key: K, value: V) -> (&mut V, bool) {
        // Establish absence before placing. The placement probe claims the
        // first vacated slot it sees, and a tombstone on the key's probe
        // chain may sit in front of the key itself; claiming it blindly
        // would resurrect the key as a duplicate.
        if let Some((_, index)) = self.find_index(&key) {
            return (&mut self.entries[index].value, false);
        }

        if common::needs_grow(self.entries.len(), self.buckets.len()) {
            self.grow(self.buckets.len() * 2);
        }

        let mut pair = (key, value);
        // Entry index the caller's pair lands in; set by the first Robin
        // Hood displacement, which survives forced rehashes because the
        // rebuild keeps entry indices stable.
        let mut claimed = None;

        loop {
            match self.place_pair(pair, &mut claimed) {
                Ok(index) => {
                    return (&mut self.entries[index].value, true);
                }
                Err(displaced) => {
                    // Probe bound exhausted. Double the table and retry
                    // with whichever pair is still homeless.
                    pair = displaced;
                    self.grow(self.buckets.len() * 2);
                }
            }
        }
    }

    /// Returns a reference to the value corresponding to the key.
    ///
    /// The key may be any borrowed form of the map's key type, but
    /// [`Hash`] and [`Eq`] on the borrowed form *must* match those for the
    /// key type.
    pub fn get<Q: Hash + Eq + ?Sized>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
    {
        let (_, index) = self.find_index(key)?;
        Some(&self.entries[index].value)
    }

    /// Returns a mutable reference to the value corresponding to the key.
    pub fn get_mut<Q: Hash + Eq + ?Sized>(&mut self, key: &Q) -> Option<&mut V>
    where
        K: Borrow<Q>,
    {
        let (_, index) = self.find_index(key)?;
        Some(&mut self.entries[index].value)
    }

    /// Returns the key-value pair corresponding to the supplied key.
    pub fn get_key_value<Q: Hash + Eq + ?Sized>(&self, key: &Q) -> Option<(&K, &V)>
    where
        K: Borrow<Q>,
    {
        let (_, index) = self.find_index(key)?;
        let entry = &self.entries[index];
        Some((&entry.key, &entry.value))
    }

    /// Returns `true` if the map contains a value for the specified key.
    pub fn contains_key<Q: Hash + Eq + ?Sized>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
    {
        self.find_index(key).is_some()
    }

    /// Removes a key from the map, returning its value if the key was
    /// present.
    pub fn remove<Q: Hash + Eq + ?Sized>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
    {
        self.remove_entry(key).map(|(_, value)| value)
    }

    /// Removes a key from the map, returning the owned key-value pair if
    /// the key was present.
    ///
    /// The vacated bucket becomes a tombstone rather than plain empty:
    /// probe chains of unrelated keys may run through it, and an empty
    /// bucket would terminate them early. The entry store stays dense by
    /// moving its last entry into the vacated slot.
    pub fn remove_entry<Q: Hash + Eq + ?Sized>(&mut self, key: &Q) -> Option<(K, V)>
    where
        K: Borrow<Q>,
    {
        let (pos, index) = self.find_index(key)?;
        self.buckets[pos] = self.buckets[pos].to_tombstone();

        let last_index = self.entries.len() - 1;
        let entry = self.entries.swap_remove(index);

        if index != last_index {
            // The last entry moved into the vacated slot; repoint the one
            // bucket that referenced it.
            for bucket in self.buckets.iter_mut() {
                if bucket.is_occupied() && bucket.entry_index == last_index {
                    bucket.entry_index = index;
                    break;
                }
            }
        }

        Some((entry.key, entry.value))
    }

    /// Returns a mutable reference to the value for `key`, inserting the
    /// default value first if the key is not present.
    ///
    /// ```rust
    /// use densemap::unsync::DenseMap;
    ///
    /// let mut counts: DenseMap<&str, u32> = DenseMap::new();
    /// *counts.get_or_insert_default("word") += 1;
    /// *counts.get_or_insert_default("word") += 1;
    ///
    /// assert_eq!(counts.get("word"), Some(&2));
    /// ```
    pub fn get_or_insert_default(&mut self, key: K) -> &mut V
    where
        V: Default,
    {
        self.try_insert(key, V::default()).0
    }

    /// Grows the table so that `additional` more entries fit without
    /// another rehash.
    pub fn reserve(&mut self, additional: usize) {
        let required = self.entries.len() + additional;
        let slots = common::slots_for(required);
        if slots > self.buckets.len() {
            self.grow(slots);
        }
        self.entries.reserve(additional);
    }

    /// Inserts every pair from `pairs`, applying the
    /// [`try_insert`](DenseMap::try_insert) contract to each. The table is
    /// grown up front for the iterator's lower size bound, so a bulk load
    /// pays for at most one rehash.
    pub fn insert_batch<I>(&mut self, pairs: I)
    where
        I: IntoIterator<Item = (K, V)>,
    {
        let pairs = pairs.into_iter();
        let (lower, _) = pairs.size_hint();
        self.reserve(lower);

        for (key, value) in pairs {
            self.try_insert(key, value);
        }
    }

    /// Looks up every key in `keys`, returning the results in input order.
    /// Equivalent to calling [`get`](DenseMap::get) in a loop.
    pub fn get_batch<'k, Q, I>(&self, keys: I) -> Vec<Option<&V>>
    where
        I: IntoIterator<Item = &'k Q>,
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized + 'k,
    {
        keys.into_iter().map(|key| self.get(key)).collect()
    }

    /// Tests every key in `keys` for membership, returning the results in
    /// input order.
    pub fn contains_batch<'k, Q, I>(&self, keys: I) -> Vec<bool>
    where
        I: IntoIterator<Item = &'k Q>,
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized + 'k,
    {
        keys.into_iter().map(|key| self.contains_key(key)).collect()
    }

    /// Probes for `key`, returning the bucket position and entry index.
    ///
    /// An empty bucket proves absence; tombstones are skipped. A
    /// fingerprint match is confirmed against the actual key before the
    /// slot counts as found, and an entry index out of store bounds is
    /// treated as a non-match rather than followed.
    fn find_index<Q: Hash + Eq + ?Sized>(&self, key: &Q) -> Option<(usize, usize)>
    where
        K: Borrow<Q>,
    {
        let (hash, fingerprint) = hash::adjust(hash::hash(&self.build_hasher, key));
        let capacity = self.buckets.len();
        let mut pos = (hash % capacity as u64) as usize;

        for _ in 0..MAX_PROBE_DISTANCE {
            let bucket = self.buckets[pos];

            if bucket.is_empty() {
                // Not found.
                return None;
            }

            if bucket.is_occupied() && bucket.fingerprint == fingerprint {
                let index = bucket.entry_index;
                if index < self.entries.len() && self.entries[index].key.borrow() == key {
                    return Some((pos, index));
                }
            }

            pos = (pos + 1) % capacity;
        }

        None
    }

    /// One Robin Hood placement pass for a pair known to be absent. `Err`
    /// carries the pair left homeless when the probe bound was reached;
    /// the caller grows the table and retries with it. The table stays
    /// fully consistent across `Err`.
    fn place_pair(
        &mut self,
        (mut key, mut value): (K, V),
        claimed: &mut Option<usize>,
    ) -> Result<usize, (K, V)> {
        let (hash, fp) = hash::adjust(hash::hash(&self.build_hasher, &key));
        let mut fingerprint = fp;
        let capacity = self.buckets.len();
        let mut pos = (hash % capacity as u64) as usize;
        let mut distance = 0usize;

        while distance < MAX_PROBE_DISTANCE {
            let bucket = self.buckets[pos];

            if !bucket.is_occupied() {
                // Empty slot or tombstone. Claim it.
                let index = self.entries.len();
                self.entries.push(Entry { key, value });
                self.buckets[pos] = Bucket::occupied(fingerprint, distance as u8, index);
                return Ok(claimed.unwrap_or(index));
            }

            if (bucket.distance as usize) < distance {
                // The resident has probed less far than the incoming pair:
                // swap them in place, entry slot included, and keep
                // probing with the displaced pair.
                let entry = &mut self.entries[bucket.entry_index];
                mem::swap(&mut entry.key, &mut key);
                mem::swap(&mut entry.value, &mut value);

                let resident = &mut self.buckets[pos];
                mem::swap(&mut resident.fingerprint, &mut fingerprint);
                let displaced_distance = resident.distance as usize;
                resident.distance = distance as u8;
                distance = displaced_distance;

                if claimed.is_none() {
                    *claimed = Some(bucket.entry_index);
                }
            }

            pos = (pos + 1) % capacity;
            distance += 1;
        }

        Err((key, value))
    }

    /// Replaces the bucket table with one of at least `new_capacity`
    /// slots, re-placing every entry's metadata. Entry indices are not
    /// disturbed. Doubles again in the unlikely case a placement exhausts
    /// the probe bound.
    fn grow(&mut self, new_capacity: usize) {
        let mut capacity = new_capacity;

        'rebuild: loop {
            #[cfg(feature = "logging")]
            log::trace!(
                "growing bucket table from {} to {} slots ({} entries)",
                self.buckets.len(),
                capacity,
                self.entries.len()
            );

            let mut buckets = vec![Bucket::EMPTY; capacity].into_boxed_slice();

            for (index, entry) in self.entries.iter().enumerate() {
                let (hash, fingerprint) = hash::adjust(hash::hash(&self.build_hasher, &entry.key));
                if !place(&mut buckets, hash, fingerprint, index) {
                    capacity *= 2;
                    continue 'rebuild;
                }
            }

            self.buckets = buckets;
            return;
        }
    }
}

/// Robin Hood placement of one entry's metadata during a rebuild. All keys
/// are distinct here, so no equality checks are needed and only metadata
/// moves. Returns `false` if the probe bound is hit.
fn place(buckets: &mut [Bucket], hash: u64, fingerprint: u8, entry_index: usize) -> bool {
    let capacity = buckets.len();
    let mut pos = (hash % capacity as u64) as usize;
    let mut distance = 0usize;
    let mut incoming = (fingerprint, entry_index);

    while distance < MAX_PROBE_DISTANCE {
        let bucket = buckets[pos];

        if bucket.is_empty() {
            buckets[pos] = Bucket::occupied(incoming.0, distance as u8, incoming.1);
            return true;
        }

        if (bucket.distance as usize) < distance {
            // Displace the shorter-traveled resident and keep probing with
            // its metadata; its position so far implies its origin, so no
            // hash is needed to continue.
            buckets[pos] = Bucket::occupied(incoming.0, distance as u8, incoming.1);
            incoming = (bucket.fingerprint, bucket.entry_index);
            distance = bucket.distance as usize;
        }

        pos = (pos + 1) % capacity;
        distance += 1;
    }

    false
}

impl<K, V, S> Default for DenseMap<K, V, S>
where
    S: Default,
{
    fn default() -> Self {
        Self::with_hasher(S::default())
    }
}

impl<K, V, S> Clone for DenseMap<K, V, S>
where
    K: Clone,
    V: Clone,
    S: Clone,
{
    fn clone(&self) -> Self {
        Self {
            buckets: self.buckets.clone(),
            entries: self.entries.clone(),
            build_hasher: self.build_hasher.clone(),
        }
    }
}

impl<K, V, S> fmt::Debug for DenseMap<K, V, S>
where
    K: fmt::Debug,
    V: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<K, V, S> PartialEq for DenseMap<K, V, S>
where
    K: Hash + Eq,
    V: PartialEq,
    S: BuildHasher,
{
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .iter()
                .all(|(key, value)| other.get(key).map_or(false, |v| *value == *v))
    }
}

impl<K, V, S> Eq for DenseMap<K, V, S>
where
    K: Hash + Eq,
    V: Eq,
    S: BuildHasher,
{
}

impl<K, Q, V, S> Index<&Q> for DenseMap<K, V, S>
where
    K: Borrow<Q> + Hash + Eq,
    Q: Hash + Eq + ?Sized,
    S: BuildHasher,
{
    type Output = V;

    /// Returns a reference to the value corresponding to the supplied key.
    ///
    /// # Panics
    ///
    /// Panics if the key is not present in the map. Use
    /// [`get`](DenseMap::get) for the non-panicking variant.
    fn index(&self, key: &Q) -> &V {
        self.get(key).expect("no entry found for key")
    }
}

impl<K, V, S> Extend<(K, V)> for DenseMap<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, pairs: I) {
        self.insert_batch(pairs);
    }
}

impl<K, V, S> FromIterator<(K, V)> for DenseMap<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher + Default,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(pairs: I) -> Self {
        let mut map = Self::with_hasher(S::default());
        map.insert_batch(pairs);
        map
    }
}

impl<'a, K, V, S> IntoIterator for &'a DenseMap<K, V, S> {
    type Item = (&'a K, &'a V);
    type IntoIter = Iter<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<'a, K, V, S> IntoIterator for &'a mut DenseMap<K, V, S> {
    type Item = (&'a K, &'a mut V);
    type IntoIter = IterMut<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter_mut()
    }
}

impl<K, V, S> IntoIterator for DenseMap<K, V, S> {
    type Item = (K, V);
    type IntoIter = IntoIter<K, V>;

    fn into_iter(self) -> Self::IntoIter {
        IntoIter::new(self.entries)
    }
}
