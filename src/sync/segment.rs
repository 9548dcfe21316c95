use crate::common::{self, bucket::Bucket, error::TryInsertError, hash, MAX_PROBE_DISTANCE};

use parking_lot::{RwLock, RwLockWriteGuard};
use std::{
    borrow::Borrow,
    cell::UnsafeCell,
    hash::{BuildHasher, Hash},
    mem::{self, MaybeUninit},
    sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering},
};

// Entry slot lifecycle. A slot is claimed exclusively by a fetch-add on the
// table's reservation counter, written while still invisible to readers,
// and published either by the claiming bucket's compare-and-swap or not at
// all. DEAD slots keep their contents until a resize reclaims them.
const VACANT: u8 = 0;
const LIVE: u8 = 1;
const DEAD: u8 = 2;

struct EntrySlot<K, V> {
    state: AtomicU8,
    pair: UnsafeCell<MaybeUninit<(K, V)>>,
}

impl<K, V> EntrySlot<K, V> {
    fn vacant() -> Self {
        Self {
            state: AtomicU8::new(VACANT),
            pair: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// # Safety
    ///
    /// The caller must have exclusive access to the slot contents: a
    /// freshly reserved, still unpublished index, or `&mut` on the table.
    unsafe fn write(&self, pair: (K, V)) {
        (*self.pair.get()).write(pair);
    }

    /// # Safety
    ///
    /// The slot must hold an initialized pair, and the pair must not be
    /// concurrently moved out (the store is only compacted under the
    /// exclusive lock).
    unsafe fn pair_ref(&self) -> &(K, V) {
        (*self.pair.get()).assume_init_ref()
    }

    /// # Safety
    ///
    /// The slot must hold an initialized pair the caller has exclusive
    /// access to. The contents are moved out; the state must be reset so
    /// no second take or drop observes them.
    unsafe fn take(&self) -> (K, V) {
        (*self.pair.get()).assume_init_read()
    }
}

/// One segment's storage: packed bucket words and the entry slots they
/// index. All `&self` methods are called under the owning segment's shared
/// lock; `rebuild` requires the exclusive lock via `&mut self`.
pub(crate) struct Table<K, V> {
    buckets: Box<[AtomicU64]>,
    slots: Box<[EntrySlot<K, V>]>,
    reserved: AtomicUsize,
}

unsafe impl<K: Send, V: Send> Send for Table<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for Table<K, V> {}

impl<K, V> Table<K, V> {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            buckets: (0..capacity).map(|_| AtomicU64::new(0)).collect(),
            slots: (0..capacity).map(|_| EntrySlot::vacant()).collect(),
            reserved: AtomicUsize::new(0),
        }
    }

    fn capacity(&self) -> usize {
        self.buckets.len()
    }

    /// Number of consumed entry slots: live, dead, and lost to races. The
    /// counter can overshoot the store when reservations fail, so it is
    /// clamped.
    fn reserved(&self) -> usize {
        self.reserved.load(Ordering::Relaxed).min(self.slots.len())
    }

    /// Lock-free probe for `key`. Returns the bucket position, the entry
    /// index, and the bucket word as observed.
    ///
    /// An empty bucket proves absence; tombstones are skipped. A stale or
    /// torn publication (index beyond the store, slot not live) is treated
    /// as a non-match rather than followed.
    fn find<Q>(&self, hash: u64, fingerprint: u8, key: &Q) -> Option<(usize, usize, u64)>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let capacity = self.capacity();
        let mut pos = (hash % capacity as u64) as usize;

        for _ in 0..MAX_PROBE_DISTANCE {
            let word = self.buckets[pos].load(Ordering::Acquire);
            let bucket = Bucket::unpack(word);

            if bucket.is_empty() {
                // Not found.
                return None;
            }

            if bucket.is_occupied() && bucket.fingerprint == fingerprint {
                let index = bucket.entry_index;
                if index < self.slots.len()
                    && self.slots[index].state.load(Ordering::Acquire) == LIVE
                {
                    // Safety: LIVE is stored after the pair is written and
                    // the pair stays in place until an exclusive-lock
                    // resize, which the caller's shared lock excludes.
                    let (slot_key, _) = unsafe { self.slots[index].pair_ref() };
                    if slot_key.borrow() == key {
                        return Some((pos, index, word));
                    }
                }
            }

            pos = (pos + 1) % capacity;
        }

        None
    }

    /// Claims a bucket for the pair via compare-and-swap, publishing it
    /// through a freshly reserved entry slot. Probing is strictly linear
    /// forward; there is no Robin Hood displacement in this variant.
    fn insert(&self, hash: u64, fingerprint: u8, key: K, value: V) -> Result<usize, TryInsertError>
    where
        K: Eq,
    {
        let capacity = self.capacity();
        let ideal = (hash % capacity as u64) as usize;
        // One slot is reserved lazily and reused across claim retries. If
        // the insert ultimately fails, the slot stays vacant until the
        // next resize reclaims it; un-reserving could hand the same index
        // to two writers.
        let mut reserved_index = None;
        let mut pair = (key, value);

        loop {
            // Scan for the key or the first reusable bucket. Absence must
            // be established before claiming: a tombstone can sit on the
            // probe chain in front of this very key, and claiming it
            // blindly would resurrect the key as a duplicate.
            let mut vacant: Option<(usize, u64, usize)> = None;
            let mut pos = ideal;

            for distance in 0..MAX_PROBE_DISTANCE {
                let word = self.buckets[pos].load(Ordering::Acquire);
                let bucket = Bucket::unpack(word);

                if bucket.is_empty() {
                    if vacant.is_none() {
                        vacant = Some((pos, word, distance));
                    }
                    break;
                }

                if bucket.is_occupied() {
                    if bucket.fingerprint == fingerprint {
                        let index = bucket.entry_index;
                        if index < self.slots.len()
                            && self.slots[index].state.load(Ordering::Acquire) == LIVE
                        {
                            let (slot_key, _) = unsafe { self.slots[index].pair_ref() };
                            if *slot_key == pair.0 {
                                // Already present. No overwrite.
                                return Err(TryInsertError::AlreadyPresent);
                            }
                        }
                    }
                } else if vacant.is_none() {
                    // Tombstone. Remember it, keep scanning for the key.
                    vacant = Some((pos, word, distance));
                }

                pos = (pos + 1) % capacity;
            }

            let Some((pos, word, distance)) = vacant else {
                return Err(TryInsertError::CapacityExhausted);
            };

            let index = match reserved_index {
                Some(index) => index,
                None => {
                    let index = self.reserved.fetch_add(1, Ordering::AcqRel);
                    if index >= self.slots.len() {
                        return Err(TryInsertError::CapacityExhausted);
                    }
                    reserved_index = Some(index);
                    index
                }
            };

            let slot = &self.slots[index];
            // Safety: `index` was reserved by this call and is not yet
            // published, so this thread is the slot's only accessor.
            unsafe { slot.write(pair) };
            slot.state.store(LIVE, Ordering::Release);

            let claim = Bucket::occupied(fingerprint, distance as u8, index).pack();
            match self.buckets[pos].compare_exchange(
                word,
                claim,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(index),
                Err(_) => {
                    // Another thread won this bucket. The word was never
                    // published, so the pair can be taken back and the
                    // probe repeated against the new state; the winner may
                    // even have inserted this same key.
                    pair = unsafe { slot.take() };
                    slot.state.store(VACANT, Ordering::Release);
                }
            }
        }
    }

    /// Transitions the bucket owning `key` to a tombstone and marks its
    /// entry slot dead. Dead slots are not compacted here; the next
    /// resize reclaims them. Returns the erased pair's store index.
    fn erase<Q>(&self, hash: u64, fingerprint: u8, key: &Q) -> Option<usize>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        loop {
            let (pos, index, word) = self.find(hash, fingerprint, key)?;
            let tombstone = Bucket::unpack(word).to_tombstone().pack();

            if self.buckets[pos]
                .compare_exchange(word, tombstone, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.slots[index].state.store(DEAD, Ordering::Release);
                return Some(index);
            }
            // Lost a race for the bucket; re-probe from scratch.
        }
    }

    /// # Safety
    ///
    /// `index` must refer to a slot that has been published (observed
    /// through a bucket word or returned by `erase`), and the segment's
    /// lock must be held so no resize frees the store underneath.
    unsafe fn pair(&self, index: usize) -> &(K, V) {
        self.slots[index].pair_ref()
    }

    /// Clones the pair at `index` if it is live. Used by the weakly
    /// consistent iterator.
    fn clone_pair(&self, index: usize) -> Option<(K, V)>
    where
        K: Clone,
        V: Clone,
    {
        let slot = self.slots.get(index)?;
        if slot.state.load(Ordering::Acquire) != LIVE {
            return None;
        }
        // Safety: LIVE implies the pair is written, and the shared lock
        // held by the caller keeps the store in place.
        let (key, value) = unsafe { slot.pair_ref() };
        Some((key.clone(), value.clone()))
    }

    /// Rebuilds the table at `new_capacity`: live pairs move into a fresh,
    /// dense entry store and dead slots are dropped. This is the one place
    /// erased entries are reclaimed, and the one operation that stops the
    /// segment's world.
    fn rebuild<S>(&mut self, build_hasher: &S, new_capacity: usize)
    where
        K: Hash,
        S: BuildHasher,
    {
        let reserved = (*self.reserved.get_mut()).min(self.slots.len());

        let mut pairs = Vec::with_capacity(reserved);
        for slot in self.slots.iter_mut().take(reserved) {
            let state = mem::replace(slot.state.get_mut(), VACANT);
            if state == VACANT {
                continue;
            }
            // Safety: exclusive access through `&mut self`; the state was
            // reset above so the pair cannot be dropped twice.
            let pair = unsafe { slot.take() };
            if state == LIVE {
                let (hash, fingerprint) = hash::adjust(hash::hash(build_hasher, &pair.0));
                pairs.push((hash, fingerprint, pair));
            }
        }

        // Pick a capacity at which every pair fits under the probe bound.
        let mut capacity = new_capacity;
        let words = loop {
            match place_all(&pairs, capacity) {
                Some(words) => break words,
                None => capacity *= 2,
            }
        };

        let mut slots: Vec<EntrySlot<K, V>> = (0..capacity).map(|_| EntrySlot::vacant()).collect();
        let len = pairs.len();
        for (index, (_, _, pair)) in pairs.into_iter().enumerate() {
            *slots[index].pair.get_mut() = MaybeUninit::new(pair);
            *slots[index].state.get_mut() = LIVE;
        }

        self.buckets = words.into_iter().map(AtomicU64::new).collect();
        self.slots = slots.into_boxed_slice();
        *self.reserved.get_mut() = len;
    }
}

impl<K, V> Drop for Table<K, V> {
    fn drop(&mut self) {
        let reserved = (*self.reserved.get_mut()).min(self.slots.len());
        for slot in self.slots.iter_mut().take(reserved) {
            if *slot.state.get_mut() != VACANT {
                // Safety: exclusive access in drop; every non-vacant slot
                // holds an initialized pair exactly once.
                drop(unsafe { slot.take() });
            }
        }
    }
}

/// Linear-probe placement of every pair's metadata for a rebuild. Returns
/// `None` if any placement exhausts the probe bound at this capacity.
fn place_all<K, V>(pairs: &[(u64, u8, (K, V))], capacity: usize) -> Option<Vec<u64>> {
    let mut words = vec![0u64; capacity];

    for (index, (hash, fingerprint, _)) in pairs.iter().enumerate() {
        let mut pos = (*hash % capacity as u64) as usize;
        let mut distance = 0;

        loop {
            if distance >= MAX_PROBE_DISTANCE {
                return None;
            }
            if words[pos] == 0 {
                words[pos] = Bucket::occupied(*fingerprint, distance as u8, index).pack();
                break;
            }
            pos = (pos + 1) % capacity;
            distance += 1;
        }
    }

    Some(words)
}

/// One independent shard of the key space: a [`Table`] behind a
/// reader/writer lock. Every operation holds the lock in shared mode; only
/// this segment's own resize takes it exclusively.
pub(crate) struct Segment<K, V> {
    table: RwLock<Table<K, V>>,
}

impl<K, V> Segment<K, V> {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            table: RwLock::new(Table::with_capacity(capacity)),
        }
    }

    /// Clones the first live pair at or after slot `start`, together with
    /// its slot index.
    pub(crate) fn scan_from(&self, start: usize) -> Option<(usize, (K, V))>
    where
        K: Clone,
        V: Clone,
    {
        let table = self.table.read();
        let end = table.reserved();
        (start..end).find_map(|index| table.clone_pair(index).map(|pair| (index, pair)))
    }
}

impl<K, V> Segment<K, V>
where
    K: Hash + Eq,
{
    pub(crate) fn insert<S>(
        &self,
        build_hasher: &S,
        hash: u64,
        fingerprint: u8,
        key: K,
        value: V,
    ) -> Result<(), TryInsertError>
    where
        S: BuildHasher,
    {
        let table = self.table.read();

        let table = if common::needs_grow(table.reserved(), table.capacity()) {
            // Escalate to the exclusive lock, re-check under it, resize if
            // still warranted, and come back down to shared mode for the
            // claim itself.
            drop(table);
            let mut table = self.table.write();
            if common::needs_grow(table.reserved(), table.capacity()) {
                let new_capacity = table.capacity() * 2;
                #[cfg(feature = "logging")]
                log::trace!(
                    "resizing segment from {} to {} slots",
                    table.capacity(),
                    new_capacity
                );
                table.rebuild(build_hasher, new_capacity);
            }
            RwLockWriteGuard::downgrade(table)
        } else {
            table
        };

        table.insert(hash, fingerprint, key, value).map(|_| ())
    }

    pub(crate) fn get_and<Q, F, T>(
        &self,
        hash: u64,
        fingerprint: u8,
        key: &Q,
        with_entry: F,
    ) -> Option<T>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
        F: FnOnce(&K, &V) -> T,
    {
        let table = self.table.read();
        let (_, index, _) = table.find(hash, fingerprint, key)?;
        // Safety: the index was just observed through a bucket word and
        // the shared lock is held.
        let (slot_key, value) = unsafe { table.pair(index) };
        Some(with_entry(slot_key, value))
    }

    pub(crate) fn remove_and<Q, F, T>(
        &self,
        hash: u64,
        fingerprint: u8,
        key: &Q,
        with_entry: F,
    ) -> Option<T>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
        F: FnOnce(&K, &V) -> T,
    {
        let table = self.table.read();
        let index = table.erase(hash, fingerprint, key)?;
        // Safety: `erase` returned the index and the shared lock keeps the
        // dead pair in place until a resize.
        let (slot_key, value) = unsafe { table.pair(index) };
        Some(with_entry(slot_key, value))
    }
}
