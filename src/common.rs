pub(crate) mod bucket;
pub(crate) mod error;
pub(crate) mod hash;

/// Number of bucket slots a freshly created table starts with.
pub(crate) const INITIAL_CAPACITY: usize = 16;

/// Ratio of consumed entries to bucket slots above which a table grows.
pub(crate) const MAX_LOAD_FACTOR: f64 = 0.75;

/// Upper bound on a probe sequence. The sequential map reacts to hitting it
/// by doubling its capacity; the concurrent map reports it to the caller.
pub(crate) const MAX_PROBE_DISTANCE: usize = 255;

/// Default number of independent segments in `sync::SegmentedMap`.
pub(crate) const DEFAULT_NUM_SEGMENTS: usize = 64;

/// Whether a table holding `len` entries in `slots` buckets must grow
/// before accepting another entry.
#[inline]
pub(crate) fn needs_grow(len: usize, slots: usize) -> bool {
    len as f64 >= slots as f64 * MAX_LOAD_FACTOR
}

/// The smallest power-of-two slot count that holds `entries` entries
/// without exceeding the load factor.
pub(crate) fn slots_for(entries: usize) -> usize {
    let mut slots = INITIAL_CAPACITY;
    while needs_grow(entries, slots) {
        slots *= 2;
    }
    slots
}
