//! A thread-safe hash map with multiple internal segments.
//!
//! [`SegmentedMap`] partitions its key space across independent segments,
//! each owning a table of atomically updated bucket words and an
//! append-only entry store. Bucket claims and erases are single-word
//! compare-and-swap transitions; the per-segment reader/writer lock is held
//! shared on every path and taken exclusively only to resize that segment.

pub(crate) mod iter;
pub(crate) mod map;
pub(crate) mod segment;

pub use iter::Iter;
pub use map::SegmentedMap;
