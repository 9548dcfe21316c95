//! A single-threaded hash map with dense entry storage.
//!
//! [`DenseMap`] combines Robin Hood open addressing with a gap-free entry
//! store: the bucket table holds only compact metadata, while the key-value
//! pairs sit contiguously in insertion-compacted order. Iteration walks the
//! entry store at array speed, and erases keep it dense by swapping the
//! last entry into the vacated slot.

pub(crate) mod iter;
pub(crate) mod map;

pub use iter::{IntoIter, Iter, IterMut};
pub use map::DenseMap;
