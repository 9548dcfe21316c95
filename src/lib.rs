#![warn(clippy::all)]
#![warn(rust_2018_idioms)]

//! Hash maps built around dense entry storage: a compact bucket table holds
//! per-slot metadata (an 8-bit fingerprint, a probe distance and an index),
//! while the key-value pairs themselves live in a gap-free, index-addressed
//! store that iterates at array speed.
//!
//! Two variants share that design:
//!
//! - [`unsync::DenseMap`]: a single-threaded map using Robin Hood open
//!   addressing; erases tombstone the bucket and swap the last entry into
//!   the vacated store slot, keeping the store dense. Mutation requires
//!   `&mut self`; there is no internal synchronization.
//! - [`sync::SegmentedMap`]: a thread-safe map that partitions keys across
//!   independent segments. Bucket updates are single-word compare-and-swap
//!   operations; each segment carries a reader/writer lock that only a
//!   resize takes exclusively.
//!
//! # Example
//!
//! ```rust
//! use densemap::unsync::DenseMap;
//!
//! let mut map = DenseMap::new();
//! map.try_insert("apple", 1);
//! map.try_insert("banana", 2);
//!
//! assert_eq!(map.get("apple"), Some(&1));
//! assert_eq!(map.remove("apple"), Some(1));
//! assert!(!map.contains_key("apple"));
//! assert_eq!(map.len(), 1);
//! ```
//!
//! Sharing the concurrent variant between threads only needs a `clone`;
//! all of its operations take `&self`:
//!
//! ```rust
//! use densemap::sync::SegmentedMap;
//!
//! let map = SegmentedMap::new();
//!
//! std::thread::scope(|s| {
//!     for t in 0..4 {
//!         let map = map.clone();
//!         s.spawn(move || {
//!             for i in (t * 100)..(t * 100 + 100) {
//!                 map.insert(i, i * 2);
//!             }
//!         });
//!     }
//! });
//!
//! assert_eq!(map.len(), 400);
//! assert_eq!(map.get(&123), Some(246));
//! ```
//!
//! # Feature flags
//!
//! - `logging`: emits [`log`](https://crates.io/crates/log) trace records
//!   when a bucket table grows or a segment is resized. Disabled by default.

pub(crate) mod common;
pub mod sync;
pub mod unsync;

pub use common::error::TryInsertError;
pub use common::hash::DefaultHashBuilder;
