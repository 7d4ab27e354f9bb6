//! # On-disk artifact cache with asynchronous population
//!
//! This crate is the local, single-node cache backing a continuous-profiling backend.
//! It stores large downloaded artifacts (executables, debug-info blobs) under a byte
//! budget, shared concurrently by many in-flight requests.
//!
//! ## How a file gets into the cache
//!
//! [`FileCache::acquire`] pins an entry inside a [`weighted_lru::WeightedLruCache`]
//! keyed by the file's final path, weighted by its declared size. Exactly one of the
//! concurrent acquirers observes `inserted = true`: that caller is the designated
//! populator and is responsible for calling [`AcquiredFileReference::open`], streaming
//! the bytes through [`FileWriter::write_at`] (chunks may arrive out of order), and
//! committing with [`FileWriter::finish`], which validates the declared size and
//! atomically renames `<path>.tmp` to `<path>`.
//!
//! Everyone, the populator included, may suspend on
//! [`AcquiredFileReference::wait_stored`] until the entry reaches a terminal
//! [`FileState`]. State transitions are fanned out over a per-entry [`pubsub::PubSub`]
//! bus with bounded subscriber channels, so progress notification applies
//! backpressure instead of buffering without limit.
//!
//! Every reference must be closed exactly once. Closing the last reference to an
//! entry that never reached [`FileState::Stored`] purges it immediately, so broken or
//! half-written files do not linger; stored entries merely become evictable and are
//! removed from disk only when capacity pressure pushes them out in LRU order.
//!
//! On startup the cache directory is scanned once: orphaned `*.tmp` files are
//! deleted, and completed files are re-registered with their on-disk sizes so that
//! capacity accounting survives a restart without re-downloading anything.
//!
//! Retry policy deliberately lives outside this crate: a failed population leaves the
//! entry in [`FileState::WriteFailed`] until it is purged, and a fresh acquire simply
//! re-observes that state.

mod config;
mod entry;
mod error;
mod evict;
mod filecache;
pub mod pubsub;
mod writer;


pub use config::{FileCacheConfig, parse_byte_size};
pub use entry::FileState;
pub use error::CacheError;
pub use filecache::{AcquiredFileReference, FileCache, TMP_SUFFIX};
pub use writer::FileWriter;
