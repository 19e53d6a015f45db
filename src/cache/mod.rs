//! Cache Core Module
//!
//! The in-memory key-value store at the heart of ferrocache: a fixed array
//! of shards, each a Robin-Hood hash table behind its own readers-writer
//! lock, with precise per-entry memory accounting and two-random eviction
//! under memory pressure.
//!
//! ## Submodules
//!
//! - [`entry`]: the stored record and its atomic metadata
//! - `map`: the Robin-Hood open-addressing table (crate-internal)
//! - `shard`: one locked partition with its counters (crate-internal)
//! - `core`: the public [`Cache`] API and eviction policy
//! - [`sweeper`]: the periodic expired/evicted cleanup task
//!
//! ## Example
//!
//! ```
//! use ferrocache::cache::{Cache, StoreOptions};
//! use bytes::Bytes;
//! use std::time::Duration;
//!
//! let cache = Cache::new(16, 0);
//!
//! cache.store(Bytes::from("session"), Bytes::from("token"), Some(&StoreOptions {
//!     ttl: Some(Duration::from_secs(3600)),
//!     ..Default::default()
//! }));
//!
//! let entry = cache.load(b"session").unwrap();
//! assert_eq!(entry.value(), Bytes::from("token"));
//! ```

pub mod entry;
pub mod sweeper;

mod core;
mod map;
mod shard;

pub use self::core::{Cache, Stats, DEFAULT_SHARDS};
pub use entry::{now_nanos, Entry, StoreOptions};
pub use sweeper::{Sweeper, SweeperConfig};
