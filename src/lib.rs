//! # ferrocache - A Multi-Protocol In-Memory Caching Server
//!
//! ferrocache is an in-memory key-value cache reachable over four wire
//! protocols at once: RESP (Redis), memcache text, HTTP/1.1, and the
//! Postgres simple-query protocol. Each connection is sniffed and routed
//! to the right handler automatically, so `redis-cli`, `curl` and `psql`
//! can all talk to the same port.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           ferrocache                             │
//! │                                                                  │
//! │  ┌────────────┐   ┌──────────┐   ┌────────────────────────────┐  │
//! │  │ TCP Server │──>│ Detector │──>│ RESP / HTTP / Memcache /   │  │
//! │  │ (Listener) │   │ (8-byte  │   │ Postgres handler           │  │
//! │  └────────────┘   │  peek)   │   └─────────────┬──────────────┘  │
//! │                   └──────────┘                 │                 │
//! │                                                ▼                 │
//! │                   ┌────────────────────────────────────────────┐ │
//! │                   │                  Cache                     │ │
//! │                   │  ┌────────┐ ┌────────┐ ┌────────┐          │ │
//! │                   │  │Shard 0 │ │Shard 1 │ │...N    │          │ │
//! │                   │  │RwLock  │ │RwLock  │ │shards  │          │ │
//! │                   │  │RH map  │ │RH map  │ │        │          │ │
//! │                   │  └────────┘ └────────┘ └────────┘          │ │
//! │                   └────────────────────▲───────────────────────┘ │
//! │                                        │                         │
//! │                   ┌────────────────────┴───────────────────────┐ │
//! │                   │            Sweeper (background task)       │ │
//! │                   └────────────────────────────────────────────┘ │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Highlights
//!
//! - **Robin-Hood hashing**: each shard is an open-addressing table with
//!   backward-shift deletion, which bounds probe lengths and avoids
//!   tombstone decay.
//! - **Precise memory accounting**: every store, delete, increment, CAS
//!   and eviction adjusts an atomic per-shard gauge by the entry's exact
//!   accounted size.
//! - **Two-random eviction**: under memory pressure two live entries are
//!   sampled and the worse one (expired first, then soonest-expiring) is
//!   marked evicted in O(1); the sweeper reclaims the carcasses later.
//! - **Lazy + active expiry**: expired keys are dropped on access and by
//!   the background sweeper, so untouched keys are reclaimed too.
//! - **Lock-then-atomics**: readers clone an entry's `Arc` under a brief
//!   shared lock and inspect its atomic metadata after release, keeping
//!   the critical sections tiny.
//!
//! ## Module Overview
//!
//! - [`cache`]: the sharded Robin-Hood core, entries, and the sweeper
//! - [`protocol`]: dialect detection and the four wire handlers
//! - [`server`]: listener setup, accept loop, graceful shutdown

pub mod cache;
pub mod protocol;
pub mod server;

pub use cache::{Cache, Entry, Stats, StoreOptions, Sweeper, SweeperConfig};
pub use protocol::{Dialect, HttpHandler, MemcacheHandler, PostgresHandler, RespHandler};
pub use server::{Config, Server};

/// The default port ferrocache listens on (same as Redis).
pub const DEFAULT_PORT: u16 = 6379;

/// The default host ferrocache binds to.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Version of ferrocache.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
