//! Wire Protocol Module
//!
//! Everything between the socket and the cache: the detector that sniffs
//! which dialect a new connection speaks, and one handler per dialect.
//!
//! ```text
//! Connection
//!      │
//!      ▼
//! ┌──────────────┐   peeked bytes replayed   ┌───────────────────┐
//! │   Detector   │──────────────────────────>│  RESP handler     │
//! │  (≤ 8 bytes) │                           │  HTTP handler     │
//! └──────────────┘                           │  Memcache handler │
//!                                            │  Postgres handler │
//!                                            └─────────┬─────────┘
//!                                                      │
//!                                                      ▼
//!                                                    Cache
//! ```
//!
//! The RESP handler is the reference dialect; the others are thin
//! adapters mapping their wire formats onto the same cache operations.

pub mod detector;
pub mod glob;
pub mod http;
pub mod memcache;
pub mod postgres;
pub mod resp;

pub use detector::{classify, detect, Dialect, PeekStream};
pub use glob::glob_match;
pub use http::HttpHandler;
pub use memcache::MemcacheHandler;
pub use postgres::PostgresHandler;
pub use resp::RespHandler;
