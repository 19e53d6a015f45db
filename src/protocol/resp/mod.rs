//! RESP (Redis Serialization Protocol) Dialect
//!
//! The reference dialect: most of the cache's semantics are exercised
//! through these commands, and the other adapters are thin mappings of
//! the same operations.
//!
//! - `parser`: incremental command parser (array and inline request forms)
//! - `reply`: the five RESP2 reply encodings
//! - `handler`: command dispatch and the per-connection loop

pub mod handler;
pub mod parser;
pub mod reply;

pub use handler::RespHandler;
pub use parser::{parse_command, ParseError};
pub use reply::Reply;
