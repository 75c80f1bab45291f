//! Named response stores and the caching strategies built on them.
//!
//! - Stores map request identity (method + normalized URL) to the latest response
//! - Only successful GET responses are written, and writes never delay a response
//! - Network-first and cache-first strategies, with offline fallback

mod layer;
mod storage;
mod traits;

pub use layer::CacheLayer;
pub use storage::{CacheStorage, MemoryStorage, SqliteStorage};
pub use traits::{should_store, CacheResult, Request, Response};

#[cfg(test)]
pub use storage::{CachedResponse, StoreSummary};
#[cfg(test)]
pub use traits::{CacheSource, PLACEHOLDER_BODY};
