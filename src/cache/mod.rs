//! Sentinel cache layer
//!
//! A keyed store with a freshness window per entry and coalescing of
//! concurrent loads. The record repository sits on top of it; real-time
//! deltas never pass through here.
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! collection_ttl_seconds = 300
//! aggregate_ttl_seconds = 60
//! ```

mod config;
mod keys;
pub(crate) mod lock;
mod store;

pub use config::CacheConfig;
pub use keys::CacheKey;
pub use store::{CacheEntry, FetchOrigin, Fetched, TtlStore};
