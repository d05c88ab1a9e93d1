//! Cache configuration.
//!
//! Freshness windows for the repository's fetch paths, set via `sentinel.toml`.

use std::time::Duration;

const DEFAULT_COLLECTION_TTL_SECS: u64 = 5 * 60;
const DEFAULT_AGGREGATE_TTL_SECS: u64 = 60;

/// Cache configuration from the `[cache]` section.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// How long a fetched collection counts as fresh.
    pub collection_ttl: Duration,
    /// How long a fetched aggregate snapshot counts as fresh. Shorter than
    /// the collection window since counters drift faster.
    pub aggregate_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            collection_ttl: Duration::from_secs(DEFAULT_COLLECTION_TTL_SECS),
            aggregate_ttl: Duration::from_secs(DEFAULT_AGGREGATE_TTL_SECS),
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            collection_ttl: settings.collection_ttl,
            aggregate_ttl: settings.aggregate_ttl,
        }
    }
}
