//! Logical cache keys.

use std::fmt;

/// One slot per backend resource the repository mirrors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// The full record collection.
    Collection,
    /// The aggregate statistics snapshot.
    Aggregate,
}

impl CacheKey {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheKey::Collection => "collection",
            CacheKey::Aggregate => "aggregate",
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
