//! Freshness-window store with in-flight load coalescing.
//!
//! Each key holds at most one value. While a load for a key is running, every
//! other caller for that key awaits the same load instead of starting its own,
//! forced refreshes included.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use metrics::counter;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::application::error::SyncError;

use super::lock::mutex_lock;

const SOURCE: &str = "cache::store";

const METRIC_CACHE_HIT: &str = "sentinel_cache_hit_total";
const METRIC_CACHE_MISS: &str = "sentinel_cache_miss_total";
const METRIC_CACHE_COALESCED: &str = "sentinel_cache_coalesced_total";
const METRIC_CACHE_LOAD_ERROR: &str = "sentinel_cache_load_error_total";

/// A cached value with the instant it was fetched and its freshness window.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub fetched_at: Instant,
    pub ttl: Duration,
}

impl<V> CacheEntry<V> {
    pub fn is_fresh(&self) -> bool {
        self.is_fresh_at(Instant::now())
    }

    pub fn is_fresh_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.fetched_at) < self.ttl
    }
}

/// Where the value handed back by [`TtlStore::get`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOrigin {
    /// A fresh entry was served without calling the loader.
    Cache,
    /// This call started the load.
    Loaded,
    /// This call joined a load another caller had already started.
    Coalesced,
}

/// Result of [`TtlStore::get`].
///
/// On failure `value` carries the last good value for the key, if any, so
/// callers can keep rendering stale data next to the error.
#[derive(Debug, Clone)]
pub struct Fetched<V> {
    pub value: Option<V>,
    pub error: Option<SyncError>,
    pub origin: FetchOrigin,
}

impl<V> Fetched<V> {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

type PendingLoad<V> = Shared<BoxFuture<'static, Result<V, SyncError>>>;

struct Slot<V> {
    entry: Option<CacheEntry<V>>,
    pending: Option<(u64, PendingLoad<V>)>,
    /// Bumped by `invalidate`; a load started under an older epoch does not
    /// populate the entry when it resolves.
    epoch: u64,
}

impl<V> Default for Slot<V> {
    fn default() -> Self {
        Self {
            entry: None,
            pending: None,
            epoch: 0,
        }
    }
}

type Slots<K, V> = Arc<Mutex<HashMap<K, Slot<V>>>>;

/// Keyed cache with a per-entry freshness window and call coalescing.
pub struct TtlStore<K, V> {
    slots: Slots<K, V>,
    load_ids: AtomicU64,
}

impl<K, V> TtlStore<K, V>
where
    K: Eq + Hash + Clone + fmt::Display + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            load_ids: AtomicU64::new(0),
        }
    }

    /// Return the value for `key`, loading it when needed.
    ///
    /// A fresh entry is returned without calling `loader` unless
    /// `force_refresh` is set. A load already in flight for `key` is joined
    /// even when `force_refresh` is set. Failed loads are never cached.
    pub async fn get<F, Fut>(
        &self,
        key: K,
        ttl: Duration,
        loader: F,
        force_refresh: bool,
    ) -> Fetched<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, SyncError>> + Send + 'static,
    {
        let (pending, origin) = {
            let mut slots = mutex_lock(&self.slots, SOURCE, "get");
            let slot = slots.entry(key.clone()).or_default();

            if !force_refresh {
                if let Some(entry) = slot.entry.as_ref().filter(|entry| entry.is_fresh()) {
                    counter!(METRIC_CACHE_HIT, "key" => key.to_string()).increment(1);
                    debug!(cache_key = %key, "Cache hit");
                    return Fetched {
                        value: Some(entry.value.clone()),
                        error: None,
                        origin: FetchOrigin::Cache,
                    };
                }
            }

            if let Some((load_id, pending)) = slot.pending.as_ref() {
                counter!(METRIC_CACHE_COALESCED, "key" => key.to_string()).increment(1);
                debug!(cache_key = %key, load_id, force_refresh, "Joined in-flight load");
                (pending.clone(), FetchOrigin::Coalesced)
            } else {
                counter!(METRIC_CACHE_MISS, "key" => key.to_string()).increment(1);
                let load_id = self.load_ids.fetch_add(1, Ordering::Relaxed);
                let pending = self.start_load(key.clone(), slot.epoch, load_id, ttl, loader());
                slot.pending = Some((load_id, pending.clone()));
                debug!(cache_key = %key, load_id, force_refresh, "Started load");
                (pending, FetchOrigin::Loaded)
            }
        };

        match pending.await {
            Ok(value) => Fetched {
                value: Some(value),
                error: None,
                origin,
            },
            Err(error) => Fetched {
                value: self.peek(&key),
                error: Some(error),
                origin,
            },
        }
    }

    fn start_load<Fut>(
        &self,
        key: K,
        epoch: u64,
        load_id: u64,
        ttl: Duration,
        load: Fut,
    ) -> PendingLoad<V>
    where
        Fut: Future<Output = Result<V, SyncError>> + Send + 'static,
    {
        let slots = Arc::clone(&self.slots);
        async move {
            let result = load.await;
            settle(&slots, &key, epoch, load_id, ttl, &result);
            result
        }
        .boxed()
        .shared()
    }

    /// Drop the cached value for `key` and detach any in-flight load, so the
    /// next `get` reloads even if that load later succeeds.
    pub fn invalidate(&self, key: &K) {
        let mut slots = mutex_lock(&self.slots, SOURCE, "invalidate");
        if let Some(slot) = slots.get_mut(key) {
            slot.entry = None;
            slot.pending = None;
            slot.epoch += 1;
            debug!(cache_key = %key, epoch = slot.epoch, "Cache entry invalidated");
        }
    }

    /// The last stored value for `key`, fresh or not.
    pub fn peek(&self, key: &K) -> Option<V> {
        mutex_lock(&self.slots, SOURCE, "peek")
            .get(key)
            .and_then(|slot| slot.entry.as_ref())
            .map(|entry| entry.value.clone())
    }

    pub fn entry(&self, key: &K) -> Option<CacheEntry<V>> {
        mutex_lock(&self.slots, SOURCE, "entry")
            .get(key)
            .and_then(|slot| slot.entry.clone())
    }

    pub fn is_fresh(&self, key: &K) -> bool {
        self.entry(key).is_some_and(|entry| entry.is_fresh())
    }

    pub fn is_loading(&self, key: &K) -> bool {
        mutex_lock(&self.slots, SOURCE, "is_loading")
            .get(key)
            .is_some_and(|slot| slot.pending.is_some())
    }
}

impl<K, V> Default for TtlStore<K, V>
where
    K: Eq + Hash + Clone + fmt::Display + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

fn settle<K, V>(
    slots: &Slots<K, V>,
    key: &K,
    epoch: u64,
    load_id: u64,
    ttl: Duration,
    result: &Result<V, SyncError>,
) where
    K: Eq + Hash + fmt::Display,
    V: Clone,
{
    let mut slots = mutex_lock(slots, SOURCE, "settle");
    let Some(slot) = slots.get_mut(key) else {
        return;
    };

    if slot.pending.as_ref().is_some_and(|(id, _)| *id == load_id) {
        slot.pending = None;
    }

    match result {
        Ok(value) if slot.epoch == epoch => {
            slot.entry = Some(CacheEntry {
                value: value.clone(),
                fetched_at: Instant::now(),
                ttl,
            });
        }
        Ok(_) => {
            debug!(cache_key = %key, load_id, "Discarded load result after invalidation");
        }
        Err(error) => {
            counter!(METRIC_CACHE_LOAD_ERROR, "key" => key.to_string()).increment(1);
            warn!(
                cache_key = %key,
                load_id,
                error = %error,
                has_stale = slot.entry.is_some(),
                "Cache load failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use futures::future::join_all;
    use tokio::sync::oneshot;

    use super::*;

    const KEY: &str = "collection";
    const TTL: Duration = Duration::from_secs(300);

    fn counting_loader(
        calls: &Arc<AtomicUsize>,
        value: u32,
    ) -> impl FnOnce() -> BoxFuture<'static, Result<u32, SyncError>> {
        let calls = Arc::clone(calls);
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok(value) }.boxed()
        }
    }

    #[tokio::test]
    async fn concurrent_forced_gets_share_one_load() {
        let store: TtlStore<&'static str, u32> = TtlStore::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let gets = (0..5).map(|_| {
            let calls = Arc::clone(&calls);
            store.get(
                KEY,
                TTL,
                move || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async {
                        tokio::task::yield_now().await;
                        Ok(11)
                    }
                },
                true,
            )
        });
        let results = join_all(gets).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| r.value == Some(11) && r.is_ok()));
        assert_eq!(results[0].origin, FetchOrigin::Loaded);
        assert!(results[1..].iter().all(|r| r.origin == FetchOrigin::Coalesced));
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_entry_skips_loader_until_window_passes() {
        let store: TtlStore<&'static str, u32> = TtlStore::new();
        let calls = Arc::new(AtomicUsize::new(0));

        store.get(KEY, TTL, counting_loader(&calls, 1), false).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(4 * 60)).await;
        let cached = store.get(KEY, TTL, counting_loader(&calls, 2), false).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cached.origin, FetchOrigin::Cache);
        assert_eq!(cached.value, Some(1));

        tokio::time::advance(Duration::from_secs(2 * 60)).await;
        let reloaded = store.get(KEY, TTL, counting_loader(&calls, 3), false).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(reloaded.value, Some(3));
    }

    #[tokio::test]
    async fn force_refresh_bypasses_fresh_entry() {
        let store: TtlStore<&'static str, u32> = TtlStore::new();
        let calls = Arc::new(AtomicUsize::new(0));

        store.get(KEY, TTL, counting_loader(&calls, 1), false).await;
        let forced = store.get(KEY, TTL, counting_loader(&calls, 2), true).await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(forced.value, Some(2));
    }

    #[tokio::test]
    async fn failed_load_returns_stale_value_and_is_not_cached() {
        let store: TtlStore<&'static str, u32> = TtlStore::new();
        let calls = Arc::new(AtomicUsize::new(0));

        store.get(KEY, TTL, counting_loader(&calls, 5), false).await;
        let failed = store
            .get(
                KEY,
                TTL,
                || async { Err(SyncError::http(503, "unavailable")) },
                true,
            )
            .await;

        assert_eq!(failed.value, Some(5));
        assert_eq!(failed.error, Some(SyncError::http(503, "unavailable")));
        // The stale entry keeps its original fetch time and value.
        assert_eq!(store.peek(&KEY), Some(5));
        assert!(!store.is_loading(&KEY));
    }

    #[tokio::test]
    async fn failed_first_load_has_no_value() {
        let store: TtlStore<&'static str, u32> = TtlStore::new();
        let failed = store
            .get(KEY, TTL, || async { Err(SyncError::network("refused")) }, false)
            .await;

        assert!(failed.value.is_none());
        assert!(matches!(failed.error, Some(SyncError::Network(_))));
        assert!(store.entry(&KEY).is_none());
    }

    #[tokio::test]
    async fn invalidate_during_load_forces_next_get_to_reload() {
        let store: Arc<TtlStore<&'static str, u32>> = Arc::new(TtlStore::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let (release, gate) = oneshot::channel::<()>();

        let first = {
            let store = Arc::clone(&store);
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                store
                    .get(
                        KEY,
                        TTL,
                        move || {
                            calls.fetch_add(1, Ordering::SeqCst);
                            async move {
                                let _ = gate.await;
                                Ok(1)
                            }
                        },
                        false,
                    )
                    .await
            })
        };

        while !store.is_loading(&KEY) {
            tokio::task::yield_now().await;
        }
        store.invalidate(&KEY);
        let _ = release.send(());

        let first = first.await.expect("load task");
        assert_eq!(first.value, Some(1));
        assert!(store.entry(&KEY).is_none());

        let second = store.get(KEY, TTL, counting_loader(&calls, 2), false).await;
        assert_eq!(second.origin, FetchOrigin::Loaded);
        assert_eq!(second.value, Some(2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn keys_are_cached_independently() {
        let store: TtlStore<&'static str, u32> = TtlStore::new();
        let calls = Arc::new(AtomicUsize::new(0));

        store.get("a", TTL, counting_loader(&calls, 1), false).await;
        store.get("b", TTL, counting_loader(&calls, 2), false).await;

        assert_eq!(store.peek(&"a"), Some(1));
        assert_eq!(store.peek(&"b"), Some(2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
