//! Optimistic CRUD over the mirrored record collection and its aggregate.
//!
//! Fetches go through the coalescing [`TtlStore`]; a completed load replaces
//! the live view exactly once, whichever caller started it. Local mutations
//! land in the view before their network call and are reverted if it fails.
//! Push deltas bypass the cache and mutate the view directly.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use metrics::counter;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::application::error::SyncError;
use crate::application::reconcile::{LiveView, RealtimeDelta, ReconcileOptions};
use crate::application::repos::RecordsApi;
use crate::cache::lock::mutex_lock;
use crate::cache::{CacheConfig, CacheKey, TtlStore};
use crate::domain::records::{newest_first, validate_new_record, validate_patch};
use crate::domain::{
    AggregateSnapshot, CreateResponse, MutationAck, NewRecord, Record, RecordId, RecordPatch,
};
use crate::realtime::{RealtimeChannel, Subscription};

const SOURCE: &str = "application::repository";

const METRIC_OPTIMISTIC_ROLLBACK: &str = "sentinel_optimistic_rollback_total";

const DEFAULT_RECENT_LIMIT: usize = 10;
const DEFAULT_CONFIRM_REFRESH_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct RepositoryConfig {
    pub cache: CacheConfig,
    pub reconcile: ReconcileOptions,
    pub recent_limit: usize,
    /// Delay before the quiet refresh that follows a successful mutation.
    /// Zero disables it.
    pub confirm_refresh_delay: Duration,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            reconcile: ReconcileOptions::default(),
            recent_limit: DEFAULT_RECENT_LIMIT,
            confirm_refresh_delay: DEFAULT_CONFIRM_REFRESH_DELAY,
        }
    }
}

impl From<&crate::config::Settings> for RepositoryConfig {
    fn from(settings: &crate::config::Settings) -> Self {
        Self {
            cache: CacheConfig::from(&settings.cache),
            reconcile: ReconcileOptions::from(&settings.reconcile),
            recent_limit: settings.reconcile.recent_limit,
            confirm_refresh_delay: settings.reconcile.confirm_refresh_delay,
        }
    }
}

/// A view value together with the error of the fetch that produced it, if
/// that fetch failed. On failure `value` is the previous view.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewResult<T> {
    pub value: T,
    pub error: Option<SyncError>,
}

impl<T> ViewResult<T> {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Which resources a confirmation refresh reloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefreshScope {
    Collection,
    Everything,
}

struct RepositoryInner {
    api: Arc<dyn RecordsApi>,
    collection: TtlStore<CacheKey, Vec<Record>>,
    aggregate: TtlStore<CacheKey, AggregateSnapshot>,
    view: Mutex<LiveView>,
    revision: watch::Sender<u64>,
    config: RepositoryConfig,
}

/// Shared handle to the record mirror. Clones refer to the same view.
#[derive(Clone)]
pub struct RecordRepository {
    inner: Arc<RepositoryInner>,
}

impl RecordRepository {
    pub fn new(api: Arc<dyn RecordsApi>, config: RepositoryConfig) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            inner: Arc::new(RepositoryInner {
                api,
                collection: TtlStore::new(),
                aggregate: TtlStore::new(),
                view: Mutex::new(LiveView::new(config.reconcile)),
                revision,
                config,
            }),
        }
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.inner.config
    }

    /// Load the collection, serving a fresh cached copy unless `force_refresh`.
    pub async fn fetch_collection(&self, force_refresh: bool) -> ViewResult<Vec<Record>> {
        let inner = Arc::clone(&self.inner);
        let fetched = self
            .inner
            .collection
            .get(
                CacheKey::Collection,
                self.inner.config.cache.collection_ttl,
                move || async move {
                    let records = inner.api.list_records().await?;
                    inner.mutate(|view| {
                        view.replace_all(records.clone());
                        ((), true)
                    });
                    Ok::<_, SyncError>(records)
                },
                force_refresh,
            )
            .await;

        if let Some(error) = &fetched.error {
            warn!(error = %error, "Collection fetch failed; serving previous view");
        }
        ViewResult {
            value: self.records(),
            error: fetched.error,
        }
    }

    /// Load the aggregate, serving a fresh cached copy unless `force_refresh`.
    pub async fn fetch_aggregate(&self, force_refresh: bool) -> ViewResult<AggregateSnapshot> {
        let inner = Arc::clone(&self.inner);
        let fetched = self
            .inner
            .aggregate
            .get(
                CacheKey::Aggregate,
                self.inner.config.cache.aggregate_ttl,
                move || async move {
                    let snapshot = inner.api.statistics().await?;
                    inner.mutate(|view| ((), view.replace_aggregate(snapshot.clone())));
                    Ok::<_, SyncError>(snapshot)
                },
                force_refresh,
            )
            .await;

        if let Some(error) = &fetched.error {
            warn!(error = %error, "Aggregate fetch failed; serving previous view");
        }
        ViewResult {
            value: self.aggregate(),
            error: fetched.error,
        }
    }

    /// Create a record. When the backend echoes the stored record it is merged
    /// into the view and counted immediately.
    pub async fn create(&self, data: NewRecord) -> Result<CreateResponse, SyncError> {
        validate_new_record(&data)?;

        let response = self
            .inner
            .api
            .create_record(&data)
            .await
            .inspect_err(|error| warn!(error = %error, "Create request failed"))?;

        match response.record.clone() {
            Some(record) => {
                let id = record.id;
                let inserted = self.inner.mutate(|view| {
                    let changed = view.record_created(record);
                    (changed, changed)
                });
                info!(record_id = id, inserted, "Record created");
            }
            None => debug!("Create response carried no record"),
        }
        self.schedule_confirm_refresh(RefreshScope::Everything);
        Ok(response)
    }

    /// Apply `patch` to record `id`. The change is visible before the request
    /// completes and is reverted if it fails.
    pub async fn update(&self, id: RecordId, patch: RecordPatch) -> Result<MutationAck, SyncError> {
        validate_patch(&patch)?;

        let update = self.inner.mutate(|view| {
            let update = view.begin_update(id, &patch);
            let changed = update.optimistic.is_some();
            (update, changed)
        });

        match self.inner.api.update_record(id, &patch).await {
            Ok(ack) => {
                self.inner.mutate(|view| {
                    view.commit_update(&update);
                    let changed = ack
                        .record
                        .clone()
                        .is_some_and(|record| view.apply_updated(record));
                    ((), changed)
                });
                debug!(record_id = id, "Update confirmed");
                self.schedule_confirm_refresh(RefreshScope::Collection);
                Ok(ack)
            }
            Err(error) => {
                let reverted = self.inner.mutate(|view| {
                    let reverted = view.rollback_update(&update);
                    (reverted, reverted)
                });
                counter!(METRIC_OPTIMISTIC_ROLLBACK, "op" => "update").increment(1);
                warn!(record_id = id, reverted, error = %error, "Update failed; optimistic change rolled back");
                Err(error)
            }
        }
    }

    /// Delete record `id`. It leaves the view and the total before the request
    /// completes and is restored if it fails.
    pub async fn delete(&self, id: RecordId) -> Result<MutationAck, SyncError> {
        let delete = self.inner.mutate(|view| {
            let delete = view.begin_delete(id);
            let changed = delete.removed.is_some() || delete.delta.total > 0;
            (delete, changed)
        });

        match self.inner.api.delete_record(id).await {
            Ok(ack) => {
                self.inner.mutate(|view| {
                    view.commit_delete(&delete);
                    ((), false)
                });
                debug!(record_id = id, "Delete confirmed");
                self.schedule_confirm_refresh(RefreshScope::Everything);
                Ok(ack)
            }
            Err(error) => {
                let restored = self.inner.mutate(|view| {
                    let restored = view.rollback_delete(&delete);
                    (restored, restored)
                });
                counter!(METRIC_OPTIMISTIC_ROLLBACK, "op" => "delete").increment(1);
                warn!(record_id = id, restored, error = %error, "Delete failed; optimistic removal rolled back");
                Err(error)
            }
        }
    }

    /// Decode and apply one push event. Returns whether the view changed.
    pub fn apply_event(&self, event: &str, payload: &Value) -> bool {
        match RealtimeDelta::decode(event, payload) {
            Ok(Some(delta)) => {
                let changed = self.inner.mutate(|view| {
                    let changed = view.apply(delta);
                    (changed, changed)
                });
                debug!(event, changed, "Push delta applied");
                changed
            }
            Ok(None) => {
                debug!(event, "Ignoring unrecognised push event");
                false
            }
            Err(error) => {
                warn!(event, error = %error, "Dropping undecodable push event");
                false
            }
        }
    }

    /// Route the channel's record events into this repository. The returned
    /// subscriptions detach it again.
    pub fn attach(&self, channel: &RealtimeChannel) -> Vec<Subscription> {
        RealtimeDelta::event_names()
            .into_iter()
            .map(|event| {
                let weak: Weak<RepositoryInner> = Arc::downgrade(&self.inner);
                channel.subscribe(event, move |payload: &Value| {
                    if let Some(inner) = weak.upgrade() {
                        RecordRepository { inner }.apply_event(event, payload);
                    }
                })
            })
            .collect()
    }

    pub fn records(&self) -> Vec<Record> {
        self.inner.view().records().to_vec()
    }

    pub fn aggregate(&self) -> AggregateSnapshot {
        self.inner.view().aggregate().clone()
    }

    pub fn record(&self, id: RecordId) -> Option<Record> {
        self.inner.view().record(id).cloned()
    }

    /// The `limit` most recently created records, newest first.
    pub fn recent(&self, limit: usize) -> Vec<Record> {
        newest_first(self.inner.view().records(), limit)
    }

    /// [`RecordRepository::recent`] with the configured limit.
    pub fn recent_default(&self) -> Vec<Record> {
        self.recent(self.inner.config.recent_limit)
    }

    pub fn is_loaded(&self) -> bool {
        self.inner.view().is_loaded()
    }

    pub fn is_pending(&self, id: RecordId) -> bool {
        self.inner.view().is_pending(id)
    }

    /// Drop both cached entries so the next fetches reload.
    pub fn invalidate(&self) {
        self.clear_collection_cache();
        self.clear_aggregate_cache();
    }

    pub fn clear_collection_cache(&self) {
        self.inner.collection.invalidate(&CacheKey::Collection);
    }

    pub fn clear_aggregate_cache(&self) {
        self.inner.aggregate.invalidate(&CacheKey::Aggregate);
    }

    /// Non-forced refresh of both views: only stale entries hit the backend.
    /// Failures are logged and leave the view as it was.
    pub async fn refresh_stale(&self) {
        let (collection, aggregate) =
            futures::join!(self.fetch_collection(false), self.fetch_aggregate(false));
        if let Some(error) = collection.error {
            warn!(error = %error, "Collection refresh failed");
        }
        if let Some(error) = aggregate.error {
            warn!(error = %error, "Aggregate refresh failed");
        }
    }

    /// Run [`Self::refresh_stale`] on its own task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn_refresh(&self) -> JoinHandle<()> {
        let repository = self.clone();
        tokio::spawn(async move { repository.refresh_stale().await })
    }

    /// Counter bumped on every change to the view.
    pub fn revision(&self) -> u64 {
        *self.inner.revision.borrow()
    }

    pub fn watch_revision(&self) -> watch::Receiver<u64> {
        self.inner.revision.subscribe()
    }

    fn schedule_confirm_refresh(&self, scope: RefreshScope) {
        let delay = self.inner.config.confirm_refresh_delay;
        if delay.is_zero() {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let repository = RecordRepository { inner };
            debug!(?scope, "Running confirmation refresh");
            match scope {
                RefreshScope::Collection => {
                    repository.fetch_collection(true).await;
                }
                RefreshScope::Everything => {
                    futures::join!(
                        repository.fetch_collection(true),
                        repository.fetch_aggregate(true)
                    );
                }
            }
        });
    }
}

impl RepositoryInner {
    fn view(&self) -> std::sync::MutexGuard<'_, LiveView> {
        mutex_lock(&self.view, SOURCE, "view")
    }

    /// Run `apply` against the view; bump the revision when it reports a change.
    fn mutate<T>(&self, apply: impl FnOnce(&mut LiveView) -> (T, bool)) -> T {
        let (value, changed) = {
            let mut view = self.view();
            apply(&mut view)
        };
        if changed {
            self.revision.send_modify(|revision| *revision += 1);
        }
        value
    }
}
