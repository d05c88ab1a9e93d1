//! End-to-end properties of the sync layer: repository, cache and push channel
//! wired together over in-process fakes.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use sentinel_sync::application::error::SyncError;
use sentinel_sync::application::repos::{HealthProbe, RecordsApi};
use sentinel_sync::application::repository::{RecordRepository, RepositoryConfig};
use sentinel_sync::cache::CacheConfig;
use sentinel_sync::domain::{
    AggregateSnapshot, CreateResponse, HealthReport, HealthStatus, MutationAck, NewRecord, Record,
    RecordId, RecordPatch,
};
use sentinel_sync::realtime::{ChannelConfig, ConnectionState, LocalEmitter, LocalTransport, RealtimeChannel};
use time::OffsetDateTime;
use tokio::sync::Notify;

fn record(id: RecordId) -> Record {
    Record {
        id,
        reason: "spam".to_string(),
        captured_message: String::new(),
        member_id: format!("member-{id}"),
        server_id: "guild".to_string(),
        created_at: OffsetDateTime::now_utc(),
    }
}

fn new_record() -> NewRecord {
    NewRecord {
        member_id: "member-42".into(),
        username: "spammer".into(),
        display_name: None,
        server_id: "guild".into(),
        server_name: "Guild".into(),
        reason: Some("spam".into()),
        captured_message: String::new(),
    }
}

/// Backend double counting every call. When `hold` is set, reads and
/// mutations park until released.
#[derive(Default)]
struct FakeBackend {
    records: Mutex<Vec<Record>>,
    total: Mutex<u64>,
    list_calls: AtomicUsize,
    stats_calls: AtomicUsize,
    mutation_calls: AtomicUsize,
    hold: AtomicBool,
    release: Notify,
}

impl FakeBackend {
    fn seeded(records: Vec<Record>, total: u64) -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(records),
            total: Mutex::new(total),
            ..Self::default()
        })
    }

    async fn maybe_hold(&self) {
        if self.hold.load(Ordering::SeqCst) {
            self.release.notified().await;
        }
    }

    fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    fn stats_calls(&self) -> usize {
        self.stats_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordsApi for FakeBackend {
    async fn list_records(&self) -> Result<Vec<Record>, SyncError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.maybe_hold().await;
        Ok(self.records.lock().unwrap().clone())
    }

    async fn statistics(&self) -> Result<AggregateSnapshot, SyncError> {
        self.stats_calls.fetch_add(1, Ordering::SeqCst);
        Ok(AggregateSnapshot {
            total: *self.total.lock().unwrap(),
            ..AggregateSnapshot::default()
        })
    }

    async fn create_record(&self, _record: &NewRecord) -> Result<CreateResponse, SyncError> {
        self.mutation_calls.fetch_add(1, Ordering::SeqCst);
        Ok(CreateResponse {
            message: Some("Ban created successfully".into()),
            record: Some(record(42)),
        })
    }

    async fn update_record(
        &self,
        _id: RecordId,
        _patch: &RecordPatch,
    ) -> Result<MutationAck, SyncError> {
        self.mutation_calls.fetch_add(1, Ordering::SeqCst);
        self.maybe_hold().await;
        Ok(MutationAck::default())
    }

    async fn delete_record(&self, _id: RecordId) -> Result<MutationAck, SyncError> {
        self.mutation_calls.fetch_add(1, Ordering::SeqCst);
        Ok(MutationAck::default())
    }
}

struct HealthyProbe;

#[async_trait]
impl HealthProbe for HealthyProbe {
    async fn check(&self) -> Result<HealthReport, SyncError> {
        Ok(HealthReport {
            status: HealthStatus::Healthy,
            components: Default::default(),
        })
    }
}

fn repository(api: Arc<FakeBackend>) -> RecordRepository {
    RecordRepository::new(
        api,
        RepositoryConfig {
            cache: CacheConfig {
                collection_ttl: Duration::from_secs(300),
                aggregate_ttl: Duration::from_secs(300),
            },
            confirm_refresh_delay: Duration::ZERO,
            ..RepositoryConfig::default()
        },
    )
}

fn connected_channel() -> (RealtimeChannel, LocalEmitter) {
    let (transport, emitter) = LocalTransport::new();
    let channel = RealtimeChannel::new(
        Arc::new(transport),
        Arc::new(HealthyProbe),
        ChannelConfig::default(),
    );
    (channel, emitter)
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition reached in time");
}

#[tokio::test]
async fn concurrent_forced_fetches_share_one_request() {
    let api = FakeBackend::seeded(vec![record(1), record(2)], 2);
    api.hold.store(true, Ordering::SeqCst);
    let repo = repository(Arc::clone(&api));

    let callers: Vec<_> = (0..8)
        .map(|_| {
            let repo = repo.clone();
            tokio::spawn(async move { repo.fetch_collection(true).await })
        })
        .collect();
    wait_for(|| api.list_calls() == 1).await;
    tokio::task::yield_now().await;
    api.release.notify_waiters();

    let mut results = Vec::new();
    for caller in callers {
        results.push(caller.await.expect("caller task"));
    }

    assert_eq!(api.list_calls(), 1);
    assert!(results.iter().all(|result| result.is_ok()));
    assert!(results.windows(2).all(|pair| pair[0].value == pair[1].value));
    assert_eq!(results[0].value.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn freshness_window_gates_network_calls() {
    let api = FakeBackend::seeded(vec![record(1)], 1);
    let repo = repository(Arc::clone(&api));

    repo.fetch_collection(false).await;
    assert_eq!(api.list_calls(), 1);

    tokio::time::advance(Duration::from_secs(4 * 60)).await;
    repo.fetch_collection(false).await;
    assert_eq!(api.list_calls(), 1);

    tokio::time::advance(Duration::from_secs(2 * 60)).await;
    repo.fetch_collection(false).await;
    assert_eq!(api.list_calls(), 2);
}

#[tokio::test]
async fn duplicate_push_creations_leave_one_record() {
    let api = FakeBackend::seeded(Vec::new(), 0);
    let repo = repository(Arc::clone(&api));
    repo.fetch_collection(false).await;
    repo.fetch_aggregate(false).await;

    let (channel, emitter) = connected_channel();
    let _subscriptions = repo.attach(&channel);
    channel.connect();
    wait_for(|| channel.state() == ConnectionState::Connected).await;

    let payload = json!({ "record": serde_json::to_value(record(7)).unwrap() });
    let revision = repo.revision();
    assert!(emitter.emit("new-record", payload.clone()));
    assert!(emitter.emit("new-record", payload));
    wait_for(|| repo.revision() > revision).await;
    // Give the second frame time to land.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let sevens = repo.records().iter().filter(|r| r.id == 7).count();
    assert_eq!(sevens, 1);
    assert_eq!(repo.aggregate().total, 1);
}

#[tokio::test]
async fn removals_never_drive_total_negative() {
    let api = FakeBackend::seeded(vec![record(1)], 1);
    let repo = repository(Arc::clone(&api));
    repo.fetch_collection(false).await;
    repo.fetch_aggregate(false).await;

    for id in [1, 1, 2, 3] {
        repo.apply_event("record-removed", &json!({ "id": id }));
    }
    repo.apply_event("ban-removed", &json!({ "ban_id": 1 }));

    assert_eq!(repo.aggregate().total, 0);
    assert!(repo.records().is_empty());
}

#[tokio::test]
async fn optimistic_update_is_visible_before_the_request_resolves() {
    let api = FakeBackend::seeded(vec![record(5)], 1);
    let repo = repository(Arc::clone(&api));
    repo.fetch_collection(false).await;
    api.hold.store(true, Ordering::SeqCst);

    let pending = tokio::spawn({
        let repo = repo.clone();
        async move { repo.update(5, RecordPatch::new().reason("x")).await }
    });
    wait_for(|| api.mutation_calls.load(Ordering::SeqCst) == 1).await;

    assert_eq!(repo.record(5).map(|r| r.reason), Some("x".to_string()));

    api.release.notify_waiters();
    pending.await.expect("update task").expect("update succeeds");
    assert_eq!(repo.record(5).map(|r| r.reason), Some("x".to_string()));
}

#[tokio::test]
async fn fetch_create_then_push_removal() {
    let api = FakeBackend::seeded(vec![record(1), record(2)], 2);
    let repo = repository(Arc::clone(&api));

    let (first, second) = tokio::join!(repo.fetch_collection(false), repo.fetch_collection(false));
    assert_eq!(api.list_calls(), 1);
    assert_eq!(first.value, second.value);

    repo.fetch_aggregate(false).await;
    let stats_before = api.stats_calls();
    let total_before = repo.aggregate().total;

    let response = repo.create(new_record()).await.expect("create succeeds");
    assert_eq!(response.record.map(|r| r.id), Some(42));
    assert!(repo.record(42).is_some());
    assert_eq!(repo.aggregate().total, total_before + 1);
    assert_eq!(api.stats_calls(), stats_before);

    let (channel, emitter) = connected_channel();
    let _subscriptions = repo.attach(&channel);
    channel.connect();
    wait_for(|| channel.state() == ConnectionState::Connected).await;

    assert!(emitter.emit("record-removed", json!({ "id": 42 })));
    wait_for(|| repo.record(42).is_none()).await;
    assert_eq!(repo.aggregate().total, total_before);
    assert_eq!(api.stats_calls(), stats_before);
}

#[tokio::test]
async fn lost_channel_leaves_view_usable_and_reconnect_resumes_delivery() {
    let api = FakeBackend::seeded(vec![record(1)], 1);
    let repo = repository(Arc::clone(&api));
    repo.fetch_collection(false).await;

    let (channel, emitter) = connected_channel();
    let _subscriptions = repo.attach(&channel);
    channel.connect();
    wait_for(|| channel.state() == ConnectionState::Connected).await;

    emitter.fail(SyncError::channel("socket reset"));
    wait_for(|| channel.state() == ConnectionState::Disconnected).await;
    assert!(channel.status().last_error.is_some());

    let refreshed = repo.fetch_collection(true).await;
    assert!(refreshed.is_ok());
    assert_eq!(refreshed.value.len(), 1);

    channel.reconnect();
    wait_for(|| channel.state() == ConnectionState::Connected).await;
    assert_eq!(emitter.connections_opened(), 2);

    let payload = json!({ "ban": serde_json::to_value(record(3)).unwrap() });
    assert!(emitter.emit("new-ban", payload));
    wait_for(|| repo.record(3).is_some()).await;
}
