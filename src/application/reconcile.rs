//! The live view merged from bulk snapshots, optimistic mutations and push
//! deltas.
//!
//! Precedence for one id: a bulk snapshot replaces the whole collection, then
//! pending local work is merged back over it; upserts replace by id; removals
//! filter by id and tolerate unknown ids. Aggregate counters move only when the
//! view itself changes, and never below zero.

use std::collections::{HashMap, HashSet};

use metrics::counter;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::application::error::SyncError;
use crate::domain::calendar::CalendarWindow;
use crate::domain::{AggregateSnapshot, Record, RecordId, RecordPatch};
use sentinel_api_types::{RecordPayload, RemovalPayload, StatsPayload, events};

const METRIC_DECODE_ERROR: &str = "sentinel_realtime_decode_error_total";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileOptions {
    /// Also decrement `today`/`this_month` when a removed record was created
    /// in the current UTC day/month.
    pub decrement_dated_counters: bool,
}

impl From<&crate::config::ReconcileSettings> for ReconcileOptions {
    fn from(settings: &crate::config::ReconcileSettings) -> Self {
        Self {
            decrement_dated_counters: settings.decrement_dated_counters,
        }
    }
}

/// A push event decoded into the change it describes.
#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeDelta {
    Created(Record),
    Updated(Record),
    Removed(RecordId),
    Stats(AggregateSnapshot),
}

impl RealtimeDelta {
    /// Decode a named push event. Unknown event names yield `Ok(None)`.
    pub fn decode(event: &str, payload: &Value) -> Result<Option<Self>, SyncError> {
        let delta = match event {
            events::NEW_RECORD | events::LEGACY_NEW_RECORD => {
                Self::Created(decode_payload::<RecordPayload>(event, payload)?.record)
            }
            events::RECORD_UPDATED | events::LEGACY_RECORD_UPDATED => {
                Self::Updated(decode_payload::<RecordPayload>(event, payload)?.record)
            }
            events::RECORD_REMOVED | events::LEGACY_RECORD_REMOVED => {
                Self::Removed(decode_payload::<RemovalPayload>(event, payload)?.id)
            }
            events::STATS_UPDATE => Self::Stats(decode_payload::<StatsPayload>(event, payload)?.stats),
            _ => return Ok(None),
        };
        Ok(Some(delta))
    }

    /// Every event name [`RealtimeDelta::decode`] understands.
    pub fn event_names() -> [&'static str; 7] {
        [
            events::NEW_RECORD,
            events::RECORD_UPDATED,
            events::RECORD_REMOVED,
            events::STATS_UPDATE,
            events::LEGACY_NEW_RECORD,
            events::LEGACY_RECORD_UPDATED,
            events::LEGACY_RECORD_REMOVED,
        ]
    }
}

fn decode_payload<T: serde::de::DeserializeOwned>(
    event: &str,
    payload: &Value,
) -> Result<T, SyncError> {
    T::deserialize(payload).map_err(|error| {
        counter!(METRIC_DECODE_ERROR, "event" => event.to_string()).increment(1);
        SyncError::parse(format!("`{event}` payload: {error}"))
    })
}

/// Amounts actually applied to the aggregate counters, so a rollback can undo
/// exactly what was done.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterDelta {
    pub total: u64,
    pub today: u64,
    pub this_month: u64,
}

impl CounterDelta {
    fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

/// Identifies one optimistic operation's pending marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingToken(u64);

#[derive(Debug, Clone)]
enum PendingOp {
    Created(Record),
    Updated(RecordPatch),
    Removed,
}

#[derive(Debug, Clone)]
struct PendingMark {
    token: PendingToken,
    op: PendingOp,
}

/// Outcome of inserting a record by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Replaced,
    /// The id has a local delete in flight.
    Suppressed,
}

/// Handle for an optimistic update, used to commit or revert it.
#[derive(Debug, Clone)]
pub struct OptimisticUpdate {
    pub token: PendingToken,
    pub id: RecordId,
    pub previous: Option<Record>,
    pub optimistic: Option<Record>,
}

/// Handle for an optimistic delete, used to commit or revert it.
#[derive(Debug, Clone)]
pub struct OptimisticDelete {
    pub token: PendingToken,
    pub id: RecordId,
    pub removed: Option<(usize, Record)>,
    pub delta: CounterDelta,
}

/// The authoritative in-memory collection and aggregate.
///
/// Counters move only when the collection does. A `new-record` for an id
/// already present replaces it without incrementing, and once a snapshot has
/// loaded, a `record-removed` for an unknown id leaves the counters alone.
/// So a replayed event never counts twice; a strict one-event-one-step rule
/// would drift the totals on every duplicate delivery. Before the first
/// snapshot every removal decrements, floored at zero.
#[derive(Debug)]
pub struct LiveView {
    records: Vec<Record>,
    aggregate: AggregateSnapshot,
    pending: HashMap<RecordId, PendingMark>,
    loaded: bool,
    next_token: u64,
    options: ReconcileOptions,
}

impl LiveView {
    pub fn new(options: ReconcileOptions) -> Self {
        Self {
            records: Vec::new(),
            aggregate: AggregateSnapshot::default(),
            pending: HashMap::new(),
            loaded: false,
            next_token: 0,
            options,
        }
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn aggregate(&self) -> &AggregateSnapshot {
        &self.aggregate
    }

    pub fn record(&self, id: RecordId) -> Option<&Record> {
        self.records.iter().find(|record| record.id == id)
    }

    /// Whether a bulk snapshot has been applied yet.
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn is_pending(&self, id: RecordId) -> bool {
        self.pending.contains_key(&id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Replace the collection with a server snapshot, then merge pending local
    /// work back over it.
    pub fn replace_all(&mut self, snapshot: Vec<Record>) {
        let mut records: Vec<Record> = Vec::with_capacity(snapshot.len());
        let mut positions: HashMap<RecordId, usize> = HashMap::with_capacity(snapshot.len());
        for record in snapshot {
            match positions.get(&record.id) {
                Some(&index) => records[index] = record,
                None => {
                    positions.insert(record.id, records.len());
                    records.push(record);
                }
            }
        }

        let present: HashSet<RecordId> = positions.into_keys().collect();
        let confirmed = self.pending.len();
        self.pending
            .retain(|id, mark| !(matches!(mark.op, PendingOp::Created(_)) && present.contains(id)));
        let confirmed = confirmed - self.pending.len();

        records.retain(|record| {
            !matches!(
                self.pending.get(&record.id),
                Some(PendingMark {
                    op: PendingOp::Removed,
                    ..
                })
            )
        });
        for record in &mut records {
            if let Some(PendingMark {
                op: PendingOp::Updated(patch),
                ..
            }) = self.pending.get(&record.id)
            {
                patch.apply(record);
            }
        }

        let mut unconfirmed: Vec<Record> = self
            .pending
            .values()
            .filter_map(|mark| match &mark.op {
                PendingOp::Created(record) => Some(record.clone()),
                _ => None,
            })
            .collect();
        unconfirmed.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        let remerged = unconfirmed.len();
        unconfirmed.append(&mut records);

        info!(
            records = unconfirmed.len(),
            confirmed, remerged, "Collection replaced from snapshot"
        );
        self.records = unconfirmed;
        self.loaded = true;
    }

    /// Replace the aggregate wholesale. Returns whether anything changed.
    pub fn replace_aggregate(&mut self, snapshot: AggregateSnapshot) -> bool {
        if self.aggregate == snapshot {
            return false;
        }
        self.aggregate = snapshot;
        true
    }

    /// Insert `record`, or replace the record with the same id in place.
    pub fn upsert(&mut self, mut record: Record) -> Upsert {
        match self.pending.get(&record.id).map(|mark| &mark.op) {
            Some(PendingOp::Removed) => return Upsert::Suppressed,
            Some(PendingOp::Updated(patch)) => patch.apply(&mut record),
            _ => {}
        }
        match self.records.iter_mut().find(|existing| existing.id == record.id) {
            Some(existing) => {
                *existing = record;
                Upsert::Replaced
            }
            None => {
                self.records.insert(0, record);
                Upsert::Inserted
            }
        }
    }

    /// Filter `id` out of the collection. Unknown ids are a no-op.
    pub fn remove(&mut self, id: RecordId) -> Option<(usize, Record)> {
        let index = self.records.iter().position(|record| record.id == id)?;
        Some((index, self.records.remove(index)))
    }

    /// Apply a decoded push event. Returns whether the view changed.
    pub fn apply(&mut self, delta: RealtimeDelta) -> bool {
        match delta {
            RealtimeDelta::Created(record) => self.apply_new(record),
            RealtimeDelta::Updated(record) => self.apply_updated(record),
            RealtimeDelta::Removed(id) => self.apply_removed(id),
            RealtimeDelta::Stats(stats) => self.replace_aggregate(stats),
        }
    }

    pub fn apply_new(&mut self, record: Record) -> bool {
        let id = record.id;
        self.confirm_created(id);
        match self.upsert(record) {
            Upsert::Inserted => {
                self.increment();
                true
            }
            Upsert::Replaced => {
                debug!(record_id = id, "Duplicate new record merged by id");
                true
            }
            Upsert::Suppressed => false,
        }
    }

    pub fn apply_updated(&mut self, record: Record) -> bool {
        let id = record.id;
        self.confirm_created(id);
        self.upsert(record) != Upsert::Suppressed
    }

    pub fn apply_removed(&mut self, id: RecordId) -> bool {
        if let Some(mark) = self.pending.remove(&id) {
            debug!(record_id = id, op = ?mark.op, "Removal settles pending local work");
        }
        let removed = self.remove(id);
        let delta = self.decrement(removed.as_ref().map(|(_, record)| record), CalendarWindow::now());
        removed.is_some() || !delta.is_zero()
    }

    /// Merge the record echoed by a successful create. Only a record that was
    /// not already visible moves the counters and is kept pending until the
    /// server confirms it.
    pub fn record_created(&mut self, record: Record) -> bool {
        let id = record.id;
        match self.upsert(record.clone()) {
            Upsert::Inserted => {
                self.increment();
                let token = self.next_token();
                self.pending.insert(
                    id,
                    PendingMark {
                        token,
                        op: PendingOp::Created(record),
                    },
                );
                true
            }
            Upsert::Replaced => true,
            Upsert::Suppressed => false,
        }
    }

    /// Apply `patch` to the record with `id` ahead of the network call.
    pub fn begin_update(&mut self, id: RecordId, patch: &RecordPatch) -> OptimisticUpdate {
        let token = self.next_token();
        let previous = self.record(id).cloned();
        let optimistic = previous.clone().map(|mut record| {
            patch.apply(&mut record);
            record
        });
        if let (Some(updated), Some(existing)) = (
            optimistic.clone(),
            self.records.iter_mut().find(|record| record.id == id),
        ) {
            *existing = updated;
        }
        match self.pending.get_mut(&id) {
            Some(PendingMark {
                op: PendingOp::Created(record),
                ..
            }) => patch.apply(record),
            Some(PendingMark {
                op: PendingOp::Removed,
                ..
            }) => {}
            Some(PendingMark {
                token: current,
                op: PendingOp::Updated(pending),
            }) => {
                pending.merge(patch);
                *current = token;
            }
            None => {
                self.pending.insert(
                    id,
                    PendingMark {
                        token,
                        op: PendingOp::Updated(patch.clone()),
                    },
                );
            }
        }
        OptimisticUpdate {
            token,
            id,
            previous,
            optimistic,
        }
    }

    pub fn commit_update(&mut self, update: &OptimisticUpdate) {
        self.clear_mark(update.id, update.token);
    }

    /// Revert an optimistic update. The previous copy is restored only while
    /// the view still shows the optimistic one, so newer server data wins.
    pub fn rollback_update(&mut self, update: &OptimisticUpdate) -> bool {
        self.clear_mark(update.id, update.token);
        let (Some(previous), Some(optimistic)) = (&update.previous, &update.optimistic) else {
            return false;
        };
        match self.records.iter_mut().find(|record| record.id == update.id) {
            Some(current) if current == optimistic => {
                *current = previous.clone();
                true
            }
            _ => false,
        }
    }

    /// Remove the record with `id` ahead of the network call.
    pub fn begin_delete(&mut self, id: RecordId) -> OptimisticDelete {
        let token = self.next_token();
        let created_locally = matches!(
            self.pending.get(&id).map(|mark| &mark.op),
            Some(PendingOp::Created(_))
        );
        let removed = self.remove(id);
        let delta = self.decrement(removed.as_ref().map(|(_, record)| record), CalendarWindow::now());
        if !created_locally {
            self.pending.insert(
                id,
                PendingMark {
                    token,
                    op: PendingOp::Removed,
                },
            );
        } else {
            self.pending.remove(&id);
        }
        OptimisticDelete {
            token,
            id,
            removed,
            delta,
        }
    }

    pub fn commit_delete(&mut self, delete: &OptimisticDelete) {
        self.clear_mark(delete.id, delete.token);
    }

    /// Revert an optimistic delete: reinsert the record where it was and give
    /// back the counters it took. Nothing is restored once a push event has
    /// already confirmed the removal.
    pub fn rollback_delete(&mut self, delete: &OptimisticDelete) -> bool {
        let ours = self
            .pending
            .get(&delete.id)
            .is_some_and(|mark| mark.token == delete.token);
        if !ours {
            return false;
        }
        self.pending.remove(&delete.id);

        if let Some((index, record)) = &delete.removed
            && self.record(delete.id).is_none()
        {
            let index = (*index).min(self.records.len());
            self.records.insert(index, record.clone());
        }
        self.aggregate.total += delete.delta.total;
        self.aggregate.today += delete.delta.today;
        self.aggregate.this_month += delete.delta.this_month;
        true
    }

    fn confirm_created(&mut self, id: RecordId) {
        if matches!(
            self.pending.get(&id).map(|mark| &mark.op),
            Some(PendingOp::Created(_))
        ) {
            self.pending.remove(&id);
            debug!(record_id = id, "Locally created record confirmed");
        }
    }

    fn clear_mark(&mut self, id: RecordId, token: PendingToken) {
        if self.pending.get(&id).is_some_and(|mark| mark.token == token) {
            self.pending.remove(&id);
        }
    }

    fn next_token(&mut self) -> PendingToken {
        self.next_token += 1;
        PendingToken(self.next_token)
    }

    fn increment(&mut self) {
        self.aggregate.total += 1;
        self.aggregate.today += 1;
        self.aggregate.this_month += 1;
    }

    /// Take one removal off the counters. Before the first snapshot every
    /// removal counts, since the view cannot tell which ids exist.
    fn decrement(&mut self, removed: Option<&Record>, window: CalendarWindow) -> CounterDelta {
        if removed.is_none() && self.loaded {
            return CounterDelta::default();
        }

        let mut delta = CounterDelta::default();
        if self.aggregate.total > 0 {
            self.aggregate.total -= 1;
            delta.total = 1;
        } else {
            warn!("Removal with total already at zero");
        }

        if let Some(record) = removed.filter(|_| self.options.decrement_dated_counters) {
            if window.same_day(record.created_at) && self.aggregate.today > 0 {
                self.aggregate.today -= 1;
                delta.today = 1;
            }
            if window.same_month(record.created_at) && self.aggregate.this_month > 0 {
                self.aggregate.this_month -= 1;
                delta.this_month = 1;
            }
        }
        delta
    }
}

impl Default for LiveView {
    fn default() -> Self {
        Self::new(ReconcileOptions::default())
    }
}
