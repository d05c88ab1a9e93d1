//! Wire types shared by the Sentinel backend and its clients.
//!
//! Field names follow the backend's camelCase JSON. Push-event payloads accept
//! both the current and the legacy key names so older emitters keep working.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use time::OffsetDateTime;

/// Identifier of a moderation record.
pub type RecordId = i64;

/// Push-event names understood by clients.
pub mod events {
    pub const NEW_RECORD: &str = "new-record";
    pub const RECORD_REMOVED: &str = "record-removed";
    pub const RECORD_UPDATED: &str = "record-updated";
    pub const STATS_UPDATE: &str = "stats-update";

    pub const LEGACY_NEW_RECORD: &str = "new-ban";
    pub const LEGACY_RECORD_REMOVED: &str = "ban-removed";
    pub const LEGACY_RECORD_UPDATED: &str = "ban-updated";
}

/// A single moderation record as served by the collection endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    #[serde(rename = "banId")]
    pub id: RecordId,
    #[serde(default, deserialize_with = "nullable_string")]
    pub reason: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub captured_message: String,
    pub member_id: String,
    pub server_id: String,
    #[serde(with = "instant")]
    pub created_at: OffsetDateTime,
}

/// One bucket of the statistics trend series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrendPoint {
    #[serde(rename = "month")]
    pub period: String,
    pub count: u64,
}

/// Server-computed statistics over the whole collection.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregateSnapshot {
    #[serde(rename = "totalBans")]
    pub total: u64,
    #[serde(rename = "totalBansToday")]
    pub today: u64,
    #[serde(rename = "totalBansMonth")]
    pub this_month: u64,
    #[serde(rename = "totalBansYear")]
    pub this_year: u64,
    #[serde(rename = "totalServers")]
    pub servers: u64,
    #[serde(rename = "totalMembers")]
    pub members: u64,
    #[serde(rename = "monthlyTrend")]
    pub trend: Vec<TrendPoint>,
    #[serde(rename = "currentServerTime", with = "instant::option")]
    pub server_time: Option<OffsetDateTime>,
}

/// Body of `GET` on the collection endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectionEnvelope {
    #[serde(default)]
    pub bans: Vec<Record>,
}

/// Payload accepted by `POST` on the collection endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewRecord {
    pub member_id: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub server_id: String,
    pub server_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub captured_message: String,
}

/// Response to a creation request; `ban` is present when the backend echoes
/// the stored record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateResponse {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, rename = "ban")]
    pub record: Option<Record>,
}

/// Confirmation returned by update and delete requests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationAck {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, rename = "ban")]
    pub record: Option<Record>,
}

/// Partial update of a record. Only the fields that are set are sent and
/// applied; everything else on the record is left as it was.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RecordPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub captured_message: Option<String>,
}

impl RecordPatch {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    #[must_use]
    pub fn captured_message(mut self, message: impl Into<String>) -> Self {
        self.captured_message = Some(message.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.reason.is_none() && self.captured_message.is_none()
    }

    /// Parse a patch from arbitrary JSON, rejecting unknown fields.
    pub fn from_json(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// Fold a later patch over this one; fields `later` sets win.
    pub fn merge(&mut self, later: &RecordPatch) {
        if later.reason.is_some() {
            self.reason.clone_from(&later.reason);
        }
        if later.captured_message.is_some() {
            self.captured_message.clone_from(&later.captured_message);
        }
    }

    pub fn apply(&self, record: &mut Record) {
        if let Some(reason) = &self.reason {
            record.reason.clone_from(reason);
        }
        if let Some(message) = &self.captured_message {
            record.captured_message.clone_from(message);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentState {
    Connected,
    Disconnected,
    Degraded,
}

/// Body of the health-check endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    #[serde(default)]
    pub components: BTreeMap<String, ComponentState>,
}

/// Payload of `new-record` and `record-updated`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordPayload {
    #[serde(alias = "ban")]
    pub record: Record,
}

/// Payload of `record-removed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovalPayload {
    #[serde(alias = "ban_id", alias = "banId")]
    pub id: RecordId,
}

/// Payload of `stats-update`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsPayload {
    pub stats: AggregateSnapshot,
}

fn nullable_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// Timestamps are written as RFC 3339. Reading also accepts offset-less
/// ISO 8601 values, which are taken to be UTC.
pub mod instant {
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _, ser::Error as _};
    use time::{
        OffsetDateTime, PrimitiveDateTime,
        format_description::well_known::{Iso8601, Rfc3339},
    };

    pub fn parse(raw: &str) -> Result<OffsetDateTime, time::error::Parse> {
        OffsetDateTime::parse(raw, &Rfc3339).or_else(|rfc_err| {
            PrimitiveDateTime::parse(raw, &Iso8601::DEFAULT)
                .map(PrimitiveDateTime::assume_utc)
                .map_err(|_| rfc_err)
        })
    }

    pub fn serialize<S>(value: &OffsetDateTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let text = value.format(&Rfc3339).map_err(S::Error::custom)?;
        serializer.serialize_str(&text)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<OffsetDateTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(D::Error::custom)
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use time::OffsetDateTime;

        #[allow(clippy::ref_option)]
        pub fn serialize<S>(value: &Option<OffsetDateTime>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match value {
                Some(value) => super::serialize(value, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<OffsetDateTime>, D::Error>
        where
            D: Deserializer<'de>,
        {
            match Option::<String>::deserialize(deserializer)? {
                Some(raw) => super::parse(&raw)
                    .map(Some)
                    .map_err(serde::de::Error::custom),
                None => Ok(None),
            }
        }
    }
}
