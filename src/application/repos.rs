//! Traits describing the backend collaborators the sync engine talks to.

use async_trait::async_trait;

use crate::application::error::SyncError;
use crate::domain::{
    AggregateSnapshot, CreateResponse, HealthReport, MutationAck, NewRecord, Record, RecordId,
    RecordPatch,
};

/// REST surface of the record collection and its statistics.
#[async_trait]
pub trait RecordsApi: Send + Sync {
    async fn list_records(&self) -> Result<Vec<Record>, SyncError>;

    async fn statistics(&self) -> Result<AggregateSnapshot, SyncError>;

    async fn create_record(&self, record: &NewRecord) -> Result<CreateResponse, SyncError>;

    async fn update_record(
        &self,
        id: RecordId,
        patch: &RecordPatch,
    ) -> Result<MutationAck, SyncError>;

    async fn delete_record(&self, id: RecordId) -> Result<MutationAck, SyncError>;
}

/// Health-check endpoint probed by the real-time channel.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self) -> Result<HealthReport, SyncError>;
}
