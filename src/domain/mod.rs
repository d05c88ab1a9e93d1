//! Domain layer types and invariants.

pub mod calendar;
pub mod error;
pub mod records;

pub use sentinel_api_types::{
    AggregateSnapshot, ComponentState, CreateResponse, HealthReport, HealthStatus, MutationAck,
    NewRecord, Record, RecordId, RecordPatch, TrendPoint,
};
