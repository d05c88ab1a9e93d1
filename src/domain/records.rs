//! Validation rules for record payloads.
//!
//! Limits mirror the backend's column widths so oversized input is rejected
//! before it costs a round trip.

use sentinel_api_types::{NewRecord, Record, RecordPatch};

use super::error::DomainError;

pub const MAX_SNOWFLAKE_LEN: usize = 20;
pub const MAX_NAME_LEN: usize = 50;
pub const MAX_REASON_LEN: usize = 200;
pub const MAX_CAPTURED_MESSAGE_LEN: usize = 500;

pub fn validate_patch(patch: &RecordPatch) -> Result<(), DomainError> {
    if patch.is_empty() {
        return Err(DomainError::validation("patch does not set any field"));
    }
    if let Some(reason) = &patch.reason {
        check_len("reason", reason, MAX_REASON_LEN)?;
    }
    if let Some(message) = &patch.captured_message {
        check_len("capturedMessage", message, MAX_CAPTURED_MESSAGE_LEN)?;
    }
    Ok(())
}

pub fn validate_new_record(record: &NewRecord) -> Result<(), DomainError> {
    check_required("memberId", &record.member_id, MAX_SNOWFLAKE_LEN)?;
    check_required("serverId", &record.server_id, MAX_SNOWFLAKE_LEN)?;
    check_required("username", &record.username, MAX_NAME_LEN)?;
    check_required("serverName", &record.server_name, MAX_NAME_LEN)?;
    if let Some(display_name) = &record.display_name {
        check_len("displayName", display_name, MAX_NAME_LEN)?;
    }
    if let Some(reason) = &record.reason {
        check_len("reason", reason, MAX_REASON_LEN)?;
    }
    check_len(
        "capturedMessage",
        &record.captured_message,
        MAX_CAPTURED_MESSAGE_LEN,
    )
}

/// The `limit` most recently created records, newest first.
pub fn newest_first(records: &[Record], limit: usize) -> Vec<Record> {
    let mut sorted = records.to_vec();
    sorted.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
    sorted.truncate(limit);
    sorted
}

fn check_required(field: &str, value: &str, max: usize) -> Result<(), DomainError> {
    if value.trim().is_empty() {
        return Err(DomainError::validation(format!("`{field}` is required")));
    }
    check_len(field, value, max)
}

fn check_len(field: &str, value: &str, max: usize) -> Result<(), DomainError> {
    if value.chars().count() > max {
        return Err(DomainError::validation(format!(
            "`{field}` exceeds {max} characters"
        )));
    }
    Ok(())
}
