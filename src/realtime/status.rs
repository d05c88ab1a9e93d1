//! Connection state reported by the real-time channel.

use serde::Serialize;
use time::OffsetDateTime;

use crate::domain::HealthReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        }
    }
}

/// Snapshot of the channel published to status watchers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// When the last successful health probe completed.
    #[serde(with = "sentinel_api_types::instant::option")]
    pub last_ping: Option<OffsetDateTime>,
    pub health: Option<HealthReport>,
    pub last_error: Option<String>,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            last_ping: None,
            health: None,
            last_error: None,
        }
    }
}
