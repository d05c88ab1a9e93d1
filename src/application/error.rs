use thiserror::Error;

use crate::{config::LoadError, domain::error::DomainError, infra::error::InfraError};

/// Failure of a backend call or of the push channel.
///
/// Cloneable so one coalesced failure can be handed to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("network error: {0}")]
    Network(String),
    #[error("http error: status {status}")]
    Http { status: u16, body: String },
    #[error("malformed payload: {0}")]
    Parse(String),
    #[error("push channel error: {0}")]
    Channel(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl SyncError {
    pub fn network(err: impl std::fmt::Display) -> Self {
        Self::Network(err.to_string())
    }

    pub fn http(status: u16, body: impl Into<String>) -> Self {
        Self::Http {
            status,
            body: body.into(),
        }
    }

    pub fn parse(err: impl std::fmt::Display) -> Self {
        Self::Parse(err.to_string())
    }

    pub fn channel(err: impl std::fmt::Display) -> Self {
        Self::Channel(err.to_string())
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Status code of an HTTP failure, if this is one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// True for 401/403 responses, which usually mean the session expired.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self.status(), Some(401 | 403))
    }
}

impl From<DomainError> for SyncError {
    fn from(error: DomainError) -> Self {
        Self::InvalidInput(error.to_string())
    }
}

/// Top-level error of the `sentinel-sync` binary.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Config(#[from] LoadError),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }
}
