//! Error types for storage, remote store access, and local validation.
use std::time::Duration;
use thiserror::Error;

/// Server-side storage and domain error type.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] redb::Error),

    #[error("Storage error: {0}")]
    StorageMessage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Not found")]
    NotFound,

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Version conflict: expected {expected}, current {current}")]
    Conflict { expected: u64, current: u64 },

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Rate limited")]
    RateLimited { retry_after: Duration },

    #[error("Internal server error")]
    Internal,
}

impl From<redb::DatabaseError> for AppError {
    fn from(value: redb::DatabaseError) -> Self {
        Self::Database(value.into())
    }
}

impl From<redb::TransactionError> for AppError {
    fn from(value: redb::TransactionError) -> Self {
        Self::Database(value.into())
    }
}

impl From<redb::TableError> for AppError {
    fn from(value: redb::TableError) -> Self {
        Self::Database(value.into())
    }
}

impl From<redb::StorageError> for AppError {
    fn from(value: redb::StorageError) -> Self {
        Self::Database(value.into())
    }
}

impl From<redb::CommitError> for AppError {
    fn from(value: redb::CommitError) -> Self {
        Self::Database(value.into())
    }
}

/// Failure reported by a remote document store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("document not found")]
    NotFound,

    #[error("version conflict (server is at version {current_version})")]
    Conflict { current_version: u64 },

    #[error("network error: {0}")]
    Network(String),

    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Coarse classification of a store failure, used to pick recovery behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Session is no longer valid; tear everything down.
    Unauthorized,
    /// Server asked us to slow down; back off exponentially.
    RateLimited,
    /// Someone else wrote a newer version.
    Conflict,
    /// Server answered but the payload was unusable.
    InvalidResponse,
    /// Anything else that may succeed on retry.
    Transient,
}

impl StoreError {
    /// Classify this error for retry and teardown decisions.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Unauthorized => FailureKind::Unauthorized,
            Self::RateLimited { .. } => FailureKind::RateLimited,
            Self::Conflict { .. } => FailureKind::Conflict,
            Self::InvalidResponse(_) => FailureKind::InvalidResponse,
            Self::NotFound | Self::Network(_) | Self::Server { .. } => FailureKind::Transient,
        }
    }
}

/// Local validation and session errors surfaced to editor code.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("document id is missing")]
    MissingId,

    #[error("document '{0}' is not loaded")]
    UnknownDocument(String),

    #[error("document '{0}' has no version number")]
    MissingVersion(String),

    #[error("malformed content: {0}")]
    MalformedContent(String),

    #[error("content size {size} exceeds maximum of {max} bytes")]
    ContentTooLarge { size: usize, max: usize },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::{FailureKind, StoreError};
    use std::time::Duration;

    #[test]
    fn store_error_kinds_drive_recovery_policy() {
        let cases = [
            (StoreError::Unauthorized, FailureKind::Unauthorized),
            (
                StoreError::RateLimited {
                    retry_after: Some(Duration::from_secs(3)),
                },
                FailureKind::RateLimited,
            ),
            (
                StoreError::Conflict { current_version: 4 },
                FailureKind::Conflict,
            ),
            (
                StoreError::InvalidResponse("missing id".to_string()),
                FailureKind::InvalidResponse,
            ),
            (StoreError::NotFound, FailureKind::Transient),
            (
                StoreError::Network("connection reset".to_string()),
                FailureKind::Transient,
            ),
            (
                StoreError::Server {
                    status: 503,
                    message: "unavailable".to_string(),
                },
                FailureKind::Transient,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(err.kind(), expected, "error: {}", err);
        }
    }
}
