//! Error types for the sync layer.

use meshkv_cluster::ClusterError;
use meshkv_storage::StorageError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Fencing or routing rejection.
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// Storage adapter failure.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Input validation failure; no state was changed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Protocol error (unexpected or malformed message).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The operation did not complete within its deadline.
    #[error("operation timed out")]
    Timeout,

    /// The peer is sending faster than we accept.
    #[error("rate limited")]
    RateLimited,

    /// Transport failure.
    #[error("network error: {0}")]
    Network(String),

    /// The peer channel is gone.
    #[error("channel closed")]
    ChannelClosed,
}

/// Wire-level error codes carried in response envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Fenced,
    UnknownPartition,
    Timeout,
    RateLimited,
    InvalidRequest,
}

impl SyncError {
    /// Maps the error onto its wire code.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            SyncError::Cluster(ClusterError::Fenced { .. }) => ErrorCode::Fenced,
            SyncError::Cluster(ClusterError::UnknownPartition(_)) => ErrorCode::UnknownPartition,
            SyncError::Timeout => ErrorCode::Timeout,
            SyncError::RateLimited => ErrorCode::RateLimited,
            _ => ErrorCode::InvalidRequest,
        }
    }
}
