//! Core type definitions for MeshKV.
//!
//! This crate defines the fundamental types shared by every layer of the
//! sync core:
//! - Node, client, request and subscription identifiers
//! - Hybrid Logical Clock timestamps and the stateful node clock
//! - Journal events (the unit of replication and fan-out)
//!
//! Everything above this crate (CRDT maps, the journal, the Merkle trees,
//! the sync protocol) speaks in these types; nothing here depends on the
//! rest of the workspace.

mod event;
mod ids;
mod timestamp;

pub use event::{serde_u64_string, JournalEvent, JournalEventKind, NewJournalEvent};
pub use ids::{ClientId, NodeId, PartitionId, RequestId, SubscriptionId};
pub use timestamp::{HlcClock, HybridTimestamp, DEFAULT_MAX_DRIFT_MS};

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    /// A remote timestamp was further ahead of local physical time than
    /// the configured drift bound allows.
    #[error("timestamp {ahead_ms}ms ahead of local clock (bound {bound_ms}ms)")]
    TimestampDrift { ahead_ms: u64, bound_ms: u64 },
}
