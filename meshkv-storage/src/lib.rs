//! Storage adapter contract for MeshKV.
//!
//! The sync core does not persist anything itself; it writes through a
//! [`StorageAdapter`]. Records are addressed by `(partition, map, key)`
//! and scanned in key order per partition; a small metadata record
//! carries what a node must remember across restarts (its id, last
//! journal sequence, epoch, and partition roster).
//!
//! [`MemoryStorage`] is the reference adapter: it backs tests and
//! single-process deployments. Durable backends implement the same
//! trait out of tree.

mod adapter;
mod memory;

pub use adapter::{NodeMetadata, StorageAdapter};
pub use memory::MemoryStorage;

/// Result type alias using the crate's error type.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Errors surfaced by storage adapters.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend-specific failure (connection loss, corrupt row, …).
    #[error("storage backend error: {0}")]
    Backend(String),
}
