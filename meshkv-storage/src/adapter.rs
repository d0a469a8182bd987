//! The adapter trait and node metadata.

use crate::StorageResult;
use async_trait::async_trait;
use meshkv_cluster::PartitionOwnership;
use meshkv_crdt::Record;
use meshkv_types::{NodeId, PartitionId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// What a node persists about itself, beyond record data.
///
/// `last_sequence` lets a restarted node resume journal numbering
/// without gaps; the roster restores partition ownership as of the
/// recorded epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeMetadata {
    pub node_id: NodeId,
    #[serde(with = "meshkv_types::serde_u64_string")]
    pub last_sequence: u64,
    pub epoch: u64,
    pub partition_roster: HashMap<PartitionId, PartitionOwnership>,
}

/// A pluggable persistence backend.
///
/// Implementations must keep `scan` results in ascending key order and
/// make `put` durable before returning; the core holds its write
/// critical section open across the call.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Reads a record.
    async fn get(
        &self,
        partition: PartitionId,
        map_name: &str,
        key: &str,
    ) -> StorageResult<Option<Record>>;

    /// Writes (or overwrites) a record.
    async fn put(
        &self,
        partition: PartitionId,
        map_name: &str,
        key: &str,
        record: &Record,
    ) -> StorageResult<()>;

    /// Physically removes a record. Returns true if one existed.
    ///
    /// Logical deletes are `put`s of tombstone records; this is for
    /// partition handoff and the like.
    async fn delete(
        &self,
        partition: PartitionId,
        map_name: &str,
        key: &str,
    ) -> StorageResult<bool>;

    /// Returns all records of a map in `partition` with keys inside the
    /// inclusive range, in ascending key order.
    async fn scan(
        &self,
        partition: PartitionId,
        map_name: &str,
        start: &str,
        end: &str,
    ) -> StorageResult<Vec<(String, Record)>>;

    /// Loads the node metadata record, if one was ever saved.
    async fn load_metadata(&self) -> StorageResult<Option<NodeMetadata>>;

    /// Saves the node metadata record.
    async fn save_metadata(&self, metadata: &NodeMetadata) -> StorageResult<()>;
}
