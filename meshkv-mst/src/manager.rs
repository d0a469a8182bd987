//! Per-partition tree management.

use crate::diff::diff;
use crate::digest::{RootHash, ValueDigest};
use crate::range::{DiffRange, PageRange};
use crate::tree::MerkleSearchTree;
use meshkv_types::PartitionId;
use std::collections::HashMap;
use tracing::debug;

/// Verdict of comparing a partition against a peer's tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteComparison {
    /// True when the trees differ at the root and an anti-entropy
    /// round is needed.
    pub needs_sync: bool,
    /// Inclusive key ranges to fetch from the peer. Empty when the
    /// roots already match.
    pub diff_ranges: Vec<DiffRange<String>>,
}

impl RemoteComparison {
    fn consistent() -> Self {
        Self {
            needs_sync: false,
            diff_ranges: Vec::new(),
        }
    }
}

/// Owns one Merkle Search Tree per partition.
///
/// Trees are created lazily on the first write to a partition; a
/// partition never written to reports the empty-tree sentinel hash.
/// Not internally synchronized — the store serializes tree updates with
/// the rest of its write critical section.
#[derive(Debug, Default)]
pub struct MerkleTreeManager {
    trees: HashMap<PartitionId, MerkleSearchTree<String>>,
}

impl MerkleTreeManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a write: upserts `(key, value_digest)` into the
    /// partition's tree, creating the tree on first touch.
    pub fn update_record(
        &mut self,
        partition: PartitionId,
        key: impl Into<String>,
        value: ValueDigest,
    ) {
        let tree = self.trees.entry(partition).or_insert_with(|| {
            debug!(%partition, "initializing partition tree");
            MerkleSearchTree::new()
        });
        tree.upsert(key.into(), value);
    }

    /// Removes a key from the partition's tree. Returns true if present.
    ///
    /// Note: tombstoned keys stay in the tree (the tombstone record
    /// still has a value hash); this is for keys physically dropped,
    /// e.g. when a partition is handed off.
    pub fn remove_record(&mut self, partition: PartitionId, key: &str) -> bool {
        self.trees
            .get_mut(&partition)
            .is_some_and(|tree| tree.remove(&key.to_owned()))
    }

    /// Returns the partitions that have a materialized tree.
    pub fn partitions(&self) -> impl Iterator<Item = PartitionId> + '_ {
        self.trees.keys().copied()
    }

    /// Returns the root hash for a partition (the empty sentinel if the
    /// partition has never been written).
    pub fn root_hash(&mut self, partition: PartitionId) -> RootHash {
        self.trees
            .get_mut(&partition)
            .map_or(RootHash::EMPTY, MerkleSearchTree::root_hash)
    }

    /// Serializes a partition's tree as pre-order page ranges.
    pub fn page_ranges(&mut self, partition: PartitionId) -> Vec<PageRange<String>> {
        self.trees
            .get_mut(&partition)
            .map_or_else(Vec::new, MerkleSearchTree::serialize_page_ranges)
    }

    /// Compares a partition against a peer's tree.
    ///
    /// Matching root hashes short-circuit: no page ranges are walked
    /// and nothing needs fetching. Otherwise the diff runs over
    /// `remote_ranges` and the result carries the inclusive key ranges
    /// to request from the peer.
    pub fn compare_with_remote(
        &mut self,
        partition: PartitionId,
        remote_root: RootHash,
        remote_ranges: &[PageRange<String>],
    ) -> RemoteComparison {
        if self.root_hash(partition) == remote_root {
            return RemoteComparison::consistent();
        }
        let local_ranges = self.page_ranges(partition);
        RemoteComparison {
            needs_sync: true,
            diff_ranges: diff(&local_ranges, remote_ranges),
        }
    }
}
