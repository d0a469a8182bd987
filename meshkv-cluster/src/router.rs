//! Deterministic partition routing.
//!
//! Keys hash to partitions with SHA-256 so every implementation on
//! every platform agrees on placement. Ownership updates happen only
//! through rebalances stamped with a fresh epoch; concurrent readers
//! keep seeing the old table until the new one is committed.

use crate::{ClusterError, ClusterEvent, Result};
use meshkv_types::{NodeId, PartitionId};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::broadcast;
use tracing::info;

/// Who serves a partition, and since which epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionOwnership {
    pub primary: NodeId,
    pub replicas: Vec<NodeId>,
    pub epoch: u64,
}

/// Maps keys to partitions and partitions to owners.
#[derive(Debug)]
pub struct PartitionRouter {
    partition_count: u32,
    ownership: RwLock<HashMap<PartitionId, PartitionOwnership>>,
    events: broadcast::Sender<ClusterEvent>,
}

impl PartitionRouter {
    /// Creates a router over `partition_count` partitions with no
    /// ownership assigned yet.
    #[must_use]
    pub fn new(partition_count: u32) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            partition_count: partition_count.max(1),
            ownership: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Returns the number of partitions.
    #[must_use]
    pub fn partition_count(&self) -> u32 {
        self.partition_count
    }

    /// Maps a key to its partition: `sha256(key)[..8] mod count`.
    #[must_use]
    pub fn partition_of(&self, key: &str) -> PartitionId {
        let digest = Sha256::digest(key.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        PartitionId::new((u64::from_be_bytes(prefix) % u64::from(self.partition_count)) as u32)
    }

    /// Returns the ownership for a key's partition.
    pub fn route(&self, key: &str) -> Result<(PartitionId, PartitionOwnership)> {
        let partition = self.partition_of(key);
        let ownership = self
            .ownership
            .read()
            .expect("router lock poisoned")
            .get(&partition)
            .cloned()
            .ok_or(ClusterError::UnknownPartition(partition))?;
        Ok((partition, ownership))
    }

    /// Returns the ownership table snapshot.
    #[must_use]
    pub fn ownerships(&self) -> HashMap<PartitionId, PartitionOwnership> {
        self.ownership.read().expect("router lock poisoned").clone()
    }

    /// Subscribes to rebalance events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events.subscribe()
    }

    /// Installs ownership for partitions at the given epoch, e.g. the
    /// initial roster from node metadata or a handshake.
    pub fn seed(&self, assignments: impl IntoIterator<Item = (PartitionId, PartitionOwnership)>) {
        let mut table = self.ownership.write().expect("router lock poisoned");
        for (partition, ownership) in assignments {
            table.insert(partition, ownership);
        }
    }

    /// Merges a roster learned from a peer: per partition, the entry
    /// stamped with the higher epoch wins; ties keep ours.
    pub fn merge_roster(
        &self,
        roster: impl IntoIterator<Item = (PartitionId, PartitionOwnership)>,
    ) {
        let mut table = self.ownership.write().expect("router lock poisoned");
        for (partition, theirs) in roster {
            match table.get(&partition) {
                Some(ours) if ours.epoch >= theirs.epoch => {}
                _ => {
                    table.insert(partition, theirs);
                }
            }
        }
    }

    /// Commits a rebalance: every listed assignment is stamped with
    /// `epoch` (obtained from the fencing manager's increment) and
    /// announced. The table swaps in one step, so readers observe
    /// either the old or the new assignment, never a mix of the two
    /// for one partition.
    pub fn apply_rebalance(
        &self,
        epoch: u64,
        assignments: impl IntoIterator<Item = (PartitionId, NodeId, Vec<NodeId>)>,
    ) {
        let committed: Vec<(PartitionId, PartitionOwnership)> = assignments
            .into_iter()
            .map(|(partition, primary, replicas)| {
                (
                    partition,
                    PartitionOwnership {
                        primary,
                        replicas,
                        epoch,
                    },
                )
            })
            .collect();

        {
            let mut table = self.ownership.write().expect("router lock poisoned");
            for (partition, ownership) in &committed {
                table.insert(*partition, ownership.clone());
            }
        }

        for (partition, ownership) in committed {
            info!(%partition, primary = %ownership.primary, epoch, "partition rebalanced");
            let _ = self.events.send(ClusterEvent::PartitionRebalance {
                partition,
                primary: ownership.primary,
                epoch,
            });
        }
    }
}
