//! In-memory storage adapter.

use crate::adapter::{NodeMetadata, StorageAdapter};
use crate::StorageResult;
use async_trait::async_trait;
use meshkv_crdt::Record;
use meshkv_types::PartitionId;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

type MapKey = (PartitionId, String);

/// A `BTreeMap`-backed adapter for tests and single-process use.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    maps: RwLock<HashMap<MapKey, BTreeMap<String, Record>>>,
    metadata: RwLock<Option<NodeMetadata>>,
}

impl MemoryStorage {
    /// Creates an empty adapter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of records stored for a map in a partition.
    pub async fn len(&self, partition: PartitionId, map_name: &str) -> usize {
        self.maps
            .read()
            .await
            .get(&(partition, map_name.to_owned()))
            .map_or(0, BTreeMap::len)
    }

    /// Returns true if nothing has been stored at all.
    pub async fn is_empty(&self) -> bool {
        self.maps.read().await.values().all(BTreeMap::is_empty)
    }
}

#[async_trait]
impl StorageAdapter for MemoryStorage {
    async fn get(
        &self,
        partition: PartitionId,
        map_name: &str,
        key: &str,
    ) -> StorageResult<Option<Record>> {
        Ok(self
            .maps
            .read()
            .await
            .get(&(partition, map_name.to_owned()))
            .and_then(|m| m.get(key))
            .cloned())
    }

    async fn put(
        &self,
        partition: PartitionId,
        map_name: &str,
        key: &str,
        record: &Record,
    ) -> StorageResult<()> {
        self.maps
            .write()
            .await
            .entry((partition, map_name.to_owned()))
            .or_default()
            .insert(key.to_owned(), record.clone());
        Ok(())
    }

    async fn delete(
        &self,
        partition: PartitionId,
        map_name: &str,
        key: &str,
    ) -> StorageResult<bool> {
        Ok(self
            .maps
            .write()
            .await
            .get_mut(&(partition, map_name.to_owned()))
            .is_some_and(|m| m.remove(key).is_some()))
    }

    async fn scan(
        &self,
        partition: PartitionId,
        map_name: &str,
        start: &str,
        end: &str,
    ) -> StorageResult<Vec<(String, Record)>> {
        Ok(self
            .maps
            .read()
            .await
            .get(&(partition, map_name.to_owned()))
            .map(|m| {
                m.range(start.to_owned()..=end.to_owned())
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn load_metadata(&self) -> StorageResult<Option<NodeMetadata>> {
        Ok(self.metadata.read().await.clone())
    }

    async fn save_metadata(&self, metadata: &NodeMetadata) -> StorageResult<()> {
        *self.metadata.write().await = Some(metadata.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshkv_crdt::LwwRecord;
    use meshkv_types::{HybridTimestamp, NodeId};
    use serde_json::json;

    fn record(node: NodeId, n: u64) -> Record {
        LwwRecord::new(json!(n), HybridTimestamp::new(n, 0, node))
    }

    #[tokio::test]
    async fn put_get_delete_roundtrip() {
        let node = NodeId::new();
        let storage = MemoryStorage::new();
        let p = PartitionId::new(0);

        let rec = record(node, 1);
        storage.put(p, "users", "a", &rec).await.unwrap();
        assert_eq!(storage.get(p, "users", "a").await.unwrap(), Some(rec));

        assert!(storage.delete(p, "users", "a").await.unwrap());
        assert!(!storage.delete(p, "users", "a").await.unwrap());
        assert_eq!(storage.get(p, "users", "a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn scan_is_ordered_and_inclusive() {
        let node = NodeId::new();
        let storage = MemoryStorage::new();
        let p = PartitionId::new(0);
        for key in ["d", "a", "c", "b", "e"] {
            storage.put(p, "users", key, &record(node, 1)).await.unwrap();
        }

        let hits = storage.scan(p, "users", "b", "d").await.unwrap();
        let keys: Vec<&str> = hits.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["b", "c", "d"]);
    }

    #[tokio::test]
    async fn partitions_and_maps_are_isolated() {
        let node = NodeId::new();
        let storage = MemoryStorage::new();
        let records: Vec<Record> = (1..=3).map(|n| record(node, n)).collect();
        storage
            .put(PartitionId::new(0), "users", "a", &records[0])
            .await
            .unwrap();
        storage
            .put(PartitionId::new(1), "users", "a", &records[1])
            .await
            .unwrap();
        storage
            .put(PartitionId::new(0), "posts", "a", &records[2])
            .await
            .unwrap();

        assert_eq!(
            storage.get(PartitionId::new(0), "users", "a").await.unwrap(),
            Some(records[0].clone())
        );
        assert_eq!(
            storage.get(PartitionId::new(1), "users", "a").await.unwrap(),
            Some(records[1].clone())
        );
        assert_eq!(
            storage.get(PartitionId::new(0), "posts", "a").await.unwrap(),
            Some(records[2].clone())
        );
    }

    #[tokio::test]
    async fn metadata_roundtrip() {
        let storage = MemoryStorage::new();
        assert!(storage.load_metadata().await.unwrap().is_none());

        let metadata = NodeMetadata {
            node_id: NodeId::new(),
            last_sequence: 42,
            epoch: 3,
            partition_roster: Default::default(),
        };
        storage.save_metadata(&metadata).await.unwrap();
        assert_eq!(storage.load_metadata().await.unwrap(), Some(metadata));
    }
}
