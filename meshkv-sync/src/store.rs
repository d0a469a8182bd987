//! The node store: LWW maps + journal + Merkle trees + fencing, glued
//! into one write path.
//!
//! Every mutation runs the same critical section, serialized by a
//! single lock: validate the fencing token, stamp or observe the
//! timestamp, apply to the map, upsert the partition's Merkle tree,
//! write through storage, append exactly one journal event, persist
//! node metadata. Reads only take cheap snapshots.
//!
//! Keys are addressed on the wire and in the trees by the composite
//! `"{map}/{key}"`; map names therefore must not contain `/`.

use crate::error::{SyncError, SyncResult};
use crate::protocol::FetchedEntry;
use meshkv_cluster::{FencingManager, FencingToken, PartitionRouter};
use meshkv_crdt::{LwwMap, LwwRecord, MergeOutcome, Record};
use meshkv_journal::{Journal, Subscription, SubscriptionOptions};
use meshkv_mst::{MerkleTreeManager, PageRange, RemoteComparison, RootHash, ValueDigest};
use meshkv_storage::{NodeMetadata, StorageAdapter};
use meshkv_types::{
    HlcClock, HybridTimestamp, JournalEvent, JournalEventKind, NewJournalEvent, NodeId,
    PartitionId, DEFAULT_MAX_DRIFT_MS,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Configuration for a node store.
#[derive(Debug, Clone)]
pub struct NodeStoreConfig {
    /// Number of partitions keys hash into.
    pub partition_count: u32,
    /// Reject remote timestamps further ahead of local time than this.
    pub max_drift_ms: u64,
    /// When set, merges into maps this node has never seen are
    /// rejected instead of creating the map.
    pub strict_maps: bool,
}

impl Default for NodeStoreConfig {
    fn default() -> Self {
        Self {
            partition_count: 16,
            max_drift_ms: DEFAULT_MAX_DRIFT_MS,
            strict_maps: false,
        }
    }
}

/// Outcome of merging one remote record.
#[derive(Debug, Clone)]
pub struct MergeReport {
    /// The incoming record was applied.
    pub applied: bool,
    /// The incoming record lost a conflict (or failed validation) and
    /// a `MergeRejected` event was journaled.
    pub rejected: bool,
    /// The store clock after the merge; callers chain causally-ordered
    /// writes off this.
    pub current_timestamp: HybridTimestamp,
}

struct StoreState {
    clock: HlcClock,
    maps: HashMap<String, LwwMap>,
    trees: MerkleTreeManager,
}

/// One node's convergent state.
pub struct NodeStore {
    node_id: NodeId,
    config: NodeStoreConfig,
    journal: Journal,
    router: Arc<PartitionRouter>,
    fencing: Arc<FencingManager>,
    storage: Arc<dyn StorageAdapter>,
    state: Mutex<StoreState>,
}

impl NodeStore {
    /// Creates a fresh store.
    pub fn new(
        node_id: NodeId,
        config: NodeStoreConfig,
        storage: Arc<dyn StorageAdapter>,
    ) -> Self {
        Self::with_journal(node_id, config, storage, Journal::new())
    }

    /// Creates a store resuming journal numbering from persisted
    /// metadata (see [`StorageAdapter::load_metadata`]).
    pub async fn restore(
        config: NodeStoreConfig,
        storage: Arc<dyn StorageAdapter>,
    ) -> SyncResult<Option<Self>> {
        let Some(metadata) = storage.load_metadata().await? else {
            return Ok(None);
        };
        let store = Self::with_journal(
            metadata.node_id,
            config,
            storage,
            Journal::resume_from(metadata.last_sequence),
        );
        store.router.seed(metadata.partition_roster.clone());
        if metadata.epoch > 0 {
            store
                .fencing
                .adopt_epoch(metadata.epoch, "restored from metadata", metadata.node_id);
        }
        Ok(Some(store))
    }

    fn with_journal(
        node_id: NodeId,
        config: NodeStoreConfig,
        storage: Arc<dyn StorageAdapter>,
        journal: Journal,
    ) -> Self {
        let router = Arc::new(PartitionRouter::new(config.partition_count));
        let clock = HlcClock::with_max_drift(node_id, config.max_drift_ms);
        Self {
            node_id,
            config,
            journal,
            router,
            fencing: Arc::new(FencingManager::new()),
            storage,
            state: Mutex::new(StoreState {
                clock,
                maps: HashMap::new(),
                trees: MerkleTreeManager::new(),
            }),
        }
    }

    // ── Accessors ────────────────────────────────────────────────

    /// Returns this node's id.
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Returns the journal.
    #[must_use]
    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// Returns the partition router.
    #[must_use]
    pub fn router(&self) -> &Arc<PartitionRouter> {
        &self.router
    }

    /// Returns the fencing manager.
    #[must_use]
    pub fn fencing(&self) -> &Arc<FencingManager> {
        &self.fencing
    }

    /// Mints a fencing token for this node at the current epoch.
    #[must_use]
    pub fn mint_token(&self) -> FencingToken {
        self.fencing.mint_token(self.node_id, None)
    }

    /// Opens a journal subscription.
    #[must_use]
    pub fn subscribe(&self, options: SubscriptionOptions) -> Subscription {
        self.journal.subscribe(options)
    }

    /// Maps a `(map, key)` pair to its partition.
    #[must_use]
    pub fn partition_of(&self, map_name: &str, key: &str) -> PartitionId {
        self.router.partition_of(&composite_key(map_name, key))
    }

    // ── Reads ────────────────────────────────────────────────────

    /// Returns the record under a key, tombstones included.
    pub async fn get(&self, map_name: &str, key: &str) -> Option<Record> {
        let state = self.state.lock().await;
        state.maps.get(map_name).and_then(|m| m.get(key)).cloned()
    }

    /// Returns the live value under a key.
    pub async fn get_value(&self, map_name: &str, key: &str) -> Option<Value> {
        self.get(map_name, key)
            .await
            .filter(|r| !r.is_tombstone())
            .map(LwwRecord::into_value)
    }

    /// Returns a map's version vector (applied writes per node).
    pub async fn map_version(&self, map_name: &str) -> Option<meshkv_crdt::VersionVector> {
        let state = self.state.lock().await;
        state.maps.get(map_name).map(|m| m.version().clone())
    }

    /// Returns a partition's MST root hash.
    pub async fn root_hash(&self, partition: PartitionId) -> RootHash {
        self.state.lock().await.trees.root_hash(partition)
    }

    /// Serializes a partition's MST page ranges.
    pub async fn page_ranges(&self, partition: PartitionId) -> Vec<PageRange<String>> {
        self.state.lock().await.trees.page_ranges(partition)
    }

    /// Compares a partition against a peer's reported tree: matching
    /// roots short-circuit, otherwise the result carries the
    /// composite-key ranges to fetch from the peer.
    pub async fn compare_with_remote(
        &self,
        partition: PartitionId,
        remote_root: RootHash,
        remote_ranges: &[PageRange<String>],
    ) -> RemoteComparison {
        self.state
            .lock()
            .await
            .trees
            .compare_with_remote(partition, remote_root, remote_ranges)
    }

    /// Returns the partitions this store has written to.
    pub async fn touched_partitions(&self) -> Vec<PartitionId> {
        let mut partitions: Vec<PartitionId> =
            self.state.lock().await.trees.partitions().collect();
        partitions.sort_unstable();
        partitions
    }

    /// Returns every record whose composite key falls inside the
    /// inclusive range within `partition`, tombstones included, in
    /// composite-key order.
    pub async fn fetch_range(
        &self,
        partition: PartitionId,
        range_start: &str,
        range_end: &str,
    ) -> Vec<FetchedEntry> {
        let state = self.state.lock().await;
        let mut entries = Vec::new();
        for (map_name, map) in &state.maps {
            for (key, record) in map.records() {
                let composite = composite_key(map_name, key);
                if composite.as_str() < range_start || composite.as_str() > range_end {
                    continue;
                }
                if self.router.partition_of(&composite) != partition {
                    continue;
                }
                entries.push(FetchedEntry {
                    map_name: map_name.clone(),
                    key: key.clone(),
                    record: record.clone(),
                });
            }
        }
        entries.sort_by(|a, b| {
            composite_key(&a.map_name, &a.key).cmp(&composite_key(&b.map_name, &b.key))
        });
        entries
    }

    // ── Mutations ────────────────────────────────────────────────

    /// Writes a value. Emits `Inserted` or `Updated` depending on prior
    /// live presence. An explicit timestamp replays a known write; the
    /// clock still advances past it.
    pub async fn set(
        &self,
        token: &FencingToken,
        map_name: &str,
        key: &str,
        value: Value,
        timestamp: Option<HybridTimestamp>,
    ) -> SyncResult<JournalEvent> {
        validate_names(map_name, key)?;
        self.fencing.validate(token)?;

        let mut state = self.state.lock().await;
        let timestamp = match timestamp {
            Some(ts) => {
                state
                    .clock
                    .observe(&ts)
                    .map_err(|e| SyncError::InvalidRequest(e.to_string()))?;
                ts
            }
            None => state.clock.now(),
        };

        let map = state
            .maps
            .entry(map_name.to_owned())
            .or_insert_with(|| LwwMap::new(map_name));
        let had_live_value = map.get(key).is_some_and(|r| !r.is_tombstone());
        let outcome = map.set(key, value.clone(), timestamp);

        let kind = if had_live_value {
            JournalEventKind::Updated
        } else {
            JournalEventKind::Inserted
        };
        let mut body = NewJournalEvent::new(kind, map_name, key, timestamp, self.node_id)
            .with_value(value);
        if let Some(previous) = outcome.previous.filter(|r| !r.is_tombstone()) {
            body = body.with_previous_value(previous.value().clone());
        }

        let event = self
            .commit(&mut state, map_name, key, &outcome.record, body)
            .await?;
        Ok(event)
    }

    /// Tombstones a key. Returns false (and journals nothing) if the
    /// key had no live value.
    pub async fn delete(
        &self,
        token: &FencingToken,
        map_name: &str,
        key: &str,
    ) -> SyncResult<bool> {
        validate_names(map_name, key)?;
        self.fencing.validate(token)?;

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let Some(map) = state.maps.get_mut(map_name) else {
            return Ok(false);
        };
        if !map.get(key).is_some_and(|r| !r.is_tombstone()) {
            return Ok(false);
        }

        let timestamp = state.clock.now();
        let previous = map.remove(key, timestamp);
        let record = LwwRecord::tombstone(timestamp);

        let mut body =
            NewJournalEvent::new(JournalEventKind::Deleted, map_name, key, timestamp, self.node_id);
        if let Some(previous) = previous.filter(|r| !r.is_tombstone()) {
            body = body.with_previous_value(previous.value().clone());
        }

        self.commit(state, map_name, key, &record, body).await?;
        Ok(true)
    }

    /// Merges a record received from a peer.
    ///
    /// Validation failures (future-dated timestamps, unknown maps in
    /// strict mode) and lost conflicts are *results*, not errors: they
    /// journal a `MergeRejected` event and report `rejected = true`.
    /// Only fencing and storage failures surface as `Err`.
    pub async fn merge_remote(
        &self,
        token: &FencingToken,
        map_name: &str,
        key: &str,
        incoming: Record,
    ) -> SyncResult<MergeReport> {
        validate_names(map_name, key)?;
        self.fencing.validate(token)?;

        let mut state = self.state.lock().await;

        if self.config.strict_maps && !state.maps.contains_key(map_name) {
            warn!(map = map_name, "merge into unknown map rejected");
            let timestamp = state.clock.now();
            let body = NewJournalEvent::new(
                JournalEventKind::MergeRejected,
                map_name,
                key,
                timestamp,
                self.node_id,
            )
            .with_metadata(json!({ "reason": "unknown_map" }));
            self.append_and_persist(body).await?;
            return Ok(self.report(&state, false, true));
        }

        if let Err(e) = state.clock.observe(&incoming.timestamp()) {
            warn!(map = map_name, key, error = %e, "merge with invalid timestamp rejected");
            let timestamp = state.clock.now();
            let body = NewJournalEvent::new(
                JournalEventKind::MergeRejected,
                map_name,
                key,
                timestamp,
                self.node_id,
            )
            .with_metadata(json!({
                "reason": "invalid_timestamp",
                "detail": e.to_string(),
            }));
            self.append_and_persist(body).await?;
            return Ok(self.report(&state, false, true));
        }

        let map = state
            .maps
            .entry(map_name.to_owned())
            .or_insert_with(|| LwwMap::new(map_name));
        let had_live_value = map.get(key).is_some_and(|r| !r.is_tombstone());

        match map.merge(key, incoming.clone()) {
            MergeOutcome::Applied { previous } => {
                let kind = if incoming.is_tombstone() {
                    JournalEventKind::Deleted
                } else if had_live_value {
                    JournalEventKind::Updated
                } else {
                    JournalEventKind::Inserted
                };
                let mut body = NewJournalEvent::new(
                    kind,
                    map_name,
                    key,
                    incoming.timestamp(),
                    self.node_id,
                );
                if !incoming.is_tombstone() {
                    body = body.with_value(incoming.value().clone());
                }
                if let Some(previous) = previous.filter(|r| !r.is_tombstone()) {
                    body = body.with_previous_value(previous.value().clone());
                }
                self.commit(&mut state, map_name, key, &incoming, body).await?;
                Ok(self.report(&state, true, false))
            }
            MergeOutcome::Rejected { current } => {
                debug!(map = map_name, key, "incoming record lost the merge");
                let timestamp = state.clock.now();
                let mut body = NewJournalEvent::new(
                    JournalEventKind::MergeRejected,
                    map_name,
                    key,
                    timestamp,
                    self.node_id,
                )
                .with_metadata(json!({
                    "reason": "conflict",
                    "winning_timestamp": current.timestamp(),
                }));
                if !incoming.is_tombstone() {
                    body = body.with_value(incoming.value().clone());
                }
                self.append_and_persist(body).await?;
                Ok(self.report(&state, false, true))
            }
            MergeOutcome::Unchanged => Ok(self.report(&state, false, false)),
        }
    }

    // ── Write-path plumbing ──────────────────────────────────────

    /// Applies the storage/MST/journal tail of a mutation that already
    /// updated the map.
    async fn commit(
        &self,
        state: &mut StoreState,
        map_name: &str,
        key: &str,
        record: &Record,
        body: NewJournalEvent,
    ) -> SyncResult<JournalEvent> {
        let composite = composite_key(map_name, key);
        let partition = self.router.partition_of(&composite);
        state
            .trees
            .update_record(partition, composite, record_digest(record)?);
        self.storage.put(partition, map_name, key, record).await?;
        let event = self.append_and_persist(body).await?;
        Ok(event)
    }

    /// Appends the journal event and persists refreshed node metadata.
    /// Callers hold the state lock, so appends stay in mutation order.
    async fn append_and_persist(&self, body: NewJournalEvent) -> SyncResult<JournalEvent> {
        let event = self.journal.append(body);
        let metadata = NodeMetadata {
            node_id: self.node_id,
            last_sequence: event.sequence,
            epoch: self.fencing.current_epoch(),
            partition_roster: self.router.ownerships(),
        };
        self.storage.save_metadata(&metadata).await?;
        Ok(event)
    }

    fn report(&self, state: &StoreState, applied: bool, rejected: bool) -> MergeReport {
        MergeReport {
            applied,
            rejected,
            current_timestamp: state.clock.last(),
        }
    }
}

/// Joins a map name and key into the composite used for partitioning
/// and tree keys. Unambiguous because map names may not contain `/`.
#[must_use]
pub fn composite_key(map_name: &str, key: &str) -> String {
    format!("{map_name}/{key}")
}

/// Splits a composite key back into `(map_name, key)`.
#[must_use]
pub fn split_composite_key(composite: &str) -> Option<(&str, &str)> {
    composite.split_once('/')
}

fn record_digest(record: &Record) -> SyncResult<ValueDigest> {
    Ok(ValueDigest::of(&serde_json::to_vec(record)?))
}

fn validate_names(map_name: &str, key: &str) -> SyncResult<()> {
    if map_name.is_empty() {
        return Err(SyncError::InvalidRequest("map name is empty".into()));
    }
    if map_name.contains('/') {
        return Err(SyncError::InvalidRequest(
            "map name may not contain '/'".into(),
        ));
    }
    if key.is_empty() {
        return Err(SyncError::InvalidRequest("key is empty".into()));
    }
    Ok(())
}
