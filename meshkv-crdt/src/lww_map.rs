//! A named map of string keys to LWW records.
//!
//! The map is the unit of CRDT state in the store: every key carries its
//! own record, merges are per-key, and a per-map version vector counts
//! applied writes per node for observability. Keys are kept in a
//! `BTreeMap` so range scans (diff fetches) walk in key order.

use crate::lww_record::LwwRecord;
use crate::version_vector::VersionVector;
use meshkv_types::HybridTimestamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::ops::RangeBounds;

/// The record type stored by the map.
pub type Record = LwwRecord<Value>;

/// Result of a local `set`.
#[derive(Debug, Clone)]
pub struct SetOutcome {
    /// The record now stored under the key.
    pub record: Record,
    /// The record that was replaced, if any.
    pub previous: Option<Record>,
}

/// Result of merging an incoming record.
#[derive(Debug, Clone)]
pub enum MergeOutcome {
    /// The incoming record won and was stored.
    Applied {
        /// The record it replaced, if the key existed.
        previous: Option<Record>,
    },
    /// The incoming record lost; the local record was retained.
    Rejected {
        /// The surviving local record.
        current: Record,
    },
    /// The incoming record is identical to the local one; nothing to do
    /// and nothing to surface.
    Unchanged,
}

impl MergeOutcome {
    /// Returns true if the incoming record was applied.
    #[must_use]
    pub fn applied(&self) -> bool {
        matches!(self, MergeOutcome::Applied { .. })
    }

    /// Returns true if the incoming record lost a real conflict.
    #[must_use]
    pub fn rejected(&self) -> bool {
        matches!(self, MergeOutcome::Rejected { .. })
    }
}

/// A Last-Writer-Wins map.
///
/// Merging two maps key-by-key is commutative, associative and
/// idempotent, so replicas converge regardless of exchange order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LwwMap {
    name: String,
    records: BTreeMap<String, Record>,
    version: VersionVector,
}

impl LwwMap {
    /// Creates an empty map.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            records: BTreeMap::new(),
            version: VersionVector::new(),
        }
    }

    /// Returns the map's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the per-map version vector.
    #[must_use]
    pub fn version(&self) -> &VersionVector {
        &self.version
    }

    /// Returns the number of keys, tombstones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if the map holds no records at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Returns the record under a key, tombstones included.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Record> {
        self.records.get(key)
    }

    /// Returns the live value under a key (`None` for absent keys and
    /// tombstones).
    #[must_use]
    pub fn get_value(&self, key: &str) -> Option<&Value> {
        self.records
            .get(key)
            .filter(|r| !r.is_tombstone())
            .map(LwwRecord::value)
    }

    /// Iterates over all records in key order, tombstones included.
    pub fn records(&self) -> impl Iterator<Item = (&String, &Record)> {
        self.records.iter()
    }

    /// Iterates over records within an inclusive key range, in order.
    pub fn range<R: RangeBounds<String>>(
        &self,
        range: R,
    ) -> impl Iterator<Item = (&String, &Record)> {
        self.records.range(range)
    }

    /// Writes a value under a key, replacing whatever was there.
    ///
    /// Local writes are stamped by the caller's clock, which only moves
    /// forward, so an unconditional overwrite cannot regress the key.
    pub fn set(&mut self, key: impl Into<String>, value: Value, timestamp: HybridTimestamp) -> SetOutcome {
        let record = LwwRecord::new(value, timestamp);
        let previous = self.records.insert(key.into(), record.clone());
        self.version.increment(timestamp.node_id());
        SetOutcome { record, previous }
    }

    /// Tombstones a key. Returns the replaced record, if any.
    pub fn remove(&mut self, key: impl Into<String>, timestamp: HybridTimestamp) -> Option<Record> {
        let previous = self
            .records
            .insert(key.into(), LwwRecord::tombstone(timestamp));
        self.version.increment(timestamp.node_id());
        previous
    }

    /// Merges an incoming record under a key.
    ///
    /// The incoming record is applied iff it orders strictly greater
    /// than the current one (timestamp first, serialized-value tiebreak
    /// on exact ties). Pure with respect to its inputs: the outcome
    /// depends only on the two records.
    pub fn merge(&mut self, key: impl Into<String>, incoming: Record) -> MergeOutcome {
        enum Decision {
            Apply,
            Reject(Record),
            Unchanged,
        }

        let key = key.into();
        let decision = match self.records.get(&key) {
            None => Decision::Apply,
            Some(current) if incoming == *current => Decision::Unchanged,
            Some(current) => match incoming.merge_ordering(current) {
                Ordering::Greater => Decision::Apply,
                _ => Decision::Reject(current.clone()),
            },
        };

        match decision {
            Decision::Apply => {
                self.version.increment(incoming.timestamp().node_id());
                let previous = self.records.insert(key, incoming);
                MergeOutcome::Applied { previous }
            }
            Decision::Reject(current) => MergeOutcome::Rejected { current },
            Decision::Unchanged => MergeOutcome::Unchanged,
        }
    }

    /// Merges every record of another map into this one.
    pub fn merge_all(&mut self, other: &LwwMap) {
        for (key, record) in other.records() {
            self.merge(key.clone(), record.clone());
        }
    }

    /// Returns true if both maps hold identical records for every key.
    ///
    /// Version vectors are deliberately ignored: they count local merge
    /// activity, not state.
    #[must_use]
    pub fn state_eq(&self, other: &LwwMap) -> bool {
        self.records == other.records
    }
}
