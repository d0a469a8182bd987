//! Last-Writer-Wins record.
//!
//! A CRDT register that stores one value per key. Concurrent writes are
//! resolved by comparing hybrid timestamps — the write with the highest
//! timestamp wins. Deletes are represented as tombstones (records with
//! `deleted = true`) so a reordered old write can never resurrect a
//! deleted key. Tombstones are retained indefinitely.

use meshkv_types::HybridTimestamp;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A Last-Writer-Wins record.
///
/// Stores a value of type `V` along with the timestamp of the write that
/// produced it. Since timestamps embed the writing node's id they are
/// totally ordered, so equal timestamps can only occur when the same
/// logical write arrives twice; a deterministic tiebreak over the
/// serialized value bytes keeps the merge convergent even then.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LwwRecord<V> {
    /// The current value (a sentinel for tombstones).
    value: V,
    /// Whether this record is a delete marker.
    #[serde(default)]
    deleted: bool,
    /// Timestamp of the write that produced this record.
    timestamp: HybridTimestamp,
}

impl<V> LwwRecord<V> {
    /// Creates a live record.
    #[must_use]
    pub fn new(value: V, timestamp: HybridTimestamp) -> Self {
        Self {
            value,
            deleted: false,
            timestamp,
        }
    }

    /// Returns a reference to the value.
    ///
    /// Meaningless for tombstones; check [`is_tombstone`](Self::is_tombstone)
    /// first when the distinction matters.
    #[must_use]
    pub fn value(&self) -> &V {
        &self.value
    }

    /// Consumes the record, returning the value.
    #[must_use]
    pub fn into_value(self) -> V {
        self.value
    }

    /// Returns true if this record is a delete marker.
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.deleted
    }

    /// Returns the timestamp of the last write.
    #[must_use]
    pub fn timestamp(&self) -> HybridTimestamp {
        self.timestamp
    }
}

impl<V: Default> LwwRecord<V> {
    /// Creates a tombstone record.
    #[must_use]
    pub fn tombstone(timestamp: HybridTimestamp) -> Self {
        Self {
            value: V::default(),
            deleted: true,
            timestamp,
        }
    }
}

impl<V: Serialize> LwwRecord<V> {
    /// Orders two records for merging.
    ///
    /// Compares timestamps first. On an exact timestamp tie the records
    /// are ordered by their serialized `(deleted, value)` bytes, which is
    /// arbitrary but identical on every replica.
    #[must_use]
    pub fn merge_ordering(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.tiebreak_bytes().cmp(&other.tiebreak_bytes()))
    }

    fn tiebreak_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![u8::from(self.deleted)];
        bytes.extend(serde_json::to_vec(&self.value).unwrap_or_default());
        bytes
    }
}

impl<V: Serialize + Clone> LwwRecord<V> {
    /// Merges another record into this one; the greater record (by
    /// [`merge_ordering`](Self::merge_ordering)) survives.
    ///
    /// Returns true if the other record won. This operation is
    /// commutative, associative and idempotent.
    pub fn merge(&mut self, other: &Self) -> bool {
        if other.merge_ordering(self) == Ordering::Greater {
            *self = other.clone();
            true
        } else {
            false
        }
    }

    /// Creates a new record that is the merge of this and another.
    #[must_use]
    pub fn merged(&self, other: &Self) -> Self {
        let mut result = self.clone();
        result.merge(other);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshkv_types::NodeId;

    fn ts(millis: u64, counter: u32, node: NodeId) -> HybridTimestamp {
        HybridTimestamp::new(millis, counter, node)
    }

    #[test]
    fn higher_timestamp_wins() {
        let node = NodeId::new();
        let mut a = LwwRecord::new("old", ts(1, 0, node));
        let b = LwwRecord::new("new", ts(2, 0, node));
        assert!(a.merge(&b));
        assert_eq!(*a.value(), "new");
    }

    #[test]
    fn lower_timestamp_loses() {
        let node = NodeId::new();
        let mut a = LwwRecord::new("new", ts(2, 0, node));
        let b = LwwRecord::new("old", ts(1, 0, node));
        assert!(!a.merge(&b));
        assert_eq!(*a.value(), "new");
    }

    #[test]
    fn exact_tie_breaks_on_value_bytes() {
        let node = NodeId::new();
        let stamp = ts(5, 3, node);
        let a = LwwRecord::new("apple", stamp);
        let b = LwwRecord::new("banana", stamp);

        // Both replicas pick the same winner regardless of merge direction.
        assert_eq!(a.merged(&b), b.merged(&a));
    }

    #[test]
    fn tombstone_beats_older_write() {
        let node = NodeId::new();
        let mut rec = LwwRecord::new(String::from("v"), ts(1, 0, node));
        let tomb = LwwRecord::<String>::tombstone(ts(2, 0, node));
        assert!(rec.merge(&tomb));
        assert!(rec.is_tombstone());

        // A reordered older write cannot resurrect the key.
        let stale = LwwRecord::new(String::from("stale"), ts(1, 5, node));
        assert!(!rec.merge(&stale));
        assert!(rec.is_tombstone());
    }

    #[test]
    fn merge_is_idempotent() {
        let rec = LwwRecord::new(42, ts(9, 0, NodeId::new()));
        assert_eq!(rec.merged(&rec), rec);
    }
}
