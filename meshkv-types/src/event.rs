//! Journal event types.
//!
//! A journal event is the immutable, sequenced record of a single state
//! change at one node. The journal is the source of truth for broadcast
//! fan-out and incremental index maintenance: every applied mutation
//! produces exactly one event, and sequences never skip or repeat.

use crate::ids::NodeId;
use crate::timestamp::HybridTimestamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What kind of state change an event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JournalEventKind {
    /// A key was written for the first time.
    Inserted,
    /// An existing key was overwritten.
    Updated,
    /// A key was tombstoned.
    Deleted,
    /// An incoming merge lost to the local record; surfaced so
    /// subscribers can observe conflicts.
    MergeRejected,
}

/// An event appended to the journal.
///
/// Events are immutable once appended. `sequence` is assigned by the
/// journal at the moment the mutation is applied to local state and is
/// strictly monotonic per node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEvent {
    /// Position in the node's journal, starting at 1.
    ///
    /// Serialized as a decimal string so JSON transports with 53-bit
    /// number limits round-trip it losslessly.
    #[serde(with = "serde_u64_string")]
    pub sequence: u64,

    /// The kind of change.
    pub kind: JournalEventKind,

    /// The map the change applies to.
    pub map_name: String,

    /// The key within the map.
    pub key: String,

    /// The value written, if any (absent for deletes and rejections
    /// without a surviving remote value).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,

    /// The value that was replaced, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_value: Option<Value>,

    /// Timestamp of the winning (or attempted) write.
    pub timestamp: HybridTimestamp,

    /// The node that applied the change.
    pub node_id: NodeId,

    /// Free-form metadata (e.g. conflict detail on rejections).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// An event body awaiting a sequence number.
///
/// Produced by the store layer; the journal assigns the sequence under
/// its writer lock and returns the completed [`JournalEvent`].
#[derive(Debug, Clone)]
pub struct NewJournalEvent {
    pub kind: JournalEventKind,
    pub map_name: String,
    pub key: String,
    pub value: Option<Value>,
    pub previous_value: Option<Value>,
    pub timestamp: HybridTimestamp,
    pub node_id: NodeId,
    pub metadata: Option<Value>,
}

impl NewJournalEvent {
    /// Creates an event body with no values attached.
    #[must_use]
    pub fn new(
        kind: JournalEventKind,
        map_name: impl Into<String>,
        key: impl Into<String>,
        timestamp: HybridTimestamp,
        node_id: NodeId,
    ) -> Self {
        Self {
            kind,
            map_name: map_name.into(),
            key: key.into(),
            value: None,
            previous_value: None,
            timestamp,
            node_id,
            metadata: None,
        }
    }

    /// Attaches the written value.
    #[must_use]
    pub fn with_value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }

    /// Attaches the replaced value.
    #[must_use]
    pub fn with_previous_value(mut self, value: Value) -> Self {
        self.previous_value = Some(value);
        self
    }

    /// Attaches free-form metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Completes the event with its journal-assigned sequence.
    #[must_use]
    pub fn into_event(self, sequence: u64) -> JournalEvent {
        JournalEvent {
            sequence,
            kind: self.kind,
            map_name: self.map_name,
            key: self.key,
            value: self.value,
            previous_value: self.previous_value,
            timestamp: self.timestamp,
            node_id: self.node_id,
            metadata: self.metadata,
        }
    }
}

/// Serializes a `u64` as a decimal string, accepting either form on
/// deserialize. JSON transports treat large sequences as bigints-as-
/// strings; binary transports keep native integers.
pub mod serde_u64_string {
    use serde::de::{self, Deserializer, Unexpected, Visitor};
    use serde::Serializer;
    use std::fmt;

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        struct U64Visitor;

        impl Visitor<'_> for U64Visitor {
            type Value = u64;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a u64 or a decimal string")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<u64, E> {
                Ok(v)
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<u64, E> {
                v.parse()
                    .map_err(|_| E::invalid_value(Unexpected::Str(v), &self))
            }
        }

        deserializer.deserialize_any(U64Visitor)
    }
}
