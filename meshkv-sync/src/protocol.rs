//! Sync protocol messages.
//!
//! The wire protocol is a sequence of tagged messages over a reliable
//! ordered channel per peer. Requests carry a `request_id` echoed by
//! their responses; pushes (journal events, epoch bumps) carry none.
//! Sequences serialize as decimal strings so JSON transports round-trip
//! them losslessly; binary transports are welcome to do better.

use crate::error::ErrorCode;
use meshkv_cluster::PartitionOwnership;
use meshkv_crdt::Record;
use meshkv_mst::{PageRange, RootHash};
use meshkv_types::{
    serde_u64_string, HybridTimestamp, JournalEvent, JournalEventKind, NodeId, PartitionId,
    RequestId, SubscriptionId,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Protocol version for compatibility checking.
pub const PROTOCOL_VERSION: u32 = 1;

/// A sync protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    /// Opens a session: who we are, our epoch, our view of ownership.
    Handshake(HandshakeBody),

    /// Accepts a session, carrying the responder's identity and roster.
    HandshakeAck(HandshakeAckBody),

    /// Unsolicited notification that the sender's epoch advanced.
    EpochBump { epoch: u64, reason: String },

    /// Requests a slice of the sender's journal.
    JournalRead {
        request_id: RequestId,
        #[serde(with = "serde_u64_string")]
        from_sequence: u64,
        limit: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        map_name: Option<String>,
    },

    /// Journal slice response.
    JournalReadResponse {
        request_id: RequestId,
        events: Vec<JournalEvent>,
    },

    /// Opens a journal subscription.
    JournalSubscribe {
        request_id: RequestId,
        #[serde(default, skip_serializing_if = "Option::is_none", with = "serde_opt_u64_string")]
        from_sequence: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        map_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kinds: Option<Vec<JournalEventKind>>,
    },

    /// Confirms a subscription.
    JournalSubscribeAck {
        request_id: RequestId,
        subscription_id: SubscriptionId,
    },

    /// One pushed journal event.
    JournalEvent {
        subscription_id: SubscriptionId,
        event: JournalEvent,
    },

    /// Tears down a subscription.
    JournalUnsubscribe { subscription_id: SubscriptionId },

    /// A single record merge.
    Merge {
        map_name: String,
        key: String,
        record: Record,
    },

    /// Merge outcome.
    MergeAck {
        applied: bool,
        rejected: bool,
        current_timestamp: HybridTimestamp,
    },

    /// Requests a partition's MST page ranges.
    PageRangesRequest {
        request_id: RequestId,
        partition: PartitionId,
    },

    /// Page ranges response (pre-order, root first).
    PageRangesResponse {
        request_id: RequestId,
        partition: PartitionId,
        root_hash: RootHash,
        ranges: Vec<PageRange<String>>,
    },

    /// Requests all records within an inclusive composite-key range.
    DiffFetch {
        request_id: RequestId,
        partition: PartitionId,
        range_start: String,
        range_end: String,
    },

    /// Range fetch response.
    DiffFetchResponse {
        request_id: RequestId,
        partition: PartitionId,
        entries: Vec<FetchedEntry>,
    },

    /// Error envelope for a failed request.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<RequestId>,
        error: ErrorBody,
    },
}

/// Handshake payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeBody {
    pub version: u32,
    pub node_id: NodeId,
    pub epoch: u64,
    pub partition_roster: HashMap<PartitionId, PartitionOwnership>,
    /// The sender's journal tail. Anti-entropy covers everything up to
    /// here; the live subscription picks up after it.
    #[serde(with = "serde_u64_string")]
    pub last_sequence: u64,
    /// Partitions the sender holds data for.
    pub partitions: Vec<PartitionId>,
}

/// Handshake response payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeAckBody {
    pub version: u32,
    pub node_id: NodeId,
    pub epoch: u64,
    pub partition_roster: HashMap<PartitionId, PartitionOwnership>,
    #[serde(with = "serde_u64_string")]
    pub last_sequence: u64,
    pub partitions: Vec<PartitionId>,
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// One record in a diff-fetch response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchedEntry {
    pub map_name: String,
    pub key: String,
    pub record: Record,
}

/// Structured error carried in a response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorBody {
    /// Builds an error body from a sync error.
    #[must_use]
    pub fn from_error(error: &crate::error::SyncError) -> Self {
        Self {
            code: error.code(),
            message: error.to_string(),
        }
    }
}

/// `Option<u64>` as an optional decimal string.
mod serde_opt_u64_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<u64>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) => serializer.collect_str(v),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<u64>, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        Option::<Raw>::deserialize(deserializer)?
            .map(|raw| match raw {
                Raw::Number(v) => Ok(v),
                Raw::Text(s) => s
                    .parse()
                    .map_err(|_| serde::de::Error::custom("invalid sequence string")),
            })
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshkv_crdt::LwwRecord;
    use serde_json::json;

    #[test]
    fn messages_are_tagged_with_screaming_snake_case() {
        let msg = Message::PageRangesRequest {
            request_id: RequestId::new(),
            partition: PartitionId::new(3),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "PAGE_RANGES_REQUEST");
        assert_eq!(json["partition"], 3);
    }

    #[test]
    fn merge_roundtrips() {
        let record = LwwRecord::new(json!({"k": 1}), HybridTimestamp::new(9, 2, NodeId::new()));
        let msg = Message::Merge {
            map_name: "users".into(),
            key: "alice".into(),
            record,
        };
        let bytes = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&bytes).unwrap();
        match back {
            Message::Merge { map_name, key, .. } => {
                assert_eq!(map_name, "users");
                assert_eq!(key, "alice");
            }
            other => panic!("expected Merge, got {other:?}"),
        }
    }

    #[test]
    fn subscribe_sequence_serializes_as_string() {
        let msg = Message::JournalSubscribe {
            request_id: RequestId::new(),
            from_sequence: Some(7),
            map_name: None,
            kinds: None,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["from_sequence"], "7");

        let back: Message = serde_json::from_value(json).unwrap();
        match back {
            Message::JournalSubscribe { from_sequence, .. } => {
                assert_eq!(from_sequence, Some(7));
            }
            other => panic!("expected JournalSubscribe, got {other:?}"),
        }
    }
}
