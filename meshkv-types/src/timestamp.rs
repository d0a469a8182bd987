//! Hybrid Logical Clock implementation for causal ordering.
//!
//! Combines physical time with a logical counter and the writing node's
//! id to produce a totally-ordered timestamp:
//! - Monotonicity (always increasing at a given node)
//! - Causality (if A happens-before B, then ts(A) < ts(B))
//! - Bounded drift from physical time
//!
//! Based on the HLC algorithm from "Logical Physical Clocks"
//! (Kulkarni et al.), extended with a node id tiebreak so two distinct
//! writers can never produce equal timestamps.

use crate::ids::NodeId;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

/// Default bound on how far ahead of local physical time a remote
/// timestamp may be before it is rejected (60 seconds).
pub const DEFAULT_MAX_DRIFT_MS: u64 = 60_000;

/// A Hybrid Logical Clock timestamp.
///
/// Consists of:
/// - `millis`: milliseconds since Unix epoch (physical component)
/// - `counter`: logical counter for events at the same millisecond
/// - `node_id`: the node that generated the timestamp (final tiebreak)
///
/// Ordering compares `millis`, then `counter`, then `node_id` bytes,
/// which makes the order total across the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HybridTimestamp {
    /// Physical time component (milliseconds since Unix epoch).
    millis: u64,
    /// Logical counter for ordering events at the same millisecond.
    counter: u32,
    /// The node that produced this timestamp.
    node_id: NodeId,
}

impl HybridTimestamp {
    /// Creates a timestamp from components.
    #[must_use]
    pub const fn new(millis: u64, counter: u32, node_id: NodeId) -> Self {
        Self {
            millis,
            counter,
            node_id,
        }
    }

    /// Returns the physical time component.
    #[must_use]
    pub const fn millis(&self) -> u64 {
        self.millis
    }

    /// Returns the logical counter.
    #[must_use]
    pub const fn counter(&self) -> u32 {
        self.counter
    }

    /// Returns the node that produced this timestamp.
    #[must_use]
    pub const fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Returns true if this timestamp is causally before the other.
    #[must_use]
    pub fn is_before(&self, other: &Self) -> bool {
        self < other
    }

    /// Returns true if this timestamp is causally after the other.
    #[must_use]
    pub fn is_after(&self, other: &Self) -> bool {
        self > other
    }
}

impl PartialOrd for HybridTimestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HybridTimestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.millis
            .cmp(&other.millis)
            .then_with(|| self.counter.cmp(&other.counter))
            .then_with(|| self.node_id.cmp(&other.node_id))
    }
}

/// The stateful clock owned by a node.
///
/// Generates monotonically increasing [`HybridTimestamp`]s for local
/// writes and advances past remote timestamps observed during merges.
/// Not internally synchronized — the owner serializes access along with
/// the rest of the write critical section.
#[derive(Debug, Clone)]
pub struct HlcClock {
    node_id: NodeId,
    last_millis: u64,
    last_counter: u32,
    max_drift_ms: u64,
}

impl HlcClock {
    /// Creates a clock for the given node with the default drift bound.
    #[must_use]
    pub fn new(node_id: NodeId) -> Self {
        Self::with_max_drift(node_id, DEFAULT_MAX_DRIFT_MS)
    }

    /// Creates a clock with an explicit drift bound.
    #[must_use]
    pub fn with_max_drift(node_id: NodeId, max_drift_ms: u64) -> Self {
        Self {
            node_id,
            last_millis: 0,
            last_counter: 0,
            max_drift_ms,
        }
    }

    /// Returns the node id timestamps are stamped with.
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Returns the last timestamp issued or observed by this clock.
    #[must_use]
    pub fn last(&self) -> HybridTimestamp {
        HybridTimestamp::new(self.last_millis, self.last_counter, self.node_id)
    }

    /// Generates the next timestamp for a local write.
    ///
    /// Takes `max(physical_now, last.millis)`; if the physical clock has
    /// not advanced past the last issued millisecond the counter is
    /// bumped instead, preserving monotonicity.
    pub fn now(&mut self) -> HybridTimestamp {
        let now = physical_now_ms();
        if now > self.last_millis {
            self.last_millis = now;
            self.last_counter = 0;
        } else {
            self.last_counter = self.last_counter.saturating_add(1);
        }
        self.last()
    }

    /// Advances the clock past a remote timestamp observed during merge.
    ///
    /// Returns the new local timestamp, guaranteed greater than both the
    /// previous local timestamp and the remote one. Remote timestamps
    /// further ahead of physical time than the drift bound are rejected
    /// so a peer with a broken clock cannot poison ours.
    pub fn observe(&mut self, remote: &HybridTimestamp) -> Result<HybridTimestamp> {
        let now = physical_now_ms();
        if remote.millis() > now.saturating_add(self.max_drift_ms) {
            return Err(Error::TimestampDrift {
                ahead_ms: remote.millis() - now,
                bound_ms: self.max_drift_ms,
            });
        }

        let max_millis = now.max(self.last_millis).max(remote.millis());
        let counter = if max_millis == self.last_millis && max_millis == remote.millis() {
            self.last_counter.max(remote.counter()).saturating_add(1)
        } else if max_millis == self.last_millis {
            self.last_counter.saturating_add(1)
        } else if max_millis == remote.millis() {
            remote.counter().saturating_add(1)
        } else {
            0
        };

        self.last_millis = max_millis;
        self.last_counter = counter;
        Ok(self.last())
    }
}

fn physical_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before Unix epoch")
        .as_millis() as u64
}
