//! Version vector for per-map write accounting.
//!
//! One monotonic counter per node, bumped every time a write from that
//! node is applied to the map. The store exposes each map's vector so
//! operators can see how much of every peer's activity a replica has
//! absorbed. Convergence never depends on it: LWW merge ordering comes
//! from record timestamps alone.

use meshkv_types::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Applied-write counters, one per node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionVector {
    counters: HashMap<NodeId, u64>,
}

impl VersionVector {
    /// Creates an empty vector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the counter for a node (0 if absent).
    #[must_use]
    pub fn get(&self, node_id: &NodeId) -> u64 {
        self.counters.get(node_id).copied().unwrap_or(0)
    }

    /// Iterates over `(node, counter)` pairs in arbitrary order.
    pub fn counters(&self) -> impl Iterator<Item = (NodeId, u64)> + '_ {
        self.counters.iter().map(|(&node_id, &count)| (node_id, count))
    }

    /// Returns the number of nodes tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    /// Returns true if no write has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Returns the sum of all counters: the total number of applied
    /// writes the map has seen.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.counters.values().sum()
    }

    /// Bumps the counter for a node and returns the new value.
    pub fn increment(&mut self, node_id: NodeId) -> u64 {
        let counter = self.counters.entry(node_id).or_default();
        *counter += 1;
        *counter
    }

    /// Folds another vector into this one, keeping the pointwise max.
    /// Commutative, associative and idempotent.
    pub fn merge(&mut self, other: &Self) {
        for (&node_id, &count) in &other.counters {
            let counter = self.counters.entry(node_id).or_default();
            *counter = (*counter).max(count);
        }
    }
}
