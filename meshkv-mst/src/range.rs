//! Page ranges and diff ranges.
//!
//! A [`PageRange`] is the cross-node compatibility surface of the tree:
//! two implementations converge iff they emit identical
//! `(start, end, hash)` tuples for identical state. A [`DiffRange`] is
//! an inclusive key interval known to be inconsistent between two trees.

use crate::digest::PageDigest;
use serde::{Deserialize, Serialize};

/// An inclusive key interval covered by one page, plus that page's
/// subtree hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRange<K> {
    start: K,
    end: K,
    hash: PageDigest,
}

impl<K: Ord> PageRange<K> {
    /// Creates a range. `start` must not exceed `end`.
    #[must_use]
    pub fn new(start: K, end: K, hash: PageDigest) -> Self {
        debug_assert!(start <= end);
        Self { start, end, hash }
    }

    /// Returns the inclusive lower bound.
    #[must_use]
    pub fn start(&self) -> &K {
        &self.start
    }

    /// Returns the inclusive upper bound.
    #[must_use]
    pub fn end(&self) -> &K {
        &self.end
    }

    /// Returns the page's subtree hash.
    #[must_use]
    pub fn hash(&self) -> PageDigest {
        self.hash
    }

    /// Returns true if this range fully contains the other
    /// (`self.start <= other.start && other.end <= self.end`).
    #[must_use]
    pub fn is_superset_of(&self, other: &Self) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// An inclusive key interval the local node must fetch from a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffRange<K> {
    start: K,
    end: K,
}

impl<K: Ord> DiffRange<K> {
    /// Creates a range. `start` must not exceed `end`.
    #[must_use]
    pub fn new(start: K, end: K) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }

    /// Returns the inclusive lower bound.
    #[must_use]
    pub fn start(&self) -> &K {
        &self.start
    }

    /// Returns the inclusive upper bound.
    #[must_use]
    pub fn end(&self) -> &K {
        &self.end
    }

    /// Returns true if the key falls inside the range.
    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.start <= *key && *key <= self.end
    }

    /// Returns true if the two ranges overlap at any key.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}
