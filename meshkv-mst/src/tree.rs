//! The Merkle Search Tree.

use crate::digest::{level_of_key, RootHash, ValueDigest};
use crate::node::Node;
use crate::page::{insert_intermediate_page, Page, UpsertResult};
use crate::range::PageRange;

/// A Merkle Search Tree over keys of type `K`.
///
/// Determinism guarantee: two trees holding the same set of
/// `(key, value hash)` pairs have identical root hashes and emit
/// identical page ranges, regardless of the order the pairs were
/// inserted or removed in. Hashes are computed lazily: mutation only
/// clears caches along the touched path, and digests materialize when
/// [`root_hash`](Self::root_hash) or
/// [`serialize_page_ranges`](Self::serialize_page_ranges) is called.
#[derive(Debug, Clone, Default)]
pub struct MerkleSearchTree<K = String> {
    root: Option<Box<Page<K>>>,
}

impl<K: Ord + Clone + AsRef<[u8]>> MerkleSearchTree<K> {
    /// Creates an empty tree.
    #[must_use]
    pub fn new() -> Self {
        Self { root: None }
    }

    /// Returns true if the tree holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Inserts a key or updates its value hash.
    pub fn upsert(&mut self, key: K, value: ValueDigest) {
        let level = level_of_key(key.as_ref());
        let result = if let Some(root) = self.root.as_deref_mut() {
            root.upsert(key.clone(), level, value)
        } else {
            self.root = Some(Box::new(Page::new(level, vec![Node::new(key.clone(), value)])));
            UpsertResult::Complete
        };
        if result == UpsertResult::InsertIntermediate {
            // The key lives above the current root: split the old root
            // around it and make the key the new root.
            insert_intermediate_page(&mut self.root, key, level, value);
        }
    }

    /// Removes a key. Returns true if it was present.
    pub fn remove(&mut self, key: &K) -> bool {
        let level = level_of_key(key.as_ref());
        let Some(root) = self.root.as_deref_mut() else {
            return false;
        };
        let removed = root.remove(key, level);
        if removed && root.nodes.is_empty() {
            let remainder = root.high_page.take();
            self.root = remainder;
        }
        removed
    }

    /// Returns the value hash stored under a key.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<&ValueDigest> {
        let level = level_of_key(key.as_ref());
        self.root.as_deref().and_then(|root| root.get(key, level))
    }

    /// Returns the root hash, materializing any dirty page hashes.
    ///
    /// The empty tree hashes to the fixed all-zero sentinel.
    pub fn root_hash(&mut self) -> RootHash {
        match self.root.as_deref_mut() {
            Some(root) => root.materialize_hash().into(),
            None => RootHash::EMPTY,
        }
    }

    /// Serializes the tree as page ranges in pre-order: each page emits
    /// `(subtree_min, subtree_max, page_hash)`, parents before children,
    /// children in key order, high pages last.
    pub fn serialize_page_ranges(&mut self) -> Vec<PageRange<K>> {
        let mut out = Vec::new();
        if let Some(root) = self.root.as_deref_mut() {
            root.collect_ranges(&mut out);
        }
        out
    }

    /// Returns all `(key, value hash)` entries in ascending key order.
    #[must_use]
    pub fn in_order_entries(&self) -> Vec<(&K, &ValueDigest)> {
        let mut out = Vec::new();
        if let Some(root) = self.root.as_deref() {
            root.in_order(&mut out);
        }
        out
    }

    /// Returns all keys in ascending order.
    #[must_use]
    pub fn keys(&self) -> Vec<&K> {
        self.in_order_entries().into_iter().map(|(k, _)| k).collect()
    }
}
