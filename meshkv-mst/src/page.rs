//! Pages: sorted runs of nodes at one level, with child pages below.
//!
//! Structural invariants maintained by every operation here:
//! - `nodes` is strictly sorted by key
//! - every page below a node's `lt_pointer` holds keys less than that
//!   node's key (and greater than the preceding node's key)
//! - `high_page` holds keys greater than the last node's key
//! - child pages always have a lower level than their parent
//!
//! Because a key's level is a pure function of the key, the whole tree
//! shape is determined by the key set alone, which is what makes root
//! hashes insertion-order independent.

use crate::digest::{PageDigest, ValueDigest};
use crate::node::Node;
use crate::range::PageRange;
use sha2::{Digest as _, Sha256};
use std::cmp::Ordering;

/// Outcome of a page-level upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UpsertResult {
    /// The key was placed (inserted or updated) somewhere at or below
    /// this page.
    Complete,
    /// The key's level is above this page; the caller must splice an
    /// intermediate page in between.
    InsertIntermediate,
}

/// A page of the tree.
#[derive(Debug, Clone)]
pub(crate) struct Page<K> {
    pub(crate) level: u8,
    pub(crate) nodes: Vec<Node<K>>,
    pub(crate) high_page: Option<Box<Page<K>>>,
    /// Cached subtree hash; `None` while dirty. Cleared along the
    /// mutated path and re-materialized lazily on demand.
    pub(crate) cached_hash: Option<PageDigest>,
}

impl<K: Ord + Clone + AsRef<[u8]>> Page<K> {
    pub(crate) fn new(level: u8, nodes: Vec<Node<K>>) -> Self {
        Self {
            level,
            nodes,
            high_page: None,
            cached_hash: None,
        }
    }

    /// Smallest key in this page's subtree.
    pub(crate) fn subtree_min(&self) -> &K {
        match &self.nodes[0].lt_pointer {
            Some(child) => child.subtree_min(),
            None => &self.nodes[0].key,
        }
    }

    /// Largest key in this page's subtree.
    pub(crate) fn subtree_max(&self) -> &K {
        match &self.high_page {
            Some(child) => child.subtree_max(),
            None => &self.nodes[self.nodes.len() - 1].key,
        }
    }

    /// Looks up a key's value hash, descending as needed.
    pub(crate) fn get(&self, key: &K, level: u8) -> Option<&ValueDigest> {
        match level.cmp(&self.level) {
            Ordering::Greater => None,
            Ordering::Equal => {
                let idx = self.nodes.partition_point(|n| n.key < *key);
                self.nodes
                    .get(idx)
                    .filter(|n| n.key == *key)
                    .map(|n| &n.value_hash)
            }
            Ordering::Less => {
                let idx = self.nodes.partition_point(|n| n.key < *key);
                let child = if idx == self.nodes.len() {
                    self.high_page.as_deref()
                } else {
                    self.nodes[idx].lt_pointer.as_deref()
                };
                child.and_then(|c| c.get(key, level))
            }
        }
    }

    /// Inserts or updates a key at its level within this subtree.
    pub(crate) fn upsert(&mut self, key: K, level: u8, value: ValueDigest) -> UpsertResult {
        match level.cmp(&self.level) {
            Ordering::Greater => return UpsertResult::InsertIntermediate,
            Ordering::Equal => self.upsert_node(key, value),
            Ordering::Less => {
                let idx = self.nodes.partition_point(|n| n.key < key);
                debug_assert!(idx == self.nodes.len() || self.nodes[idx].key != key);
                let slot = if idx == self.nodes.len() {
                    &mut self.high_page
                } else {
                    &mut self.nodes[idx].lt_pointer
                };
                let result = if let Some(child) = slot.as_deref_mut() {
                    child.upsert(key.clone(), level, value)
                } else {
                    *slot = Some(Box::new(Page::new(level, vec![Node::new(key.clone(), value)])));
                    UpsertResult::Complete
                };
                if result == UpsertResult::InsertIntermediate {
                    insert_intermediate_page(slot, key, level, value);
                }
            }
        }
        self.cached_hash = None;
        UpsertResult::Complete
    }

    /// Places a key in this page (whose level matches the key's).
    fn upsert_node(&mut self, key: K, value: ValueDigest) {
        let idx = self.nodes.partition_point(|n| n.key < key);
        if idx < self.nodes.len() && self.nodes[idx].key == key {
            self.nodes[idx].value_hash = value;
            return;
        }
        // A new node splits whatever child subtree spans its key: the
        // lesser half becomes the node's lt pointer, the rest stays in
        // the original slot (now entirely greater than the key).
        let slot = if idx == self.nodes.len() {
            &mut self.high_page
        } else {
            &mut self.nodes[idx].lt_pointer
        };
        let lt_pointer = split_off_lt(slot, &key);
        self.nodes.insert(
            idx,
            Node {
                key,
                value_hash: value,
                lt_pointer,
            },
        );
    }

    /// Removes a key from this subtree. Returns true if it was present.
    pub(crate) fn remove(&mut self, key: &K, level: u8) -> bool {
        match level.cmp(&self.level) {
            Ordering::Greater => false,
            Ordering::Less => {
                let idx = self.nodes.partition_point(|n| n.key < *key);
                let slot = if idx == self.nodes.len() {
                    &mut self.high_page
                } else {
                    &mut self.nodes[idx].lt_pointer
                };
                let removed = match slot.as_deref_mut() {
                    Some(child) => child.remove(key, level),
                    None => return false,
                };
                if removed {
                    // A page emptied by the removal collapses into the
                    // join of its children (left in its high page).
                    if slot.as_ref().is_some_and(|child| child.nodes.is_empty()) {
                        let remainder = slot.as_mut().and_then(|child| child.high_page.take());
                        *slot = remainder;
                    }
                    self.cached_hash = None;
                }
                removed
            }
            Ordering::Equal => {
                let idx = self.nodes.partition_point(|n| n.key < *key);
                if idx >= self.nodes.len() || self.nodes[idx].key != *key {
                    return false;
                }
                let node = self.nodes.remove(idx);
                // Join the subtrees either side of the removed node so
                // the gap keeps ordering and level invariants intact.
                let right = if idx == self.nodes.len() {
                    self.high_page.take()
                } else {
                    self.nodes[idx].lt_pointer.take()
                };
                let joined = join_pages(node.lt_pointer, right);
                if idx == self.nodes.len() {
                    self.high_page = joined;
                } else {
                    self.nodes[idx].lt_pointer = joined;
                }
                self.cached_hash = None;
                true
            }
        }
    }

    /// Returns the subtree hash, computing and caching any dirty pages.
    pub(crate) fn materialize_hash(&mut self) -> PageDigest {
        if let Some(hash) = self.cached_hash {
            return hash;
        }
        let mut hasher = Sha256::new();
        hasher.update([self.level]);
        for node in &mut self.nodes {
            let key = node.key.as_ref();
            hasher.update((key.len() as u64).to_le_bytes());
            hasher.update(key);
            hasher.update(node.value_hash.as_bytes());
            match &mut node.lt_pointer {
                Some(child) => {
                    hasher.update([1]);
                    hasher.update(child.materialize_hash().as_bytes());
                }
                None => hasher.update([0]),
            }
        }
        match &mut self.high_page {
            Some(child) => {
                hasher.update([1]);
                hasher.update(child.materialize_hash().as_bytes());
            }
            None => hasher.update([0]),
        }
        let digest = PageDigest::new(crate::digest::Digest::from_bytes(hasher.finalize().into()));
        self.cached_hash = Some(digest);
        digest
    }

    /// Pre-order traversal emitting `(subtree_min, subtree_max, hash)`
    /// for this page and every page below it, high pages included.
    pub(crate) fn collect_ranges(&mut self, out: &mut Vec<PageRange<K>>) {
        let hash = self.materialize_hash();
        let start = self.subtree_min().clone();
        let end = self.subtree_max().clone();
        out.push(PageRange::new(start, end, hash));
        for node in &mut self.nodes {
            if let Some(child) = &mut node.lt_pointer {
                child.collect_ranges(out);
            }
        }
        if let Some(child) = &mut self.high_page {
            child.collect_ranges(out);
        }
    }

    /// In-order traversal of `(key, value_hash)` entries.
    pub(crate) fn in_order<'a>(&'a self, out: &mut Vec<(&'a K, &'a ValueDigest)>) {
        for node in &self.nodes {
            if let Some(child) = &node.lt_pointer {
                child.in_order(out);
            }
            out.push((&node.key, &node.value_hash));
        }
        if let Some(child) = &self.high_page {
            child.in_order(out);
        }
    }
}

/// Splits the subtree in `slot` around `key`: keys ordered less than
/// `key` are returned as their own subtree, keys greater-or-equal stay
/// in the slot. Either side may come back empty (`None`).
pub(crate) fn split_off_lt<K: Ord + Clone + AsRef<[u8]>>(
    slot: &mut Option<Box<Page<K>>>,
    key: &K,
) -> Option<Box<Page<K>>> {
    let mut page = slot.take()?;
    let partition = page.nodes.partition_point(|n| n.key < *key);
    page.cached_hash = None;

    if partition == 0 {
        // Every node is >= key; any lesser keys hang off the first
        // node's lt pointer.
        let lt = split_off_lt(&mut page.nodes[0].lt_pointer, key);
        *slot = Some(page);
        return lt;
    }

    if partition == page.nodes.len() {
        // Every node is < key; the >= remainder hangs off the high page.
        let mut high = page.high_page.take();
        let high_lt = split_off_lt(&mut high, key);
        page.high_page = high_lt;
        *slot = high;
        return Some(page);
    }

    // The page itself straddles the key. The boundary node's lt pointer
    // may straddle it too.
    let mut gte_nodes = page.nodes.split_off(partition);
    let boundary_lt = split_off_lt(&mut gte_nodes[0].lt_pointer, key);

    let mut gte_page = Box::new(Page::new(page.level, gte_nodes));
    gte_page.high_page = page.high_page.take();
    page.high_page = boundary_lt;

    *slot = Some(gte_page);
    Some(page)
}

/// Splices a new single-node page at `level` into `slot`, splitting the
/// existing (lower-level) subtree around the key.
pub(crate) fn insert_intermediate_page<K: Ord + Clone + AsRef<[u8]>>(
    slot: &mut Option<Box<Page<K>>>,
    key: K,
    level: u8,
    value: ValueDigest,
) {
    let lt_page = split_off_lt(slot, &key);
    let gte_page = slot.take();

    let mut page = Page::new(
        level,
        vec![Node {
            key,
            value_hash: value,
            lt_pointer: lt_page,
        }],
    );
    page.high_page = gte_page;
    *slot = Some(Box::new(page));
}

/// Joins two subtrees where every key in `left` orders below every key
/// in `right`, producing the canonical tree for the combined key set.
pub(crate) fn join_pages<K: Ord + Clone + AsRef<[u8]>>(
    left: Option<Box<Page<K>>>,
    right: Option<Box<Page<K>>>,
) -> Option<Box<Page<K>>> {
    let (mut left, mut right) = match (left, right) {
        (None, right) => return right,
        (left, None) => return left,
        (Some(left), Some(right)) => (left, right),
    };

    match left.level.cmp(&right.level) {
        Ordering::Greater => {
            left.high_page = join_pages(left.high_page.take(), Some(right));
            left.cached_hash = None;
            Some(left)
        }
        Ordering::Less => {
            right.nodes[0].lt_pointer = join_pages(Some(left), right.nodes[0].lt_pointer.take());
            right.cached_hash = None;
            Some(right)
        }
        Ordering::Equal => {
            let boundary = join_pages(left.high_page.take(), right.nodes[0].lt_pointer.take());
            right.nodes[0].lt_pointer = boundary;
            left.nodes.append(&mut right.nodes);
            left.high_page = right.high_page.take();
            left.cached_hash = None;
            Some(left)
        }
    }
}
