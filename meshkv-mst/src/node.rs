//! Tree nodes: one key, its value hash, and the subtree of lesser keys.

use crate::digest::ValueDigest;
use crate::page::Page;

/// A single entry in a page.
///
/// `lt_pointer` holds the subtree of keys ordered less than `key` (and
/// greater than the preceding node's key, if any). Pages and nodes form
/// a DAG with no cycles; ownership through boxes enforces that.
#[derive(Debug, Clone)]
pub(crate) struct Node<K> {
    pub(crate) key: K,
    pub(crate) value_hash: ValueDigest,
    pub(crate) lt_pointer: Option<Box<Page<K>>>,
}

impl<K> Node<K> {
    pub(crate) fn new(key: K, value_hash: ValueDigest) -> Self {
        Self {
            key,
            value_hash,
            lt_pointer: None,
        }
    }
}
