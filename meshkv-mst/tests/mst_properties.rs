//! Property-based tests for tree-shape determinism.
//!
//! The structural guarantee everything else rests on: the tree is a
//! pure function of its `(key, value hash)` set. Insertion order,
//! update order and remove order must all be invisible in the root
//! hash and the serialized page ranges.

use meshkv_mst::{MerkleSearchTree, ValueDigest};
use proptest::prelude::*;
use std::collections::BTreeMap;

fn entries_strategy() -> impl Strategy<Value = BTreeMap<String, u32>> {
    prop::collection::btree_map(
        prop::string::string_regex("[a-z]{1,8}").unwrap(),
        any::<u32>(),
        0..64,
    )
}

fn build(entries: &[(String, u32)]) -> MerkleSearchTree<String> {
    let mut tree = MerkleSearchTree::new();
    for (key, value) in entries {
        tree.upsert(key.clone(), ValueDigest::of(&value.to_le_bytes()));
    }
    tree
}

proptest! {
    /// Any permutation of inserts produces the same root hash and the
    /// same page-range serialization.
    #[test]
    fn root_hash_ignores_insertion_order(
        (entries, shuffled) in entries_strategy().prop_flat_map(|m| {
            let entries: Vec<(String, u32)> = m.into_iter().collect();
            let shuffled = Just(entries.clone()).prop_shuffle();
            (Just(entries), shuffled)
        })
    ) {
        let mut a = build(&entries);
        let mut b = build(&shuffled);
        prop_assert_eq!(a.root_hash(), b.root_hash());
        prop_assert_eq!(a.serialize_page_ranges(), b.serialize_page_ranges());
    }

    /// In-order traversal yields strictly ascending keys.
    #[test]
    fn traversal_is_strictly_ascending(entries in entries_strategy()) {
        let entries: Vec<(String, u32)> = entries.into_iter().collect();
        let tree = build(&entries);
        let keys = tree.keys();
        for pair in keys.windows(2) {
            prop_assert!(pair[0] < pair[1]);
        }
        prop_assert_eq!(keys.len(), entries.len());
    }

    /// Insert-then-remove leaves the canonical tree for the remaining
    /// keys, no matter which keys are removed.
    #[test]
    fn remove_restores_canonical_shape(
        (entries, victims) in entries_strategy().prop_flat_map(|m| {
            let entries: Vec<(String, u32)> = m.into_iter().collect();
            let keys: Vec<String> = entries.iter().map(|(k, _)| k.clone()).collect();
            let victims = prop::sample::subsequence(keys, 0..=entries.len());
            (Just(entries), victims)
        })
    ) {
        let mut tree = build(&entries);
        for victim in &victims {
            prop_assert!(tree.remove(victim));
        }

        let remaining: Vec<(String, u32)> = entries
            .iter()
            .filter(|(k, _)| !victims.contains(k))
            .cloned()
            .collect();
        let mut reference = build(&remaining);

        prop_assert_eq!(tree.root_hash(), reference.root_hash());
        prop_assert_eq!(tree.serialize_page_ranges(), reference.serialize_page_ranges());
    }
}
