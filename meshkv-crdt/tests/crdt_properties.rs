//! Property-based tests for CRDT correctness.
//!
//! These tests verify the fundamental mathematical properties the merge
//! must satisfy:
//! - Commutativity: merge(A, B) == merge(B, A)
//! - Associativity: merge(merge(A, B), C) == merge(A, merge(B, C))
//! - Idempotence: merge(A, A) == A
//!
//! Additionally, we verify eventual consistency: replicas converge
//! regardless of the order in which records are exchanged.

use meshkv_crdt::{LwwMap, LwwRecord, Record};
use meshkv_types::{HybridTimestamp, NodeId};
use proptest::prelude::*;
use serde_json::json;

// =============================================================================
// HELPER STRATEGIES
// =============================================================================

fn node_pool() -> Vec<NodeId> {
    (0..4).map(|_| NodeId::new()).collect()
}

fn timestamp_strategy(nodes: Vec<NodeId>) -> impl Strategy<Value = HybridTimestamp> {
    (1u64..1_000, 0u32..10, 0..nodes.len()).prop_map(move |(millis, counter, idx)| {
        HybridTimestamp::new(millis, counter, nodes[idx])
    })
}

fn record_strategy(nodes: Vec<NodeId>) -> impl Strategy<Value = Record> {
    (
        prop::string::string_regex("[a-z0-9]{0,12}").unwrap(),
        prop::bool::ANY,
        timestamp_strategy(nodes),
    )
        .prop_map(|(value, deleted, ts)| {
            if deleted {
                LwwRecord::tombstone(ts)
            } else {
                LwwRecord::new(json!(value), ts)
            }
        })
}

fn ops_strategy(
    nodes: Vec<NodeId>,
) -> impl Strategy<Value = Vec<(String, Record)>> {
    prop::collection::vec(
        (
            prop::string::string_regex("[a-f]{1,3}").unwrap(),
            record_strategy(nodes),
        ),
        0..40,
    )
}

// =============================================================================
// RECORD PROPERTIES
// =============================================================================

mod record_properties {
    use super::*;

    proptest! {
        #[test]
        fn merge_is_commutative(
            (a, b) in Just(node_pool()).prop_flat_map(|nodes| {
                (record_strategy(nodes.clone()), record_strategy(nodes))
            })
        ) {
            prop_assert_eq!(a.merged(&b), b.merged(&a));
        }

        #[test]
        fn merge_is_associative(
            (a, b, c) in Just(node_pool()).prop_flat_map(|nodes| {
                (
                    record_strategy(nodes.clone()),
                    record_strategy(nodes.clone()),
                    record_strategy(nodes),
                )
            })
        ) {
            let left = a.merged(&b).merged(&c);
            let right = a.merged(&b.merged(&c));
            prop_assert_eq!(left, right);
        }

        #[test]
        fn merge_is_idempotent(
            a in Just(node_pool()).prop_flat_map(record_strategy)
        ) {
            prop_assert_eq!(a.merged(&a), a);
        }
    }
}

// =============================================================================
// MAP CONVERGENCE
// =============================================================================

mod map_properties {
    use super::*;

    proptest! {
        /// Two replicas that each apply a different interleaving of the
        /// same operations converge after exchanging state.
        #[test]
        fn replicas_converge_after_exchange(
            (ops, shuffle) in Just(node_pool())
                .prop_flat_map(ops_strategy)
                .prop_flat_map(|ops| {
                    let len = ops.len();
                    (Just(ops), prop::collection::vec(any::<prop::sample::Index>(), len))
                })
        ) {
            let mut n1 = LwwMap::new("users");
            let mut n2 = LwwMap::new("users");

            for (key, record) in &ops {
                n1.merge(key.clone(), record.clone());
            }

            // Apply in a different order at the second replica.
            let mut reordered: Vec<_> = ops.clone();
            for (i, idx) in shuffle.iter().enumerate() {
                let j = idx.index(reordered.len().max(1));
                reordered.swap(i, j);
            }
            for (key, record) in &reordered {
                n2.merge(key.clone(), record.clone());
            }

            // Full state exchange in both directions.
            n1.merge_all(&n2);
            n2.merge_all(&n1);

            prop_assert!(n1.state_eq(&n2));
        }

        /// Merging a map into itself changes nothing.
        #[test]
        fn self_merge_is_identity(
            ops in Just(node_pool()).prop_flat_map(ops_strategy)
        ) {
            let mut map = LwwMap::new("users");
            for (key, record) in ops {
                map.merge(key, record);
            }
            let snapshot = map.clone();
            map.merge_all(&snapshot);
            prop_assert!(map.state_eq(&snapshot));
        }
    }
}
