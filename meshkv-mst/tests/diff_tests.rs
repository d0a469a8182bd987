//! Diff algorithm tests: soundness, minimality, and convergence of
//! repeated anti-entropy rounds.

use meshkv_mst::{diff, DiffRange, MerkleSearchTree, ValueDigest};
use proptest::prelude::*;
use std::collections::BTreeMap;

type Entries = BTreeMap<String, u32>;

fn build(entries: &Entries) -> MerkleSearchTree<String> {
    let mut tree = MerkleSearchTree::new();
    for (key, value) in entries {
        tree.upsert(key.clone(), ValueDigest::of(&value.to_le_bytes()));
    }
    tree
}

/// Applies one pull round: fetches every returned range from `from` and
/// merges it into `to`. Returns the number of ranges requested.
fn pull(to: &mut Entries, from: &Entries, ranges: &[DiffRange<String>]) -> usize {
    for range in ranges {
        for (key, value) in from.range(range.start().clone()..=range.end().clone()) {
            to.insert(key.clone(), *value);
        }
    }
    ranges.len()
}

fn ranges_of(entries: &Entries) -> Vec<meshkv_mst::PageRange<String>> {
    build(entries).serialize_page_ranges()
}

// ── Base cases ───────────────────────────────────────────────────

#[test]
fn identical_trees_diff_to_nothing() {
    let entries: Entries = (0..100).map(|i| (format!("key-{i}"), i)).collect();
    let local = ranges_of(&entries);
    let peer = ranges_of(&entries);
    assert!(diff(&local, &peer).is_empty());
}

#[test]
fn empty_peer_diffs_to_nothing() {
    let entries: Entries = (0..10).map(|i| (format!("key-{i}"), i)).collect();
    let local = ranges_of(&entries);
    assert!(diff(&local, &[]).is_empty());
}

#[test]
fn empty_local_requests_the_whole_peer_span() {
    let entries: Entries = [("bananas", 1), ("donkey", 2), ("platanos", 3)]
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v))
        .collect();
    let peer = ranges_of(&entries);

    let out = diff(&[], &peer);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].start(), "bananas");
    assert_eq!(out[0].end(), "platanos");
}

/// Disjoint single-page trees: the whole peer span comes back as one
/// inconsistent range.
#[test]
fn disjoint_trees_request_the_peer_range() {
    let peer_entries: Entries = [("bananas", 1), ("platanos", 2)]
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v))
        .collect();
    let local_entries: Entries = [("donkey", 1)]
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v))
        .collect();

    let out = diff(&ranges_of(&local_entries), &ranges_of(&peer_entries));
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].start(), "bananas");
    assert_eq!(out[0].end(), "platanos");
}

/// The peer holding strictly less data yields nothing to fetch.
#[test]
fn peer_subset_diffs_to_nothing() {
    let local_entries: Entries = [("a", 1), ("b", 2), ("c", 3)]
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v))
        .collect();
    let mut peer_entries = local_entries.clone();
    peer_entries.remove("a");
    peer_entries.remove("c");

    let out = diff(&ranges_of(&local_entries), &ranges_of(&peer_entries));
    assert!(out.is_empty(), "unexpected ranges: {out:?}");
}

#[test]
fn single_changed_value_is_requested() {
    let base: Entries = (0..50).map(|i| (format!("key-{i:02}"), i)).collect();
    let mut changed = base.clone();
    changed.insert("key-25".to_owned(), 9_999);

    let out = diff(&ranges_of(&base), &ranges_of(&changed));
    assert!(!out.is_empty());
    assert!(
        out.iter().any(|r| r.contains(&"key-25".to_owned())),
        "changed key not covered: {out:?}"
    );
}

// ── Convergence properties ───────────────────────────────────────

proptest! {
    /// Pulling the returned ranges drains the diff: a handful of pull
    /// rounds reaches the fixpoint where the diff is empty.
    #[test]
    fn repeated_pulls_drain_the_diff(
        local in prop::collection::btree_map("[a-m][a-z]{0,4}", any::<u32>(), 0..48),
        peer in prop::collection::btree_map("[a-m][a-z]{0,4}", any::<u32>(), 0..48),
    ) {
        let mut local = local;
        let mut rounds = 0;
        loop {
            let out = diff(&ranges_of(&local), &ranges_of(&peer));
            if out.is_empty() {
                break;
            }
            rounds += 1;
            prop_assert!(rounds <= 5, "diff did not drain after {rounds} rounds");
            pull(&mut local, &peer, &out);
        }

        // Whatever the diff stopped requesting, convergence means every
        // peer entry the walk could see is now local or newer locally.
        let final_out = diff(&ranges_of(&local), &ranges_of(&peer));
        prop_assert!(final_out.is_empty());
    }

    /// Bidirectional anti-entropy rounds converge both replicas to
    /// identical trees within a few rounds.
    #[test]
    fn bidirectional_rounds_converge(
        a in prop::collection::btree_map("[a-m][a-z]{0,4}", any::<u32>(), 0..48),
        b in prop::collection::btree_map("[a-m][a-z]{0,4}", any::<u32>(), 0..48),
    ) {
        // Values for shared keys must agree for set-union convergence;
        // disambiguate by keying the value on the key text.
        let rekey = |m: Entries| -> Entries {
            m.into_keys().map(|k| { let v = k.len() as u32; (k, v) }).collect()
        };
        let mut a = rekey(a);
        let mut b = rekey(b);

        let mut rounds = 0;
        while build(&a).root_hash() != build(&b).root_hash() {
            rounds += 1;
            prop_assert!(rounds <= 8, "no convergence after {rounds} rounds");

            let a_wants = diff(&ranges_of(&a), &ranges_of(&b));
            let b_wants = diff(&ranges_of(&b), &ranges_of(&a));
            pull(&mut a, &b, &a_wants);
            pull(&mut b, &a, &b_wants);
        }

        prop_assert_eq!(&a, &b);
        prop_assert!(diff(&ranges_of(&a), &ranges_of(&b)).is_empty());
    }
}
