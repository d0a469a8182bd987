//! Page-range diff: computes what a local tree must fetch from a peer.
//!
//! Input is the two trees' pre-order page-range serializations. The walk
//! descends the peer's ranges, advancing a local cursor alongside; pages
//! whose hashes match prove whole subtrees consistent and are skipped,
//! mismatches recurse, and spans the local tree knows nothing about are
//! requested outright. The builder keeps consistent and inconsistent
//! intervals separately and subtracts the former from the latter at the
//! end, so the output is the minimal set of inclusive key ranges to
//! fetch.
//!
//! The diff is one-directional: it never requests ranges where the local
//! tree holds strictly more than the peer. Convergence comes from both
//! sides running it, round by round, until root hashes agree.

use crate::range::{DiffRange, PageRange};
use std::fmt::Debug;
use std::iter::Peekable;
use std::slice::Iter;
use tracing::{debug, trace};

/// Computes the key ranges the local tree must fetch from the peer.
///
/// Both inputs are pre-order page-range serializations
/// ([`MerkleSearchTree::serialize_page_ranges`]). Identical trees yield
/// an empty output.
///
/// [`MerkleSearchTree::serialize_page_ranges`]: crate::MerkleSearchTree::serialize_page_ranges
#[must_use]
pub fn diff<K: Ord + Clone + Debug>(
    local: &[PageRange<K>],
    peer: &[PageRange<K>],
) -> Vec<DiffRange<K>> {
    let Some(root) = peer.first() else {
        return Vec::new();
    };

    let mut local = local.iter().peekable();
    let mut peer = peer.iter().peekable();
    let mut builder = DiffListBuilder::new();

    trace!(?root, "beginning diff");
    recurse_diff(root, &mut peer, &mut local, &mut builder);

    builder.into_diff_vec()
}

/// Advances `cursor` iff its head is contained within `parent`.
fn maybe_advance_within<'p, K: Ord>(
    parent: &PageRange<K>,
    cursor: &mut Peekable<Iter<'p, PageRange<K>>>,
) -> Option<&'p PageRange<K>> {
    if cursor.peek().is_some_and(|v| parent.is_superset_of(v)) {
        return cursor.next();
    }
    None
}

fn recurse_diff<'p, K: Ord + Clone + Debug>(
    subtree_root: &PageRange<K>,
    peer: &mut Peekable<Iter<'p, PageRange<K>>>,
    local: &mut Peekable<Iter<'p, PageRange<K>>>,
    builder: &mut DiffListBuilder<K>,
) {
    let mut last_p: Option<&'p PageRange<K>> = None;

    loop {
        let Some(p) = maybe_advance_within(subtree_root, peer) else {
            trace!("no more peer pages in subtree");
            return;
        };

        let mut l = match maybe_advance_within(p, local) {
            Some(l) => l,
            None => {
                if local.peek().is_some_and(|v| v.is_superset_of(p)) {
                    // The local tree covers strictly more than this peer
                    // subtree; the peer page can't tell us anything new
                    // at this depth.
                    trace!(peer_page = ?p, "local page is a superset of peer");
                    return;
                }

                // The local tree has no pages inside this span; request
                // it from the last evaluated boundary up to where local
                // knowledge resumes.
                let start = last_p.map_or_else(|| subtree_root.start(), PageRange::end);
                let end = local
                    .peek()
                    .map_or_else(|| p.end(), |v| v.start().min(p.end()));
                if start <= end {
                    debug!(?start, ?end, "requesting unknown range");
                    builder.inconsistent(start, end);
                }
                last_p = Some(p);
                continue;
            }
        };
        last_p = Some(p);

        // Prefer the deepest local page still covering p's bounds: the
        // tighter the matched subtree, the smaller the sync window.
        while let Some(v) = local.next_if(|v| v.is_superset_of(p)) {
            l = v;
        }

        if l.hash() == p.hash() {
            trace!(range = ?p, "hash match - consistent subtree");
            builder.consistent(p.start(), p.end());
            skip_subtree(p, peer);
        } else {
            trace!(range = ?p, "hash mismatch - recursing");
            builder.inconsistent(p.start(), p.end());
            recurse_subtree(p, peer, local, builder);
        }
    }
}

fn recurse_subtree<'p, K: Ord + Clone + Debug>(
    subtree_root: &'p PageRange<K>,
    peer: &mut Peekable<Iter<'p, PageRange<K>>>,
    local: &mut Peekable<Iter<'p, PageRange<K>>>,
    builder: &mut DiffListBuilder<K>,
) {
    recurse_diff(subtree_root, peer, local, builder);

    // Any peer page left inside the subtree was never evaluated against
    // a local page; the local tree knows nothing about it.
    while let Some(p) = peer.next_if(|v| subtree_root.is_superset_of(v)) {
        debug!(range = ?p, "requesting unevaluated subtree page");
        builder.inconsistent(p.start(), p.end());
    }
}

/// Consumes every peer page contained in `page` (a proven-consistent
/// subtree).
fn skip_subtree<K: Ord>(page: &PageRange<K>, peer: &mut Peekable<Iter<'_, PageRange<K>>>) {
    while peer.next_if(|v| page.is_superset_of(v)).is_some() {}
}

/// Accumulates consistent and inconsistent intervals during the walk.
#[derive(Debug)]
struct DiffListBuilder<K> {
    inconsistent: Vec<DiffRange<K>>,
    consistent: Vec<DiffRange<K>>,
}

impl<K: Ord + Clone> DiffListBuilder<K> {
    fn new() -> Self {
        Self {
            inconsistent: Vec::new(),
            consistent: Vec::new(),
        }
    }

    fn inconsistent(&mut self, start: &K, end: &K) {
        self.inconsistent
            .push(DiffRange::new(start.clone(), end.clone()));
    }

    fn consistent(&mut self, start: &K, end: &K) {
        self.consistent
            .push(DiffRange::new(start.clone(), end.clone()));
    }

    fn into_diff_vec(self) -> Vec<DiffRange<K>> {
        let consistent = merge_overlapping(self.consistent);
        let mut ranges = merge_overlapping(self.inconsistent);
        for good in &consistent {
            ranges = ranges
                .into_iter()
                .flat_map(|bad| subtract_range(bad, good))
                .collect();
        }
        merge_overlapping(ranges)
    }
}

/// Sorts ranges and merges any that overlap.
fn merge_overlapping<K: Ord + Clone>(mut ranges: Vec<DiffRange<K>>) -> Vec<DiffRange<K>> {
    ranges.sort_by(|a, b| a.start().cmp(b.start()).then_with(|| a.end().cmp(b.end())));
    let mut out: Vec<DiffRange<K>> = Vec::with_capacity(ranges.len());
    for range in ranges {
        if let Some(last) = out.last_mut() {
            if range.start() <= last.end() {
                if range.end() > last.end() {
                    *last = DiffRange::new(last.start().clone(), range.end().clone());
                }
                continue;
            }
        }
        out.push(range);
    }
    out
}

/// Removes the proven-consistent interval `good` from `bad`.
///
/// Keys have no successor function, so trimmed pieces keep the boundary
/// key: requesting a consistent boundary key again is harmless, dropping
/// an inconsistent key would not be.
fn subtract_range<K: Ord + Clone>(bad: DiffRange<K>, good: &DiffRange<K>) -> Vec<DiffRange<K>> {
    if !bad.overlaps(good) {
        return vec![bad];
    }
    let mut out = Vec::new();
    if bad.start() < good.start() {
        out.push(DiffRange::new(bad.start().clone(), good.start().clone()));
    }
    if good.end() < bad.end() {
        out.push(DiffRange::new(good.end().clone(), bad.end().clone()));
    }
    out
}
