//! CRDT implementations for MeshKV.
//!
//! This crate provides the convergent state types of the store:
//!
//! - [`LwwRecord<V>`] — Last-Writer-Wins register for a single key
//! - [`LwwMap`] — a named map of string keys to LWW records
//! - [`VersionVector`] — per-node write counters for observability
//!
//! All merge operations in this crate satisfy:
//! - **Commutative**: merge(a, b) == merge(b, a)
//! - **Associative**: merge(merge(a, b), c) == merge(a, merge(b, c))
//! - **Idempotent**: merge(a, a) == a
//!
//! These properties ensure replicas converge to the same state
//! regardless of the order in which records are exchanged.

mod lww_map;
mod lww_record;
mod version_vector;

pub use lww_map::{LwwMap, MergeOutcome, Record, SetOutcome};
pub use lww_record::LwwRecord;
pub use version_vector::VersionVector;
