//! Partition routing and epoch fencing for MeshKV.
//!
//! Two cooperating pieces keep mutations correct through membership
//! churn:
//!
//! - [`PartitionRouter`] — deterministic key-to-partition hashing plus
//!   the epoch-stamped ownership table
//! - [`FencingManager`] — the node's monotonic epoch counter and the
//!   fencing tokens that gate every externally-observable mutation
//!
//! A writer that held a token across a membership change keeps working
//! through a grace window one epoch back; anything older is fenced off
//! so a stale primary can never clobber state it no longer owns.

mod fencing;
mod router;

pub use fencing::{EpochChange, FencingManager, FencingToken, RejectReason, TokenId};
pub use router::{PartitionOwnership, PartitionRouter};

use meshkv_types::{NodeId, PartitionId};

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, ClusterError>;

/// Errors surfaced by routing and fencing.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClusterError {
    /// The token no longer authorizes mutations.
    #[error("fenced: {reason} (token epoch {token_epoch}, current epoch {current_epoch})")]
    Fenced {
        reason: RejectReason,
        token_epoch: u64,
        current_epoch: u64,
    },

    /// No ownership is recorded for the partition.
    #[error("unknown partition {0}")]
    UnknownPartition(PartitionId),
}

/// Events emitted by the cluster layer.
#[derive(Debug, Clone)]
pub enum ClusterEvent {
    /// The epoch advanced.
    EpochChanged { epoch: u64, reason: String },
    /// A token was revoked ahead of its epoch window.
    TokenInvalidated { token: TokenId, holder: NodeId },
    /// A partition's ownership changed.
    PartitionRebalance {
        partition: PartitionId,
        primary: NodeId,
        epoch: u64,
    },
}
