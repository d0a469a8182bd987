//! Sync engine for MeshKV.
//!
//! Ties the lower layers into one node: the [`NodeStore`] runs the
//! write path (LWW merge + journal + Merkle trees + fencing), the
//! [`SyncSession`] state machine drives anti-entropy and live
//! replication per peer, and the [`BroadcastService`] batches journal
//! events into fan-out bundles for connected clients.
//!
//! # Architecture
//!
//! - **Protocol**: tagged messages over a reliable per-peer channel
//! - **Store**: the single-writer critical section over a node's state
//! - **Engine**: per-peer state machine, pure message-in/messages-out
//! - **Broadcast**: interval-flushed journal fan-out
//! - **Transport**: the [`PeerChannel`] seam implementations plug into
//!
//! # Sync flow
//!
//! 1. **Handshake**: exchange node id, epoch and partition roster; the
//!    lower epoch adopts the higher
//! 2. **Sync**: exchange Merkle page ranges per partition, diff, fetch
//!    inconsistent ranges, merge
//! 3. **Live**: subscribe to the peer's journal from the last applied
//!    sequence; divergence drops the session back to sync

mod broadcast;
mod engine;
mod error;
pub mod protocol;
mod store;
pub mod transport;

pub use broadcast::{
    BroadcastBundle, BroadcastConfig, BroadcastService, BroadcastStats, FlushSink,
};
pub use engine::{SessionConfig, SessionState, SyncSession};
pub use error::{ErrorCode, SyncError, SyncResult};
pub use protocol::{
    ErrorBody, FetchedEntry, HandshakeAckBody, HandshakeBody, Message, PROTOCOL_VERSION,
};
pub use store::{
    composite_key, split_composite_key, MergeReport, NodeStore, NodeStoreConfig,
};
pub use transport::PeerChannel;
