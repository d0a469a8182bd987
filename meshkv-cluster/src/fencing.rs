//! Epoch counter and fencing tokens.
//!
//! The epoch is a process-wide monotonic counter bumped on every
//! membership change or detected node failure. Tokens are bound to the
//! epoch they were minted in:
//! - current epoch: valid
//! - one epoch back: valid until the grace window after the change
//!   elapses
//! - two or more epochs back: invalid immediately
//! - held by a failed node: invalid immediately, whatever the epoch
//!
//! Validation takes a read lock; epoch increments take the write lock.

use crate::{ClusterError, ClusterEvent, Result};
use meshkv_types::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

/// Default grace window for previous-epoch tokens (10 seconds).
pub const DEFAULT_GRACE_PERIOD_MS: u64 = 10_000;

/// Identifies a minted fencing token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenId(Uuid);

impl TokenId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A token authorizing mutations while its epoch window holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FencingToken {
    pub id: TokenId,
    pub epoch: u64,
    pub node_id: NodeId,
    /// Optional resource the token is scoped to (e.g. a partition).
    pub resource: Option<String>,
    pub created_at_ms: u64,
}

/// Why a token failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Two or more epochs behind.
    Stale,
    /// One epoch behind, but the grace window has elapsed.
    GraceExpired,
    /// Explicitly revoked (holder declared failed).
    Revoked,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RejectReason::Stale => "token epoch is stale",
            RejectReason::GraceExpired => "grace window elapsed",
            RejectReason::Revoked => "token was revoked",
        };
        f.write_str(s)
    }
}

/// One entry in the epoch history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochChange {
    pub epoch: u64,
    pub reason: String,
    pub changed_by: NodeId,
    pub at_ms: u64,
}

#[derive(Debug)]
struct FencingState {
    current_epoch: u64,
    epoch_changed_at_ms: u64,
    history: Vec<EpochChange>,
    active: HashMap<TokenId, FencingToken>,
    revoked: HashSet<TokenId>,
}

/// The node's epoch counter and token registry.
#[derive(Debug)]
pub struct FencingManager {
    state: RwLock<FencingState>,
    grace_period_ms: u64,
    events: broadcast::Sender<ClusterEvent>,
}

impl FencingManager {
    /// Creates a manager at epoch 0 with the default grace window.
    #[must_use]
    pub fn new() -> Self {
        Self::with_grace_period(DEFAULT_GRACE_PERIOD_MS)
    }

    /// Creates a manager with an explicit grace window.
    #[must_use]
    pub fn with_grace_period(grace_period_ms: u64) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            state: RwLock::new(FencingState {
                current_epoch: 0,
                epoch_changed_at_ms: now_ms(),
                history: Vec::new(),
                active: HashMap::new(),
                revoked: HashSet::new(),
            }),
            grace_period_ms,
            events,
        }
    }

    /// Returns the current epoch.
    #[must_use]
    pub fn current_epoch(&self) -> u64 {
        self.state.read().expect("fencing lock poisoned").current_epoch
    }

    /// Returns a copy of the epoch history, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<EpochChange> {
        self.state
            .read()
            .expect("fencing lock poisoned")
            .history
            .clone()
    }

    /// Subscribes to epoch and token events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events.subscribe()
    }

    /// Mints a token bound to the current epoch.
    pub fn mint_token(&self, node_id: NodeId, resource: Option<String>) -> FencingToken {
        let mut state = self.state.write().expect("fencing lock poisoned");
        let token = FencingToken {
            id: TokenId::new(),
            epoch: state.current_epoch,
            node_id,
            resource,
            created_at_ms: now_ms(),
        };
        state.active.insert(token.id, token.clone());
        token
    }

    /// Releases a token; it no longer validates.
    pub fn release_token(&self, token: &FencingToken) {
        let mut state = self.state.write().expect("fencing lock poisoned");
        state.active.remove(&token.id);
        state.revoked.insert(token.id);
    }

    /// Validates a token against the current epoch and grace window.
    pub fn validate(&self, token: &FencingToken) -> Result<()> {
        let state = self.state.read().expect("fencing lock poisoned");

        let reject = |reason| {
            Err(ClusterError::Fenced {
                reason,
                token_epoch: token.epoch,
                current_epoch: state.current_epoch,
            })
        };

        if state.revoked.contains(&token.id) {
            return reject(RejectReason::Revoked);
        }
        if token.epoch == state.current_epoch {
            return Ok(());
        }
        if token.epoch + 1 == state.current_epoch {
            if now_ms() <= state.epoch_changed_at_ms + self.grace_period_ms {
                return Ok(());
            }
            return reject(RejectReason::GraceExpired);
        }
        reject(RejectReason::Stale)
    }

    /// Advances the epoch, recording the change. Returns the new epoch.
    pub fn increment_epoch(&self, reason: impl Into<String>, changed_by: NodeId) -> u64 {
        let reason = reason.into();
        let epoch = {
            let mut state = self.state.write().expect("fencing lock poisoned");
            state.current_epoch += 1;
            state.epoch_changed_at_ms = now_ms();
            let change = EpochChange {
                epoch: state.current_epoch,
                reason: reason.clone(),
                changed_by,
                at_ms: state.epoch_changed_at_ms,
            };
            state.history.push(change);
            state.current_epoch
        };
        info!(epoch, %reason, "epoch advanced");
        let _ = self.events.send(ClusterEvent::EpochChanged { epoch, reason });
        epoch
    }

    /// Adopts a higher epoch learned from a peer (handshake or epoch
    /// bump). A lower or equal epoch is a no-op. Returns the current
    /// epoch afterwards.
    pub fn adopt_epoch(&self, epoch: u64, reason: impl Into<String>, learned_from: NodeId) -> u64 {
        let reason = reason.into();
        let adopted = {
            let mut state = self.state.write().expect("fencing lock poisoned");
            if epoch <= state.current_epoch {
                return state.current_epoch;
            }
            state.current_epoch = epoch;
            let changed_at_ms = now_ms();
            state.epoch_changed_at_ms = changed_at_ms;
            state.history.push(EpochChange {
                epoch,
                reason: reason.clone(),
                changed_by: learned_from,
                at_ms: changed_at_ms,
            });
            epoch
        };
        info!(epoch = adopted, %reason, "epoch adopted from peer");
        let _ = self.events.send(ClusterEvent::EpochChanged {
            epoch: adopted,
            reason,
        });
        adopted
    }

    /// Handles a membership change: bumps the epoch; existing tokens
    /// follow the grace-window rule.
    pub fn on_membership_change(&self, reason: impl Into<String>, changed_by: NodeId) -> u64 {
        self.increment_epoch(reason, changed_by)
    }

    /// Handles a detected node failure: bumps the epoch and immediately
    /// revokes every token the failed node holds.
    pub fn on_node_failure(&self, failed: NodeId, detected_by: NodeId) -> u64 {
        let epoch = self.increment_epoch(format!("node failure: {failed}"), detected_by);

        let revoked: Vec<TokenId> = {
            let mut state = self.state.write().expect("fencing lock poisoned");
            let ids: Vec<TokenId> = state
                .active
                .values()
                .filter(|t| t.node_id == failed)
                .map(|t| t.id)
                .collect();
            for id in &ids {
                state.active.remove(id);
                state.revoked.insert(*id);
            }
            ids
        };

        for token in revoked {
            warn!(%token, holder = %failed, "token revoked by node failure");
            let _ = self.events.send(ClusterEvent::TokenInvalidated {
                token,
                holder: failed,
            });
        }
        epoch
    }
}

impl Default for FencingManager {
    fn default() -> Self {
        Self::new()
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before Unix epoch")
        .as_millis() as u64
}
