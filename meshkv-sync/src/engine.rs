//! Per-peer sync session — stateful sync logic without I/O.
//!
//! The session is a state machine: it consumes protocol messages and
//! produces the messages to send back. The orchestrator owns all I/O
//! (reading/writing the peer channel, timers, reconnects) and feeds the
//! session; this keeps every transition deterministic and testable
//! without a transport.
//!
//! States: `Connecting → Handshake → Syncing → Live`, with `Closed` and
//! `Errored` reachable from anywhere. `Live` drops back to `Syncing`
//! when divergence shows up (a journal gap or a peer epoch bump).

use crate::error::{SyncError, SyncResult};
use crate::protocol::{
    ErrorBody, HandshakeAckBody, HandshakeBody, Message, PROTOCOL_VERSION,
};
use crate::store::NodeStore;
use meshkv_cluster::FencingToken;
use meshkv_crdt::{LwwRecord, Record};
use meshkv_journal::{Subscription, SubscriptionOptions};
use meshkv_mst::RootHash;
use meshkv_types::{
    JournalEvent, JournalEventKind, NodeId, PartitionId, RequestId, SubscriptionId,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Deadline for an individual sync request.
    pub request_timeout_ms: u64,
    /// Transient transport errors tolerated before giving up.
    pub max_reconnect_attempts: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            max_reconnect_attempts: 10,
        }
    }
}

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Handshake,
    Syncing,
    Live,
    Closed,
    Errored,
}

/// A per-peer sync session.
pub struct SyncSession {
    store: Arc<NodeStore>,
    config: SessionConfig,
    state: SessionState,
    token: FencingToken,
    peer: Option<NodeId>,
    peer_epoch: u64,
    /// Outstanding page-range requests by id.
    pending_page_ranges: HashSet<RequestId>,
    /// Outstanding diff fetches by id.
    pending_fetches: HashSet<RequestId>,
    /// The peer's subscription to our journal.
    outbound: Option<Subscription>,
    /// Our subscription id on the peer's journal.
    inbound_subscription: Option<SubscriptionId>,
    /// Highest peer journal sequence we applied.
    last_peer_sequence: u64,
    /// The peer's journal tail as of the handshake; anti-entropy covers
    /// everything up to here.
    peer_journal_tail: u64,
    /// Partitions the peer advertised data for.
    peer_partitions: Vec<PartitionId>,
    /// Root hashes from the peer's most recent page-range responses.
    remote_roots: HashMap<PartitionId, RootHash>,
    /// Anti-entropy rounds run since the last (re-)entry into Syncing.
    sync_rounds: u32,
    reconnect_attempts: u32,
}

/// Anti-entropy rounds attempted before going live regardless; a peer
/// that is itself still pulling from us can lag our root hashes.
const MAX_SYNC_ROUNDS: u32 = 8;

impl SyncSession {
    /// Creates a session in `Connecting`.
    #[must_use]
    pub fn new(store: Arc<NodeStore>, config: SessionConfig) -> Self {
        let token = store.mint_token();
        Self {
            store,
            config,
            state: SessionState::Connecting,
            token,
            peer: None,
            peer_epoch: 0,
            pending_page_ranges: HashSet::new(),
            pending_fetches: HashSet::new(),
            outbound: None,
            inbound_subscription: None,
            last_peer_sequence: 0,
            peer_journal_tail: 0,
            peer_partitions: Vec::new(),
            remote_roots: HashMap::new(),
            sync_rounds: 0,
            reconnect_attempts: 0,
        }
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Returns the peer's node id once the handshake has run.
    #[must_use]
    pub fn peer(&self) -> Option<NodeId> {
        self.peer
    }

    /// Returns the peer's epoch as last reported.
    #[must_use]
    pub fn peer_epoch(&self) -> u64 {
        self.peer_epoch
    }

    /// Returns the configured request timeout.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.config.request_timeout_ms)
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// The transport came up: produce our handshake.
    pub async fn connect(&mut self) -> Message {
        self.state = SessionState::Handshake;
        self.reconnect_attempts = 0;
        Message::Handshake(HandshakeBody {
            version: PROTOCOL_VERSION,
            node_id: self.store.node_id(),
            epoch: self.store.fencing().current_epoch(),
            partition_roster: self.store.router().ownerships(),
            last_sequence: self.store.journal().last_sequence(),
            partitions: self.store.touched_partitions().await,
        })
    }

    /// A transient transport error happened. Returns how long to wait
    /// before reconnecting, or `None` once the retry budget is spent
    /// (the session is then `Errored`).
    pub fn on_transport_error(&mut self) -> Option<Duration> {
        self.reconnect_attempts += 1;
        if self.reconnect_attempts > self.config.max_reconnect_attempts {
            warn!(attempts = self.reconnect_attempts, "retry budget exhausted");
            self.state = SessionState::Errored;
            return None;
        }
        // 0ms on the first attempt, +1s per attempt after, capped at 10s.
        let delay = Duration::from_secs(u64::from(self.reconnect_attempts - 1).min(10));
        debug!(attempt = self.reconnect_attempts, ?delay, "scheduling reconnect");
        Some(delay)
    }

    /// The peer disconnected or we are shutting down.
    pub fn on_disconnect(&mut self) {
        info!(peer = ?self.peer, "session closed");
        self.outbound = None;
        self.state = SessionState::Closed;
    }

    /// A pending sync request passed its deadline: outstanding work is
    /// discarded and the caller receives `Timeout`. Merges already
    /// applied stay applied — they are convergent either way.
    pub fn on_timeout(&mut self) -> SyncError {
        warn!(peer = ?self.peer, "sync request timed out");
        self.pending_page_ranges.clear();
        self.pending_fetches.clear();
        self.state = SessionState::Errored;
        SyncError::Timeout
    }

    /// Builds the unsolicited epoch announcement for this node's
    /// current epoch.
    #[must_use]
    pub fn epoch_bump_message(&self, reason: impl Into<String>) -> Message {
        Message::EpochBump {
            epoch: self.store.fencing().current_epoch(),
            reason: reason.into(),
        }
    }

    /// Builds the teardown message for our subscription on the peer's
    /// journal, if one is open. Send before disconnecting cleanly.
    pub fn unsubscribe_message(&mut self) -> Option<Message> {
        self.inbound_subscription
            .take()
            .map(|subscription_id| Message::JournalUnsubscribe { subscription_id })
    }

    // ── Message handling ─────────────────────────────────────────

    /// Feeds one inbound message through the state machine, returning
    /// the messages to send back.
    pub async fn handle_message(&mut self, message: Message) -> SyncResult<Vec<Message>> {
        match message {
            Message::Handshake(body) => self.handle_handshake(body).await,
            Message::HandshakeAck(body) => self.handle_handshake_ack(body).await,
            Message::EpochBump { epoch, reason } => self.handle_epoch_bump(epoch, &reason).await,
            Message::PageRangesRequest {
                request_id,
                partition,
            } => Ok(vec![self.page_ranges_response(request_id, partition).await]),
            Message::PageRangesResponse {
                request_id,
                partition,
                root_hash,
                ranges,
            } => {
                self.handle_page_ranges(request_id, partition, root_hash, ranges)
                    .await
            }
            Message::DiffFetch {
                request_id,
                partition,
                range_start,
                range_end,
            } => Ok(vec![
                self.diff_fetch_response(request_id, partition, &range_start, &range_end)
                    .await,
            ]),
            Message::DiffFetchResponse {
                request_id,
                entries,
                ..
            } => self.handle_fetched_entries(request_id, entries).await,
            Message::Merge {
                map_name,
                key,
                record,
            } => self.handle_merge(&map_name, &key, record).await,
            Message::JournalRead {
                request_id,
                from_sequence,
                limit,
                map_name,
            } => Ok(vec![self.journal_read_response(
                request_id,
                from_sequence,
                limit,
                map_name,
            )]),
            Message::JournalSubscribe {
                request_id,
                from_sequence,
                map_name,
                kinds,
            } => Ok(vec![self.open_outbound_subscription(
                request_id,
                from_sequence,
                map_name,
                kinds,
            )]),
            Message::JournalSubscribeAck {
                subscription_id, ..
            } => {
                self.inbound_subscription = Some(subscription_id);
                Ok(Vec::new())
            }
            Message::JournalEvent { event, .. } => self.handle_journal_event(event).await,
            Message::JournalUnsubscribe { .. } => {
                self.outbound = None;
                Ok(Vec::new())
            }
            Message::JournalReadResponse { .. } | Message::MergeAck { .. } => {
                // Responses the orchestrator correlates; nothing for the
                // state machine to do.
                Ok(Vec::new())
            }
            Message::Error { request_id, error } => {
                warn!(?request_id, code = ?error.code, message = %error.message, "peer reported error");
                self.pending_page_ranges.clear();
                self.pending_fetches.clear();
                self.state = SessionState::Errored;
                Ok(Vec::new())
            }
        }
    }

    /// Drains already-available events from the peer's subscription to
    /// our journal into push messages. Never blocks.
    pub fn pump_subscription(&mut self, max: usize) -> Vec<Message> {
        let Some(subscription) = self.outbound.as_mut() else {
            return Vec::new();
        };
        let subscription_id = subscription.id();
        let mut out = Vec::new();
        while out.len() < max {
            match subscription.try_next() {
                Some(event) => out.push(Message::JournalEvent {
                    subscription_id,
                    event,
                }),
                None => break,
            }
        }
        out
    }

    // ── Handshake ────────────────────────────────────────────────

    async fn handle_handshake(&mut self, body: HandshakeBody) -> SyncResult<Vec<Message>> {
        if body.version != PROTOCOL_VERSION {
            self.state = SessionState::Errored;
            return Ok(vec![Message::HandshakeAck(HandshakeAckBody {
                version: PROTOCOL_VERSION,
                node_id: self.store.node_id(),
                epoch: self.store.fencing().current_epoch(),
                partition_roster: self.store.router().ownerships(),
                last_sequence: self.store.journal().last_sequence(),
                partitions: Vec::new(),
                accepted: false,
                reason: Some(format!(
                    "version mismatch: expected {PROTOCOL_VERSION}, got {}",
                    body.version
                )),
            })]);
        }

        self.adopt_peer_view(
            body.node_id,
            body.epoch,
            body.partition_roster,
            body.last_sequence,
            body.partitions,
        );
        info!(peer = ?self.peer, "handshake received");

        let ack = Message::HandshakeAck(HandshakeAckBody {
            version: PROTOCOL_VERSION,
            node_id: self.store.node_id(),
            epoch: self.store.fencing().current_epoch(),
            partition_roster: self.store.router().ownerships(),
            last_sequence: self.store.journal().last_sequence(),
            partitions: self.store.touched_partitions().await,
            accepted: true,
            reason: None,
        });

        let mut out = vec![ack];
        out.extend(self.begin_sync().await);
        Ok(out)
    }

    async fn handle_handshake_ack(&mut self, body: HandshakeAckBody) -> SyncResult<Vec<Message>> {
        if self.state != SessionState::Handshake {
            warn!("unexpected handshake ack in {:?}", self.state);
            return Ok(Vec::new());
        }
        if !body.accepted {
            self.state = SessionState::Errored;
            return Err(SyncError::Protocol(format!(
                "handshake rejected: {}",
                body.reason.unwrap_or_else(|| "unspecified".into())
            )));
        }

        self.adopt_peer_view(
            body.node_id,
            body.epoch,
            body.partition_roster,
            body.last_sequence,
            body.partitions,
        );
        info!(peer = ?self.peer, "handshake acknowledged");
        Ok(self.begin_sync().await)
    }

    fn adopt_peer_view(
        &mut self,
        peer: NodeId,
        epoch: u64,
        roster: HashMap<PartitionId, meshkv_cluster::PartitionOwnership>,
        last_sequence: u64,
        partitions: Vec<PartitionId>,
    ) {
        self.peer = Some(peer);
        self.peer_epoch = epoch;
        self.peer_journal_tail = last_sequence;
        self.peer_partitions = partitions;
        // The lower-epoch side adopts the higher epoch.
        self.store.fencing().adopt_epoch(epoch, "peer handshake", peer);
        self.store.router().merge_roster(roster);
        // The adoption may have left our token behind; refresh it.
        self.token = self.store.mint_token();
    }

    /// Enters `Syncing`: request page ranges for every partition either
    /// side holds data for. With nothing to compare we go straight to
    /// live.
    async fn begin_sync(&mut self) -> Vec<Message> {
        self.sync_rounds = 0;
        let mut partitions = self.store.touched_partitions().await;
        partitions.extend(self.peer_partitions.iter().copied());
        partitions.sort_unstable();
        partitions.dedup();
        if partitions.is_empty() {
            return self.go_live();
        }

        self.state = SessionState::Syncing;
        debug!(partitions = partitions.len(), "entering sync");
        self.request_page_ranges(partitions)
    }

    fn request_page_ranges(&mut self, partitions: Vec<PartitionId>) -> Vec<Message> {
        let mut out = Vec::with_capacity(partitions.len());
        for partition in partitions {
            let request_id = RequestId::new();
            self.pending_page_ranges.insert(request_id);
            out.push(Message::PageRangesRequest {
                request_id,
                partition,
            });
        }
        out
    }

    fn go_live(&mut self) -> Vec<Message> {
        self.state = SessionState::Live;
        // Anti-entropy covered the peer's journal up to the handshake
        // tail; subscribe for everything after it (or after whatever we
        // already applied, on re-entry).
        self.last_peer_sequence = self.last_peer_sequence.max(self.peer_journal_tail);
        let from_sequence = self.last_peer_sequence + 1;
        info!(peer = ?self.peer, from = from_sequence, "sync complete, going live");
        vec![Message::JournalSubscribe {
            request_id: RequestId::new(),
            from_sequence: Some(from_sequence),
            map_name: None,
            kinds: None,
        }]
    }

    /// Once all outstanding requests are answered, either the root
    /// hashes agree and the session goes live, or another bounded
    /// anti-entropy round runs (the peer may still be pulling from us).
    async fn maybe_go_live(&mut self) -> Vec<Message> {
        if self.state != SessionState::Syncing
            || !self.pending_page_ranges.is_empty()
            || !self.pending_fetches.is_empty()
        {
            return Vec::new();
        }

        let mut divergent = Vec::new();
        for (&partition, &remote_root) in &self.remote_roots {
            if self.store.root_hash(partition).await != remote_root {
                divergent.push(partition);
            }
        }

        if divergent.is_empty() || self.sync_rounds >= MAX_SYNC_ROUNDS {
            if !divergent.is_empty() {
                warn!(
                    partitions = divergent.len(),
                    rounds = self.sync_rounds,
                    "going live with unconverged partitions; divergence detection will retry"
                );
            }
            return self.go_live();
        }

        self.sync_rounds += 1;
        divergent.sort_unstable();
        debug!(round = self.sync_rounds, partitions = divergent.len(), "re-running anti-entropy");
        self.request_page_ranges(divergent)
    }

    // ── Anti-entropy ─────────────────────────────────────────────

    async fn page_ranges_response(
        &self,
        request_id: RequestId,
        partition: PartitionId,
    ) -> Message {
        Message::PageRangesResponse {
            request_id,
            partition,
            root_hash: self.store.root_hash(partition).await,
            ranges: self.store.page_ranges(partition).await,
        }
    }

    async fn handle_page_ranges(
        &mut self,
        request_id: RequestId,
        partition: PartitionId,
        root_hash: RootHash,
        ranges: Vec<meshkv_mst::PageRange<String>>,
    ) -> SyncResult<Vec<Message>> {
        if !self.pending_page_ranges.remove(&request_id) {
            warn!(%request_id, "page ranges for unknown request");
            return Ok(Vec::new());
        }
        self.remote_roots.insert(partition, root_hash);

        let comparison = self
            .store
            .compare_with_remote(partition, root_hash, &ranges)
            .await;
        debug!(
            %partition,
            needs_sync = comparison.needs_sync,
            ranges = comparison.diff_ranges.len(),
            "compared with remote"
        );

        let mut out = Vec::with_capacity(comparison.diff_ranges.len());
        for diff in comparison.diff_ranges {
            let request_id = RequestId::new();
            self.pending_fetches.insert(request_id);
            out.push(Message::DiffFetch {
                request_id,
                partition,
                range_start: diff.start().clone(),
                range_end: diff.end().clone(),
            });
        }
        out.extend(self.maybe_go_live().await);
        Ok(out)
    }

    async fn diff_fetch_response(
        &self,
        request_id: RequestId,
        partition: PartitionId,
        range_start: &str,
        range_end: &str,
    ) -> Message {
        Message::DiffFetchResponse {
            request_id,
            partition,
            entries: self
                .store
                .fetch_range(partition, range_start, range_end)
                .await,
        }
    }

    async fn handle_fetched_entries(
        &mut self,
        request_id: RequestId,
        entries: Vec<crate::protocol::FetchedEntry>,
    ) -> SyncResult<Vec<Message>> {
        if !self.pending_fetches.remove(&request_id) {
            warn!(%request_id, "fetch response for unknown request");
            return Ok(Vec::new());
        }

        let mut applied = 0usize;
        for entry in entries {
            let report = self
                .store
                .merge_remote(&self.token, &entry.map_name, &entry.key, entry.record)
                .await?;
            if report.applied {
                applied += 1;
            }
        }
        debug!(applied, "merged fetched range");
        Ok(self.maybe_go_live().await)
    }

    // ── Single merges & journal plumbing ─────────────────────────

    async fn handle_merge(
        &mut self,
        map_name: &str,
        key: &str,
        record: Record,
    ) -> SyncResult<Vec<Message>> {
        match self.store.merge_remote(&self.token, map_name, key, record).await {
            Ok(report) => Ok(vec![Message::MergeAck {
                applied: report.applied,
                rejected: report.rejected,
                current_timestamp: report.current_timestamp,
            }]),
            Err(e) => Ok(vec![Message::Error {
                request_id: None,
                error: ErrorBody::from_error(&e),
            }]),
        }
    }

    fn journal_read_response(
        &self,
        request_id: RequestId,
        from_sequence: u64,
        limit: u32,
        map_name: Option<String>,
    ) -> Message {
        let mut events = self.store.journal().read_from(from_sequence, limit as usize);
        if let Some(map_name) = map_name {
            events.retain(|e| e.map_name == map_name);
        }
        Message::JournalReadResponse { request_id, events }
    }

    fn open_outbound_subscription(
        &mut self,
        request_id: RequestId,
        from_sequence: Option<u64>,
        map_name: Option<String>,
        kinds: Option<Vec<JournalEventKind>>,
    ) -> Message {
        let subscription = self.store.subscribe(SubscriptionOptions {
            from_sequence,
            map_name,
            kinds,
            ..Default::default()
        });
        let subscription_id = subscription.id();
        debug!(%subscription_id, "peer subscribed to journal");
        self.outbound = Some(subscription);
        Message::JournalSubscribeAck {
            request_id,
            subscription_id,
        }
    }

    async fn handle_journal_event(&mut self, event: JournalEvent) -> SyncResult<Vec<Message>> {
        // A sequence gap means we missed events: fall back to a full
        // anti-entropy round.
        if self.last_peer_sequence != 0 && event.sequence > self.last_peer_sequence + 1 {
            warn!(
                expected = self.last_peer_sequence + 1,
                got = event.sequence,
                "journal gap detected, resyncing"
            );
            self.last_peer_sequence = event.sequence;
            return Ok(self.begin_sync().await);
        }
        self.last_peer_sequence = self.last_peer_sequence.max(event.sequence);

        let record = match event.kind {
            JournalEventKind::Deleted => LwwRecord::tombstone(event.timestamp),
            JournalEventKind::Inserted | JournalEventKind::Updated => match event.value {
                Some(value) => LwwRecord::new(value, event.timestamp),
                None => {
                    return Err(SyncError::Protocol(
                        "journal event without a value".into(),
                    ))
                }
            },
            // Conflict notifications carry no state to apply.
            JournalEventKind::MergeRejected => return Ok(Vec::new()),
        };

        self.store
            .merge_remote(&self.token, &event.map_name, &event.key, record)
            .await?;
        Ok(Vec::new())
    }

    async fn handle_epoch_bump(&mut self, epoch: u64, reason: &str) -> SyncResult<Vec<Message>> {
        info!(epoch, reason, "peer epoch bump");
        if let Some(peer) = self.peer {
            self.store.fencing().adopt_epoch(epoch, reason, peer);
        }
        self.peer_epoch = epoch;
        self.token = self.store.mint_token();
        if self.state == SessionState::Live {
            // Ownership may have moved; re-verify the trees.
            return Ok(self.begin_sync().await);
        }
        Ok(Vec::new())
    }
}
