//! Journal subscriptions.
//!
//! A subscription is a cursor over the journal with an optional filter.
//! `next()` drains the backlog before it ever waits, so subscribers see
//! a finite replay followed by the live feed, with no seam between the
//! two and no duplicates.

use crate::journal::Journal;
use crate::DEFAULT_MAX_INFLIGHT;
use meshkv_types::{JournalEvent, JournalEventKind, SubscriptionId};
use tokio::sync::watch;

/// Options for opening a subscription.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionOptions {
    /// First sequence to deliver (defaults to 1, i.e. full replay).
    pub from_sequence: Option<u64>,
    /// Only deliver events for this map.
    pub map_name: Option<String>,
    /// Only deliver events of these kinds.
    pub kinds: Option<Vec<JournalEventKind>>,
    /// Cap on events handed out in a single `next_batch` call.
    pub max_inflight: usize,
}

impl SubscriptionOptions {
    /// Options for a full live replay with no filtering.
    #[must_use]
    pub fn from_sequence(seq: u64) -> Self {
        Self {
            from_sequence: Some(seq),
            max_inflight: DEFAULT_MAX_INFLIGHT,
            ..Self::default()
        }
    }
}

/// Event filter attached to a subscription. Conditions compose with AND.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionFilter {
    pub map_name: Option<String>,
    pub kinds: Option<Vec<JournalEventKind>>,
}

impl SubscriptionFilter {
    /// Returns true if the event passes the filter.
    #[must_use]
    pub fn matches(&self, event: &JournalEvent) -> bool {
        if let Some(map_name) = &self.map_name {
            if *map_name != event.map_name {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        true
    }
}

/// A live cursor over the journal.
///
/// Pull-based: the subscriber asks for the next event, so a slow
/// consumer buffers nothing and delays nobody else. Drop to unsubscribe;
/// events never handed out are simply skipped by the drop.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    journal: Journal,
    tail: watch::Receiver<u64>,
    next_seq: u64,
    filter: SubscriptionFilter,
    max_inflight: usize,
}

impl Subscription {
    pub(crate) fn new(
        id: SubscriptionId,
        journal: Journal,
        tail: watch::Receiver<u64>,
        from_sequence: u64,
        filter: SubscriptionFilter,
        max_inflight: usize,
    ) -> Self {
        Self {
            id,
            journal,
            tail,
            next_seq: from_sequence.max(1),
            filter,
            max_inflight: if max_inflight == 0 {
                DEFAULT_MAX_INFLIGHT
            } else {
                max_inflight
            },
        }
    }

    /// Returns this subscription's id.
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Returns the sequence the cursor will consider next.
    #[must_use]
    pub fn cursor(&self) -> u64 {
        self.next_seq
    }

    /// Returns the next matching event, waiting for an append if the
    /// backlog is exhausted. Returns `None` once the journal is gone.
    pub async fn next(&mut self) -> Option<JournalEvent> {
        loop {
            if let Some(event) = self.poll_backlog() {
                return Some(event);
            }
            // Backlog drained; wait for the tail to move.
            if self.tail.changed().await.is_err() {
                return None;
            }
        }
    }

    /// Returns the next matching event if one is already in the log.
    pub fn try_next(&mut self) -> Option<JournalEvent> {
        self.poll_backlog()
    }

    /// Returns up to `min(max, max_inflight)` immediately-available
    /// events, waiting only if none are available at all.
    pub async fn next_batch(&mut self, max: usize) -> Vec<JournalEvent> {
        let cap = max.min(self.max_inflight).max(1);
        let mut batch = Vec::new();
        match self.next().await {
            Some(event) => batch.push(event),
            None => return batch,
        }
        while batch.len() < cap {
            match self.try_next() {
                Some(event) => batch.push(event),
                None => break,
            }
        }
        batch
    }

    /// Scans forward from the cursor, consuming filtered-out events.
    fn poll_backlog(&mut self) -> Option<JournalEvent> {
        while let Some((next_seq, event)) = self.journal.next_matching(self.next_seq, &self.filter)
        {
            self.next_seq = next_seq;
            if let Some(event) = event {
                return Some(event);
            }
            // The scanned span was entirely filtered; check for more.
        }
        None
    }
}
