//! The journal itself: an in-memory, append-synchronized event log.

use crate::subscription::{Subscription, SubscriptionFilter, SubscriptionOptions};
use meshkv_types::{JournalEvent, NewJournalEvent, SubscriptionId};
use std::sync::{Arc, RwLock};
use tokio::sync::watch;
use tracing::debug;

/// The append-only journal of one node.
///
/// Cheaply clonable; all clones share the same log. Appends take the
/// writer lock only long enough to assign the next sequence and push;
/// readers take a snapshot of the tail sequence and read without
/// blocking appends for long.
#[derive(Debug, Clone)]
pub struct Journal {
    inner: Arc<RwLock<Log>>,
    /// Broadcasts the latest appended sequence to subscriptions.
    tail: Arc<watch::Sender<u64>>,
}

#[derive(Debug)]
struct Log {
    /// Sequence of the first retained event minus one. Non-zero when a
    /// restarted node resumes numbering from persisted metadata.
    base: u64,
    events: Vec<JournalEvent>,
}

impl Log {
    fn last_sequence(&self) -> u64 {
        self.base + self.events.len() as u64
    }
}

impl Journal {
    /// Creates an empty journal. The first appended event gets sequence 1.
    #[must_use]
    pub fn new() -> Self {
        Self::resume_from(0)
    }

    /// Creates a journal that continues numbering after
    /// `last_sequence`, for a node restarting from persisted metadata.
    /// Events up to that point are not replayable from this journal.
    #[must_use]
    pub fn resume_from(last_sequence: u64) -> Self {
        let (tail, _) = watch::channel(last_sequence);
        Self {
            inner: Arc::new(RwLock::new(Log {
                base: last_sequence,
                events: Vec::new(),
            })),
            tail: Arc::new(tail),
        }
    }

    /// Appends an event, assigning `last_sequence + 1`.
    ///
    /// Linearizable within the node: the sequence is assigned and the
    /// event becomes visible under a single writer lock.
    pub fn append(&self, body: NewJournalEvent) -> JournalEvent {
        let event = {
            let mut log = self.inner.write().expect("journal lock poisoned");
            let sequence = log.last_sequence() + 1;
            let event = body.into_event(sequence);
            log.events.push(event.clone());
            event
        };
        debug!(
            sequence = event.sequence,
            map = %event.map_name,
            key = %event.key,
            kind = ?event.kind,
            "journal append"
        );
        // Concurrent appends may reach this point out of order; the
        // tail only ever moves forward.
        self.tail.send_if_modified(|tail| {
            if event.sequence > *tail {
                *tail = event.sequence;
                true
            } else {
                false
            }
        });
        event
    }

    /// Returns the sequence of the most recent event (0 when empty).
    #[must_use]
    pub fn last_sequence(&self) -> u64 {
        self.inner
            .read()
            .expect("journal lock poisoned")
            .last_sequence()
    }

    /// Returns up to `limit` events with `sequence >= from_sequence`,
    /// in order.
    #[must_use]
    pub fn read_from(&self, from_sequence: u64, limit: usize) -> Vec<JournalEvent> {
        let log = self.inner.read().expect("journal lock poisoned");
        let start = from_sequence
            .max(log.base + 1)
            .saturating_sub(log.base + 1)
            .min(log.events.len() as u64) as usize;
        log.events[start..].iter().take(limit).cloned().collect()
    }

    /// Opens a subscription.
    ///
    /// Events already in the log from `from_sequence` onward are
    /// delivered first, then live appends as they happen. Delivery is
    /// exactly-once and in order for the lifetime of the subscription;
    /// dropping it unsubscribes.
    #[must_use]
    pub fn subscribe(&self, options: SubscriptionOptions) -> Subscription {
        let id = SubscriptionId::new();
        debug!(subscription = %id, from = options.from_sequence.unwrap_or(1), "journal subscribe");
        Subscription::new(
            id,
            self.clone(),
            self.tail.subscribe(),
            options.from_sequence.unwrap_or(1),
            SubscriptionFilter {
                map_name: options.map_name,
                kinds: options.kinds,
            },
            options.max_inflight,
        )
    }

    /// Reads the first event with `sequence >= from` matching `filter`,
    /// advancing past skipped events. Used by subscriptions.
    pub(crate) fn next_matching(
        &self,
        from: u64,
        filter: &SubscriptionFilter,
    ) -> Option<(u64, Option<JournalEvent>)> {
        let log = self.inner.read().expect("journal lock poisoned");
        let last = log.last_sequence();
        if from > last {
            return None;
        }
        let start = from.max(log.base + 1).saturating_sub(log.base + 1) as usize;
        for event in &log.events[start..] {
            if filter.matches(event) {
                return Some((event.sequence + 1, Some(event.clone())));
            }
        }
        // Everything from `from` to the tail was filtered out.
        Some((last + 1, None))
    }
}

impl Default for Journal {
    fn default() -> Self {
        Self::new()
    }
}
