//! Broadcast fan-out: batches journal events into interval-flushed
//! bundles.
//!
//! Events buffer per `exclude_client` bucket (None = broadcast to all)
//! and a timer flushes every `flush_interval_ms`. Two overrides: a full
//! buffer flushes immediately, and adaptive mode flushes small buffers
//! opportunistically once half the interval has elapsed. Delivery order
//! is preserved within a bucket; buckets are independent.

use meshkv_types::{ClientId, JournalEvent};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
// Tokio's Instant honors paused test time, unlike std's.
use tokio::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Configuration for the broadcast service.
#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    /// Timer flush period.
    pub flush_interval_ms: u64,
    /// Buffered-event count that forces an immediate flush.
    pub max_buffer_size: usize,
    /// Adaptive mode: buffers at or below this size may flush early.
    pub min_batch_size: usize,
    /// Enables the opportunistic early flush.
    pub adaptive_flush: bool,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 100,
            max_buffer_size: 1_000,
            min_batch_size: 10,
            adaptive_flush: false,
        }
    }
}

/// One flushed batch for one exclusion bucket.
#[derive(Debug, Clone)]
pub struct BroadcastBundle {
    /// The client whose own echo is excluded (None = everyone).
    pub exclude_client: Option<ClientId>,
    /// Buffered events in append order.
    pub events: Vec<JournalEvent>,
}

/// Delivery counters, readable at any time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BroadcastStats {
    /// Flush cycles that delivered at least one event.
    pub total_flushes: u64,
    /// Events handed to the sink across all flushes.
    pub total_events_delivered: u64,
    /// Mean events per flush cycle.
    pub avg_events_per_flush: f64,
    /// Events currently buffered across all buckets.
    pub buffer_size: usize,
}

/// The delivery callback. Errors are caught and logged; they never
/// abort the flush loop.
pub type FlushSink = Arc<dyn Fn(BroadcastBundle) -> Result<(), String> + Send + Sync>;

struct BroadcastState {
    buffers: HashMap<Option<ClientId>, Vec<JournalEvent>>,
    last_flush_at: Instant,
    total_flushes: u64,
    total_events_delivered: u64,
}

struct Shared {
    config: BroadcastConfig,
    sink: FlushSink,
    state: Mutex<BroadcastState>,
    shutdown: Notify,
}

/// Batches journal events into per-bucket bundles and delivers them on
/// a timer.
pub struct BroadcastService {
    shared: Arc<Shared>,
    task: Option<JoinHandle<()>>,
}

impl BroadcastService {
    /// Starts the service, spawning its flush timer.
    #[must_use]
    pub fn start(config: BroadcastConfig, sink: FlushSink) -> Self {
        let shared = Arc::new(Shared {
            config,
            sink,
            state: Mutex::new(BroadcastState {
                buffers: HashMap::new(),
                last_flush_at: Instant::now(),
                total_flushes: 0,
                total_events_delivered: 0,
            }),
            shutdown: Notify::new(),
        });
        let task = tokio::spawn(flush_loop(Arc::clone(&shared)));
        Self {
            shared,
            task: Some(task),
        }
    }

    /// Buffers an event for fan-out. A full buffer flushes right away.
    pub fn enqueue(&self, exclude_client: Option<ClientId>, event: JournalEvent) {
        let should_flush = {
            let mut state = self.shared.state.lock().expect("broadcast lock poisoned");
            state
                .buffers
                .entry(exclude_client)
                .or_default()
                .push(event);
            buffered_total(&state) >= self.shared.config.max_buffer_size
        };
        if should_flush {
            debug!("buffer limit reached, flushing immediately");
            flush_now(&self.shared);
        }
    }

    /// Returns current delivery counters.
    #[must_use]
    pub fn stats(&self) -> BroadcastStats {
        let state = self.shared.state.lock().expect("broadcast lock poisoned");
        let flushes = state.total_flushes;
        BroadcastStats {
            total_flushes: flushes,
            total_events_delivered: state.total_events_delivered,
            avg_events_per_flush: if flushes == 0 {
                0.0
            } else {
                state.total_events_delivered as f64 / flushes as f64
            },
            buffer_size: buffered_total(&state),
        }
    }

    /// Flushes whatever is buffered and stops the timer.
    pub async fn stop(mut self) {
        self.shared.shutdown.notify_one();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "broadcast flush task panicked");
            }
        }
        flush_now(&self.shared);
    }
}

async fn flush_loop(shared: Arc<Shared>) {
    let interval = Duration::from_millis(shared.config.flush_interval_ms.max(1));
    // Adaptive mode needs to observe the half-interval mark.
    let tick = if shared.config.adaptive_flush {
        interval / 2
    } else {
        interval
    };

    loop {
        tokio::select! {
            _ = tokio::time::sleep(tick) => {}
            _ = shared.shutdown.notified() => return,
        }

        let due = {
            let state = shared.state.lock().expect("broadcast lock poisoned");
            let elapsed = state.last_flush_at.elapsed();
            let buffered = buffered_total(&state);
            if buffered == 0 {
                false
            } else if elapsed >= interval {
                true
            } else {
                shared.config.adaptive_flush
                    && buffered <= shared.config.min_batch_size
                    && elapsed >= interval / 2
            }
        };
        if due {
            flush_now(&shared);
        }
    }
}

fn flush_now(shared: &Shared) {
    let bundles: Vec<BroadcastBundle> = {
        let mut state = shared.state.lock().expect("broadcast lock poisoned");
        state.last_flush_at = Instant::now();
        let bundles: Vec<BroadcastBundle> = state
            .buffers
            .drain()
            .filter(|(_, events)| !events.is_empty())
            .map(|(exclude_client, events)| BroadcastBundle {
                exclude_client,
                events,
            })
            .collect();
        if bundles.is_empty() {
            return;
        }
        let delivered: usize = bundles.iter().map(|b| b.events.len()).sum();
        state.total_flushes += 1;
        state.total_events_delivered += delivered as u64;
        bundles
    };

    for bundle in bundles {
        debug!(
            events = bundle.events.len(),
            exclude = ?bundle.exclude_client,
            "delivering broadcast bundle"
        );
        if let Err(e) = (shared.sink)(bundle) {
            warn!(error = %e, "broadcast sink failed; continuing");
        }
    }
}

fn buffered_total(state: &BroadcastState) -> usize {
    state.buffers.values().map(Vec::len).sum()
}
