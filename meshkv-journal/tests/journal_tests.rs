use meshkv_journal::{Journal, SubscriptionOptions};
use meshkv_types::{
    HybridTimestamp, JournalEventKind, NewJournalEvent, NodeId,
};
use serde_json::json;

fn body(node: NodeId, map: &str, key: &str, n: u64) -> NewJournalEvent {
    NewJournalEvent::new(
        JournalEventKind::Inserted,
        map,
        key,
        HybridTimestamp::new(n, 0, node),
        node,
    )
    .with_value(json!(n))
}

// ── Append & read ────────────────────────────────────────────────

#[test]
fn sequences_are_contiguous_from_one() {
    let node = NodeId::new();
    let journal = Journal::new();

    let sequences: Vec<u64> = (0..100)
        .map(|i| journal.append(body(node, "m", "k", i)).sequence)
        .collect();

    let expected: Vec<u64> = (1..=100).collect();
    assert_eq!(sequences, expected);
    assert_eq!(journal.last_sequence(), 100);
}

#[test]
fn concurrent_appends_never_gap_or_duplicate() {
    let journal = Journal::new();
    let mut handles = Vec::new();
    for _ in 0..8 {
        let journal = journal.clone();
        let node = NodeId::new();
        handles.push(std::thread::spawn(move || {
            let mut seqs = Vec::new();
            for i in 0..250 {
                seqs.push(journal.append(body(node, "m", "k", i)).sequence);
            }
            seqs
        }));
    }

    let mut all: Vec<u64> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    all.sort_unstable();
    let expected: Vec<u64> = (1..=2000).collect();
    assert_eq!(all, expected);
}

#[test]
fn resumed_journal_continues_numbering() {
    let node = NodeId::new();
    let journal = Journal::resume_from(41);
    assert_eq!(journal.last_sequence(), 41);

    let event = journal.append(body(node, "m", "k", 1));
    assert_eq!(event.sequence, 42);

    // Pre-restart history is not replayable; reads clamp to what's here.
    assert!(journal.read_from(1, 10).len() == 1);
    assert_eq!(journal.read_from(1, 10)[0].sequence, 42);
}

#[test]
fn read_from_returns_ordered_slice() {
    let node = NodeId::new();
    let journal = Journal::new();
    for i in 0..10 {
        journal.append(body(node, "m", "k", i));
    }

    let events = journal.read_from(4, 3);
    let seqs: Vec<u64> = events.iter().map(|e| e.sequence).collect();
    assert_eq!(seqs, vec![4, 5, 6]);

    assert!(journal.read_from(11, 10).is_empty());
    assert_eq!(journal.read_from(0, 2).len(), 2);
}

// ── Subscriptions ────────────────────────────────────────────────

#[tokio::test]
async fn subscribe_replays_backlog_then_goes_live() {
    let node = NodeId::new();
    let journal = Journal::new();
    for i in 1..=5 {
        journal.append(body(node, "m", "k", i));
    }

    let mut sub = journal.subscribe(SubscriptionOptions::from_sequence(2));
    for expected in 2..=5 {
        assert_eq!(sub.next().await.unwrap().sequence, expected);
    }

    // Nothing more in the backlog.
    assert!(sub.try_next().is_none());

    // A live append wakes the subscriber, in order.
    let live = {
        let journal = journal.clone();
        tokio::spawn(async move {
            journal.append(body(node, "m", "k", 6));
            journal.append(body(node, "m", "k", 7));
        })
    };
    assert_eq!(sub.next().await.unwrap().sequence, 6);
    assert_eq!(sub.next().await.unwrap().sequence, 7);
    live.await.unwrap();
}

#[tokio::test]
async fn each_subscription_sees_every_event_exactly_once() {
    let node = NodeId::new();
    let journal = Journal::new();
    let mut a = journal.subscribe(SubscriptionOptions::from_sequence(1));
    let mut b = journal.subscribe(SubscriptionOptions::from_sequence(1));

    for i in 0..20 {
        journal.append(body(node, "m", "k", i));
    }

    let mut seen_a = Vec::new();
    while let Some(event) = a.try_next() {
        seen_a.push(event.sequence);
    }
    let mut seen_b = Vec::new();
    while let Some(event) = b.try_next() {
        seen_b.push(event.sequence);
    }

    let expected: Vec<u64> = (1..=20).collect();
    assert_eq!(seen_a, expected);
    assert_eq!(seen_b, expected);
}

#[tokio::test]
async fn filters_compose() {
    let node = NodeId::new();
    let journal = Journal::new();

    journal.append(body(node, "users", "a", 1));
    journal.append(body(node, "posts", "b", 2));
    journal.append(
        NewJournalEvent::new(
            JournalEventKind::Deleted,
            "users",
            "a",
            HybridTimestamp::new(3, 0, node),
            node,
        ),
    );
    journal.append(body(node, "users", "c", 4));

    let mut sub = journal.subscribe(SubscriptionOptions {
        from_sequence: Some(1),
        map_name: Some("users".into()),
        kinds: Some(vec![JournalEventKind::Inserted]),
        max_inflight: 16,
    });

    let first = sub.next().await.unwrap();
    assert_eq!((first.sequence, first.key.as_str()), (1, "a"));
    let second = sub.next().await.unwrap();
    assert_eq!((second.sequence, second.key.as_str()), (4, "c"));
    assert!(sub.try_next().is_none());
}

#[tokio::test]
async fn next_batch_respects_max_inflight() {
    let node = NodeId::new();
    let journal = Journal::new();
    for i in 0..50 {
        journal.append(body(node, "m", "k", i));
    }

    let mut sub = journal.subscribe(SubscriptionOptions {
        from_sequence: Some(1),
        max_inflight: 10,
        ..Default::default()
    });

    let batch = sub.next_batch(100).await;
    assert_eq!(batch.len(), 10);
    assert_eq!(batch[0].sequence, 1);
    assert_eq!(batch[9].sequence, 10);

    // The cursor picks up exactly where the batch stopped.
    assert_eq!(sub.next().await.unwrap().sequence, 11);
}

#[tokio::test]
async fn dropping_subscription_is_unsubscribe() {
    let node = NodeId::new();
    let journal = Journal::new();
    let sub = journal.subscribe(SubscriptionOptions::from_sequence(1));
    drop(sub);

    // Journal keeps working with no subscribers.
    journal.append(body(node, "m", "k", 1));
    assert_eq!(journal.last_sequence(), 1);
}
