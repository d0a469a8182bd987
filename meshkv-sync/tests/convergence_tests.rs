//! Two-node end-to-end tests: anti-entropy convergence, conflict
//! journaling, and live replication, driven through the session state
//! machines.

use meshkv_storage::MemoryStorage;
use meshkv_sync::transport::{mock, PeerChannel};
use meshkv_sync::{
    Message, NodeStore, NodeStoreConfig, SessionConfig, SessionState, SyncSession,
};
use meshkv_types::{HybridTimestamp, JournalEventKind, NodeId, PartitionId};
use serde_json::json;
use std::sync::Arc;

fn make_store() -> Arc<NodeStore> {
    // RUST_LOG=meshkv_sync=debug surfaces the session transitions.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    Arc::new(NodeStore::new(
        NodeId::new(),
        NodeStoreConfig::default(),
        Arc::new(MemoryStorage::new()),
    ))
}

/// Routes messages between two sessions until both sides fall silent.
async fn run_to_quiescence(initiator: &mut SyncSession, responder: &mut SyncSession) {
    let mut to_responder = vec![initiator.connect().await];
    let mut to_initiator: Vec<Message> = Vec::new();

    for _ in 0..64 {
        if to_responder.is_empty() && to_initiator.is_empty() {
            return;
        }
        let mut next_to_initiator = Vec::new();
        for msg in to_responder.drain(..) {
            next_to_initiator.extend(responder.handle_message(msg).await.unwrap());
        }
        let mut next_to_responder = Vec::new();
        for msg in to_initiator.drain(..) {
            next_to_responder.extend(initiator.handle_message(msg).await.unwrap());
        }
        to_initiator = next_to_initiator;
        to_responder = next_to_responder;
    }
    panic!("sessions did not quiesce");
}

/// Pumps live journal subscriptions both ways until silent.
async fn pump_live(initiator: &mut SyncSession, responder: &mut SyncSession) {
    for _ in 0..64 {
        let from_initiator = initiator.pump_subscription(32);
        let from_responder = responder.pump_subscription(32);
        if from_initiator.is_empty() && from_responder.is_empty() {
            return;
        }
        for msg in from_initiator {
            let _ = responder.handle_message(msg).await.unwrap();
        }
        for msg in from_responder {
            let _ = initiator.handle_message(msg).await.unwrap();
        }
    }
    panic!("live pump did not quiesce");
}

async fn assert_converged(a: &NodeStore, b: &NodeStore) {
    let mut partitions = a.touched_partitions().await;
    partitions.extend(b.touched_partitions().await);
    partitions.sort_unstable();
    partitions.dedup();
    for partition in partitions {
        assert_eq!(
            a.root_hash(partition).await,
            b.root_hash(partition).await,
            "partition {partition} diverged"
        );
    }
}

// ── Anti-entropy ─────────────────────────────────────────────────

#[tokio::test]
async fn full_sync_converges_two_nodes() {
    let a = make_store();
    let b = make_store();
    let token_a = a.mint_token();
    let token_b = b.mint_token();

    for i in 0..20 {
        a.set(&token_a, "users", &format!("a{i}"), json!(i), None)
            .await
            .unwrap();
    }
    for i in 0..20 {
        b.set(&token_b, "users", &format!("b{i}"), json!(i), None)
            .await
            .unwrap();
    }

    let mut initiator = SyncSession::new(a.clone(), SessionConfig::default());
    let mut responder = SyncSession::new(b.clone(), SessionConfig::default());
    run_to_quiescence(&mut initiator, &mut responder).await;

    assert_eq!(initiator.state(), SessionState::Live);
    assert_eq!(responder.state(), SessionState::Live);
    assert_converged(&a, &b).await;
    assert_eq!(a.get_value("users", "b7").await, Some(json!(7)));
    assert_eq!(b.get_value("users", "a7").await, Some(json!(7)));
}

#[tokio::test]
async fn deletes_replicate_as_tombstones() {
    let a = make_store();
    let b = make_store();
    let token_a = a.mint_token();

    a.set(&token_a, "users", "gone", json!(1), None).await.unwrap();
    a.set(&token_a, "users", "kept", json!(2), None).await.unwrap();
    a.delete(&token_a, "users", "gone").await.unwrap();

    let mut initiator = SyncSession::new(a.clone(), SessionConfig::default());
    let mut responder = SyncSession::new(b.clone(), SessionConfig::default());
    run_to_quiescence(&mut initiator, &mut responder).await;

    assert_converged(&a, &b).await;
    assert_eq!(b.get_value("users", "kept").await, Some(json!(2)));
    assert_eq!(b.get_value("users", "gone").await, None);
    assert!(b.get("users", "gone").await.unwrap().is_tombstone());
}

/// Scenario: both nodes write the same key at the same instant. After
/// sync both converge on the record whose node id sorts greater, and
/// the losing side has a MERGE_REJECTED event in its journal.
#[tokio::test]
async fn concurrent_write_conflict_is_journaled() {
    let a = make_store();
    let b = make_store();
    let token_a = a.mint_token();
    let token_b = b.mint_token();

    let shared_millis = 1_700_000_000_000;
    a.set(
        &token_a,
        "users",
        "a",
        json!("v1"),
        Some(HybridTimestamp::new(shared_millis, 0, a.node_id())),
    )
    .await
    .unwrap();
    b.set(
        &token_b,
        "users",
        "a",
        json!("v2"),
        Some(HybridTimestamp::new(shared_millis, 0, b.node_id())),
    )
    .await
    .unwrap();

    let mut initiator = SyncSession::new(a.clone(), SessionConfig::default());
    let mut responder = SyncSession::new(b.clone(), SessionConfig::default());
    run_to_quiescence(&mut initiator, &mut responder).await;

    assert_converged(&a, &b).await;
    let expected = if a.node_id() > b.node_id() {
        json!("v1")
    } else {
        json!("v2")
    };
    assert_eq!(a.get_value("users", "a").await, Some(expected.clone()));
    assert_eq!(b.get_value("users", "a").await, Some(expected));

    // Exactly one side journaled the rejection.
    let rejected = |store: &NodeStore| {
        store
            .journal()
            .read_from(1, 100)
            .iter()
            .filter(|e| e.kind == JournalEventKind::MergeRejected)
            .count()
    };
    assert_eq!(rejected(&a) + rejected(&b), 1);
}

#[tokio::test]
async fn resync_is_idempotent() {
    let a = make_store();
    let b = make_store();
    let token_a = a.mint_token();
    a.set(&token_a, "users", "k", json!(1), None).await.unwrap();

    let mut initiator = SyncSession::new(a.clone(), SessionConfig::default());
    let mut responder = SyncSession::new(b.clone(), SessionConfig::default());
    run_to_quiescence(&mut initiator, &mut responder).await;
    assert_converged(&a, &b).await;

    let journal_len_before = b.journal().last_sequence();

    // A second full session finds nothing to transfer.
    let mut initiator = SyncSession::new(a.clone(), SessionConfig::default());
    let mut responder = SyncSession::new(b.clone(), SessionConfig::default());
    run_to_quiescence(&mut initiator, &mut responder).await;

    assert_eq!(b.journal().last_sequence(), journal_len_before);
}

// ── Live replication ─────────────────────────────────────────────

#[tokio::test]
async fn live_writes_flow_through_subscriptions() {
    let a = make_store();
    let b = make_store();
    let token_a = a.mint_token();
    let token_b = b.mint_token();

    let mut initiator = SyncSession::new(a.clone(), SessionConfig::default());
    let mut responder = SyncSession::new(b.clone(), SessionConfig::default());
    run_to_quiescence(&mut initiator, &mut responder).await;
    assert_eq!(initiator.state(), SessionState::Live);

    // Writes after going live propagate via journal push.
    a.set(&token_a, "users", "live-a", json!("A"), None).await.unwrap();
    b.set(&token_b, "users", "live-b", json!("B"), None).await.unwrap();
    pump_live(&mut initiator, &mut responder).await;

    assert_eq!(b.get_value("users", "live-a").await, Some(json!("A")));
    assert_eq!(a.get_value("users", "live-b").await, Some(json!("B")));
    assert_converged(&a, &b).await;

    // Deletes too.
    a.delete(&token_a, "users", "live-a").await.unwrap();
    pump_live(&mut initiator, &mut responder).await;
    assert_eq!(b.get_value("users", "live-a").await, None);

    // Clean teardown: once the responder unsubscribes, writes on this
    // side stop flowing out.
    let unsub = responder.unsubscribe_message().expect("subscription open");
    initiator.handle_message(unsub).await.unwrap();
    a.set(&token_a, "users", "after-unsub", json!(1), None).await.unwrap();
    assert!(initiator.pump_subscription(32).is_empty());
}

// ── Transport plumbing ───────────────────────────────────────────

#[tokio::test]
async fn messages_survive_the_mock_channel() {
    let (left, right) = mock::channel_pair();

    let a = make_store();
    let mut session = SyncSession::new(a.clone(), SessionConfig::default());
    left.send(session.connect().await).await.unwrap();

    match right.recv().await.unwrap() {
        Message::Handshake(body) => assert_eq!(body.node_id, a.node_id()),
        other => panic!("expected Handshake, got {other:?}"),
    }

    right
        .send(Message::EpochBump {
            epoch: 3,
            reason: "test".into(),
        })
        .await
        .unwrap();
    match left.recv().await.unwrap() {
        Message::EpochBump { epoch, .. } => assert_eq!(epoch, 3),
        other => panic!("expected EpochBump, got {other:?}"),
    }

    left.close().await;
}

// ── Partition isolation ──────────────────────────────────────────

#[tokio::test]
async fn page_ranges_cover_only_their_partition() {
    let store = make_store();
    let token = store.mint_token();
    for i in 0..50 {
        store
            .set(&token, "users", &format!("k{i}"), json!(i), None)
            .await
            .unwrap();
    }

    let partitions = store.touched_partitions().await;
    assert!(partitions.len() > 1, "expected keys to spread");

    for partition in &partitions {
        let ranges = store.page_ranges(*partition).await;
        assert!(!ranges.is_empty());
    }
    // Untouched partitions are empty.
    let untouched = (0..16)
        .map(PartitionId::new)
        .find(|p| !partitions.contains(p));
    if let Some(p) = untouched {
        assert!(store.page_ranges(p).await.is_empty());
        assert_eq!(store.root_hash(p).await, meshkv_mst::RootHash::EMPTY);
    }
}
