//! End-to-end transaction scenarios over the full pipeline:
//! engine → collections → log → GATHER/PEND/COMMIT through cluster
//! consensus on the in-process network.

use serde_json::json;
use std::sync::atomic::Ordering;

use crate::common::{insert_statement, row, test_net, update_statement};
use tessera::engine::JSON_ENGINE_ID;
use tessera::transactor::{GetRequest, Transactor};
use tessera::transform::TransformOp;

/// Single-collection insert: pend and commit succeed, the row is
/// readable, and the collection's log reports one committed action at
/// rev 1
#[tokio::test]
async fn single_collection_insert() {
    let net = test_net(1, 1).await;
    let (mut coordinator, counting, gathers) = net.transaction_coordinator(0);
    coordinator.open_collection("c1");

    let block = row("c1", &[("id", json!(1)), ("name", json!("Alice"))]);
    let txn = coordinator.begin(JSON_ENGINE_ID, "schema-0", vec![insert_statement("c1", &block)]);
    let result = coordinator.execute(txn).await.expect("transaction should commit");

    assert_eq!(result.outcomes.len(), 1);
    assert_eq!(result.outcomes[0].rev, 1);
    assert_eq!(counting.pends.load(Ordering::SeqCst), 1);
    assert_eq!(counting.commits.load(Ordering::SeqCst), 1);
    // single-collection transactions skip GATHER
    assert_eq!(gathers.calls.load(Ordering::SeqCst), 0);

    // the committed row is visible straight from the peer's repository
    let read = net.peers[0]
        .repo
        .get(GetRequest { block_ids: vec![block.id().clone()], context: None })
        .await
        .unwrap();
    let seen = read[block.id()].block.as_ref().expect("row should exist");
    assert_eq!(seen.scalar("name"), Some(&json!("Alice")));

    let collection = coordinator.collection_mut(&"c1".to_string()).unwrap();
    let context = collection.get_action_context().await.unwrap();
    assert_eq!(context.committed.len(), 1);
    assert_eq!(context.rev, 1);
}

/// Cross-collection atomic update: both collections reflect the change;
/// GATHER ran once per critical block, PEND and COMMIT once per
/// collection
#[tokio::test]
async fn cross_collection_atomic_update() {
    let net = test_net(1, 1).await;
    let (mut coordinator, counting, gathers) = net.transaction_coordinator(0);
    coordinator.open_collection("users");
    coordinator.open_collection("posts");

    // setup: users:1 with balance 100
    let alice = row("users", &[("id", json!(1)), ("name", json!("Alice")), ("balance", json!(100))]);
    let txn = coordinator.begin(JSON_ENGINE_ID, "schema-0", vec![insert_statement("users", &alice)]);
    coordinator.execute(txn).await.expect("setup should commit");

    let gathers_before = gathers.calls.load(Ordering::SeqCst);
    let pends_before = counting.pends.load(Ordering::SeqCst);
    let commits_before = counting.commits.load(Ordering::SeqCst);

    // transfer: balance 100 → 75, and a post recording the spend
    let post = row("posts", &[("id", json!(1001)), ("userId", json!(1)), ("amount", json!(25))]);
    let txn = coordinator.begin(
        JSON_ENGINE_ID,
        "schema-0",
        vec![
            update_statement("users", alice.id(), vec![TransformOp::assign("balance", json!(75))]),
            insert_statement("posts", &post),
        ],
    );
    let result = coordinator.execute(txn).await.expect("transfer should commit");
    assert_eq!(result.outcomes.len(), 2);

    // GATHER once per critical block, one pend and one commit per collection
    assert_eq!(gathers.calls.load(Ordering::SeqCst) - gathers_before, 2);
    assert_eq!(counting.pends.load(Ordering::SeqCst) - pends_before, 2);
    assert_eq!(counting.commits.load(Ordering::SeqCst) - commits_before, 2);

    // both collections reflect the change
    let read = net.peers[0]
        .repo
        .get(GetRequest { block_ids: vec![alice.id().clone(), post.id().clone()], context: None })
        .await
        .unwrap();
    assert_eq!(read[alice.id()].block.as_ref().unwrap().scalar("balance"), Some(&json!(75)));
    assert_eq!(read[post.id()].block.as_ref().unwrap().scalar("amount"), Some(&json!(25)));
}

/// Sequential transactions keep per-collection log revisions dense and
/// strictly increasing
#[tokio::test]
async fn sequential_transactions_advance_the_log() {
    let net = test_net(1, 1).await;
    let (mut coordinator, _, _) = net.transaction_coordinator(0);
    coordinator.open_collection("c1");

    for i in 0..4 {
        let block = row("c1", &[("id", json!(i))]);
        let txn = coordinator.begin(JSON_ENGINE_ID, "schema-0", vec![insert_statement("c1", &block)]);
        let result = coordinator.execute(txn).await.expect("insert should commit");
        assert_eq!(result.outcomes[0].rev, (i + 1) as u64);
    }

    let collection = coordinator.collection_mut(&"c1".to_string()).unwrap();
    let entries = collection.log_entries().await.unwrap();
    let revs: Vec<u64> = entries.iter().map(|e| e.rev()).collect();
    assert_eq!(revs, vec![1, 2, 3, 4]);

    let context = collection.get_action_context().await.unwrap();
    assert_eq!(context.committed.len(), 4);
    assert_eq!(context.rev, 4);
}

/// Checkpoint narrows the committed set to what it names, and later
/// actions union back in
#[tokio::test]
async fn checkpoint_narrows_committed_set() {
    let net = test_net(1, 1).await;
    let (mut coordinator, _, _) = net.transaction_coordinator(0);
    coordinator.open_collection("c1");

    let mut first_action = None;
    for i in 0..3 {
        let block = row("c1", &[("id", json!(i))]);
        let txn = coordinator.begin(JSON_ENGINE_ID, "schema-0", vec![insert_statement("c1", &block)]);
        let result = coordinator.execute(txn).await.unwrap();
        if i == 0 {
            first_action = Some(result.transaction_id);
        }
    }
    let first_action = first_action.unwrap();

    let collection = coordinator.collection_mut(&"c1".to_string()).unwrap();
    collection
        .add_checkpoint(vec![tessera::types::RevRef::new(first_action.clone(), 1)], 4)
        .await
        .unwrap();

    let context = collection.get_action_context().await.unwrap();
    assert_eq!(context.rev, 4);
    assert_eq!(context.committed, vec![tessera::types::RevRef::new(first_action, 1)]);
}

/// A commit with no executed statements succeeds without touching the
/// network at all
#[tokio::test]
async fn empty_commit_is_local() {
    let net = test_net(1, 1).await;
    let (mut coordinator, counting, gathers) = net.transaction_coordinator(0);
    coordinator.open_collection("c1");

    let txn = coordinator.begin(JSON_ENGINE_ID, "schema-0", vec![]);
    let result = coordinator.execute(txn).await.unwrap();
    assert!(result.outcomes.is_empty());
    assert_eq!(counting.pends.load(Ordering::SeqCst), 0);
    assert_eq!(counting.commits.load(Ordering::SeqCst), 0);
    assert_eq!(counting.cancels.load(Ordering::SeqCst), 0);
    assert_eq!(gathers.calls.load(Ordering::SeqCst), 0);
}

/// Delete flows through the same pipeline and leaves the block absent
#[tokio::test]
async fn delete_round_trip() {
    let net = test_net(1, 1).await;
    let (mut coordinator, _, _) = net.transaction_coordinator(0);
    coordinator.open_collection("c1");

    let block = row("c1", &[("id", json!(1))]);
    let txn = coordinator.begin(JSON_ENGINE_ID, "schema-0", vec![insert_statement("c1", &block)]);
    coordinator.execute(txn).await.unwrap();

    let txn = coordinator.begin(
        JSON_ENGINE_ID,
        "schema-0",
        vec![crate::common::delete_statement("c1", block.id())],
    );
    coordinator.execute(txn).await.unwrap();

    let read = net.peers[0]
        .repo
        .get(GetRequest { block_ids: vec![block.id().clone()], context: None })
        .await
        .unwrap();
    assert!(read[block.id()].block.is_none());
}
