//! Persistence and recovery: state written through the transactor must
//! survive a full store close/reopen cycle, and pendings left behind by
//! an interrupted coordinator must be recoverable, cancellable, and
//! committable after restart.

use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

use crate::common::{init_test_tracing, row};
use tessera::storage::{BlockStore, StorageRepo};
use tessera::transactor::{
    CommitRequest, GetRequest, PendPolicy, PendRequest, Transactor,
};
use tessera::transform::Transforms;
use tessera::types::RevRef;

fn insert_request(block: &tessera::Block, action_id: &str, rev: u64) -> PendRequest {
    let mut transforms = Transforms::default();
    transforms.inserts.insert(block.id().clone(), block.clone());
    PendRequest {
        action_id: action_id.into(),
        transforms,
        policy: PendPolicy::Fail,
        rev: Some(rev),
        operations_hash: None,
        transaction: None,
        supercluster_nominees: None,
    }
}

async fn open_repo(dir: &TempDir) -> StorageRepo {
    let store = Arc::new(BlockStore::open(dir.path()).expect("block store"));
    StorageRepo::new(store)
}

/// Committed state survives a close and reopen: latest pointer, revision
/// index, committed action, and the materialized block all come back
#[tokio::test]
async fn committed_state_survives_restart() {
    init_test_tracing();
    let dir = TempDir::new().unwrap();
    let block = row("c1", &[("id", json!(1)), ("name", json!("Alice"))]);
    let id = block.id().clone();

    // first lifetime: commit and flush
    {
        let repo = open_repo(&dir).await;
        assert!(repo.pend(insert_request(&block, "a1", 1)).await.unwrap().is_success());
        assert!(repo
            .commit(CommitRequest {
                action_id: "a1".into(),
                block_ids: vec![id.clone()],
                tail_id: id.clone(),
                rev: 1,
            })
            .await
            .unwrap()
            .is_success());
        repo.store().close().await.unwrap();
    }

    // second lifetime: everything is still there
    let repo = open_repo(&dir).await;
    assert_eq!(repo.store().get_latest(&id).unwrap(), Some(RevRef::new("a1", 1)));
    assert!(repo.store().get_transaction(&id, &"a1".to_string()).unwrap().is_some());

    let read = repo.get(GetRequest { block_ids: vec![id.clone()], context: None }).await.unwrap();
    let entry = &read[&id];
    assert_eq!(entry.block.as_ref().unwrap().scalar("name"), Some(&json!("Alice")));
    assert!(entry.state.pendings.is_empty());
}

/// A pending action left by an interrupted coordinator is reported on
/// restart and can still be cancelled
#[tokio::test]
async fn orphaned_pending_is_recovered_and_cancellable() {
    init_test_tracing();
    let dir = TempDir::new().unwrap();
    let block = row("c1", &[("id", json!(1))]);
    let id = block.id().clone();

    {
        let repo = open_repo(&dir).await;
        assert!(repo.pend(insert_request(&block, "a1", 1)).await.unwrap().is_success());
        // no commit: the coordinator "crashed" here
        repo.store().close().await.unwrap();
    }

    let repo = open_repo(&dir).await;
    let recovered = repo.recover_pendings().unwrap();
    assert_eq!(recovered, vec![(id.clone(), "a1".to_string())]);

    repo.cancel(tessera::transactor::CancelRequest { action_id: "a1".into(), block_ids: vec![id.clone()] })
        .await
        .unwrap();
    assert!(repo.recover_pendings().unwrap().is_empty());
}

/// A recovered pending can equally be driven to commit after restart
#[tokio::test]
async fn orphaned_pending_can_still_commit() {
    init_test_tracing();
    let dir = TempDir::new().unwrap();
    let block = row("c1", &[("id", json!(1)), ("name", json!("Alice"))]);
    let id = block.id().clone();

    {
        let repo = open_repo(&dir).await;
        assert!(repo.pend(insert_request(&block, "a1", 1)).await.unwrap().is_success());
        repo.store().close().await.unwrap();
    }

    let repo = open_repo(&dir).await;
    assert_eq!(repo.recover_pendings().unwrap().len(), 1);

    assert!(repo
        .commit(CommitRequest {
            action_id: "a1".into(),
            block_ids: vec![id.clone()],
            tail_id: id.clone(),
            rev: 1,
        })
        .await
        .unwrap()
        .is_success());

    let read = repo.get(GetRequest { block_ids: vec![id.clone()], context: None }).await.unwrap();
    assert_eq!(read[&id].block.as_ref().unwrap().scalar("name"), Some(&json!("Alice")));
}

/// Historical revisions are still materializable after restart: the
/// backward walk and forward replay run against reopened trees
#[tokio::test]
async fn historical_reads_survive_restart() {
    init_test_tracing();
    let dir = TempDir::new().unwrap();
    let block = row("c1", &[("id", json!(1)), ("name", json!("Alice"))]);
    let id = block.id().clone();

    {
        let repo = open_repo(&dir).await;
        assert!(repo.pend(insert_request(&block, "a1", 1)).await.unwrap().is_success());
        repo.commit(CommitRequest {
            action_id: "a1".into(),
            block_ids: vec![id.clone()],
            tail_id: id.clone(),
            rev: 1,
        })
        .await
        .unwrap();

        // second revision: rename
        let mut transforms = Transforms::default();
        transforms.updates.insert(
            id.clone(),
            vec![tessera::transform::TransformOp::assign("name", json!("Bob"))],
        );
        repo.pend(PendRequest {
            action_id: "a2".into(),
            transforms,
            policy: PendPolicy::Fail,
            rev: Some(2),
            operations_hash: None,
            transaction: None,
            supercluster_nominees: None,
        })
        .await
        .unwrap();
        repo.commit(CommitRequest {
            action_id: "a2".into(),
            block_ids: vec![id.clone()],
            tail_id: id.clone(),
            rev: 2,
        })
        .await
        .unwrap();
        repo.store().close().await.unwrap();
    }

    let repo = open_repo(&dir).await;
    let latest = repo.store().get_block(&id, None).await.unwrap().unwrap();
    assert_eq!(latest.scalar("name"), Some(&json!("Bob")));

    let historical = repo.store().get_block(&id, Some(1)).await.unwrap().unwrap();
    assert_eq!(historical.scalar("name"), Some(&json!("Alice")));

    let revisions = repo.store().list_revisions(&id, 1, 2).unwrap();
    assert_eq!(revisions, vec![RevRef::new("a1", 1), RevRef::new("a2", 2)]);
}
