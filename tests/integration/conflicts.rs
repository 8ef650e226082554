//! Conflict-handling scenarios: stale revisions, pending-conflict
//! policies, and compensation after commit failure.

use serde_json::json;
use std::sync::atomic::Ordering;

use crate::common::{insert_statement, row, test_net};
use tessera::engine::JSON_ENGINE_ID;
use tessera::transactor::{
    CommitRequest, PendPolicy, PendRequest, PendResponse, Transactor,
};
use tessera::transform::{TransformOp, Transforms};

fn insert_transforms(block: &tessera::Block) -> Transforms {
    let mut transforms = Transforms::default();
    transforms.inserts.insert(block.id().clone(), block.clone());
    transforms
}

fn update_transforms(block_id: &tessera::BlockId, op: TransformOp) -> Transforms {
    let mut transforms = Transforms::default();
    transforms.updates.insert(block_id.clone(), vec![op]);
    transforms
}

fn pend_request(action_id: &str, transforms: Transforms, policy: PendPolicy, rev: Option<u64>) -> PendRequest {
    PendRequest {
        action_id: action_id.into(),
        transforms,
        policy,
        rev,
        operations_hash: None,
        transaction: None,
        supercluster_nominees: None,
    }
}

/// Stale revision on pend: a block committed at rev 2 refuses a pend at
/// rev 1 and hands back the missing committed action with its transforms
#[tokio::test]
async fn stale_revision_pend_returns_missing() {
    let net = test_net(1, 1).await;
    let repo = &net.peers[0].repo;

    let block = row("c1", &[("id", json!(1))]);
    let id = block.id().clone();

    // block lands directly at rev 2
    assert!(repo
        .pend(pend_request("a1", insert_transforms(&block), PendPolicy::Fail, Some(2)))
        .await
        .unwrap()
        .is_success());
    assert!(repo
        .commit(CommitRequest { action_id: "a1".into(), block_ids: vec![id.clone()], tail_id: id.clone(), rev: 2 })
        .await
        .unwrap()
        .is_success());

    let stale = repo
        .pend(pend_request(
            "a2",
            update_transforms(&id, TransformOp::assign("id", json!(9))),
            PendPolicy::Fail,
            Some(1),
        ))
        .await
        .unwrap();
    match stale {
        PendResponse::MissingConflict { missing } => {
            assert_eq!(missing.len(), 1);
            assert_eq!(missing[0].action_id, "a1");
            assert_eq!(missing[0].rev, 2);
            assert!(missing[0].transforms.contains_key(&id));
        }
        other => panic!("expected missing conflict, got {other:?}"),
    }
}

/// The three pending-conflict policies against the same pre-state: `f`
/// fails with bare refs, `r` fails with the pending transform attached,
/// `w` proceeds
#[tokio::test]
async fn pending_conflict_policy_matrix() {
    let net = test_net(1, 1).await;
    let repo = &net.peers[0].repo;

    let block = row("c1", &[("id", json!(1))]);
    let id = block.id().clone();
    assert!(repo
        .pend(pend_request("a1", insert_transforms(&block), PendPolicy::Fail, None))
        .await
        .unwrap()
        .is_success());

    let update = update_transforms(&id, TransformOp::assign("id", json!(2)));

    let failed = repo
        .pend(pend_request("a2", update.clone(), PendPolicy::Fail, None))
        .await
        .unwrap();
    match &failed {
        PendResponse::PendingConflict { pending } => {
            assert_eq!(pending.len(), 1);
            assert_eq!(pending[0].block_id, id);
            assert_eq!(pending[0].action_id, "a1");
            assert!(pending[0].transform.is_none());
        }
        other => panic!("policy f should fail bare, got {other:?}"),
    }

    let informed = repo
        .pend(pend_request("a2", update.clone(), PendPolicy::Return, None))
        .await
        .unwrap();
    match &informed {
        PendResponse::PendingConflict { pending } => {
            let transform = pending[0].transform.as_ref().expect("policy r enriches");
            assert!(transform.insert.is_some());
        }
        other => panic!("policy r should fail enriched, got {other:?}"),
    }

    let proceeded = repo
        .pend(pend_request("a2", update, PendPolicy::Continue, None))
        .await
        .unwrap();
    match &proceeded {
        PendResponse::Pended { pending, .. } => {
            assert_eq!(pending.len(), 1);
            assert_eq!(pending[0].action_id, "a1");
        }
        other => panic!("policy w should proceed, got {other:?}"),
    }
}

/// Commit failure rolls back pending state: after a failed commit is
/// compensated, retrying the same logical change under a fresh action id
/// succeeds
#[tokio::test]
async fn commit_failure_compensation_allows_retry() {
    let net = test_net(1, 1).await;
    let (mut coordinator, counting, _) = net.transaction_coordinator(0);
    coordinator.open_collection("c1");

    let block = row("c1", &[("id", json!(1))]);

    // every commit fails; the coordinator must cancel its pendings
    counting.fail_commits.store(true, Ordering::SeqCst);
    let txn = coordinator.begin(JSON_ENGINE_ID, "schema-0", vec![insert_statement("c1", &block)]);
    let first_id = txn.id.clone();
    coordinator.execute(txn).await.expect_err("injected commit failure");
    assert!(counting.cancels.load(Ordering::SeqCst) >= 1);

    // retry with a fresh transaction (hence a fresh action id): the
    // cancelled pendings no longer conflict
    counting.fail_commits.store(false, Ordering::SeqCst);
    let txn = coordinator.begin(JSON_ENGINE_ID, "schema-0", vec![insert_statement("c1", &block)]);
    assert_ne!(txn.id, first_id);
    let result = coordinator.execute(txn).await.expect("retry should commit");
    assert_eq!(result.outcomes[0].rev, 1);
}

/// Cancel is idempotent end to end: cancelling twice leaves the same
/// state, and committed actions are never touched
#[tokio::test]
async fn cancel_idempotence() {
    let net = test_net(1, 1).await;
    let repo = &net.peers[0].repo;

    let block = row("c1", &[("id", json!(1))]);
    let id = block.id().clone();
    repo.pend(pend_request("a1", insert_transforms(&block), PendPolicy::Fail, None))
        .await
        .unwrap();

    let cancel = tessera::transactor::CancelRequest { action_id: "a1".into(), block_ids: vec![id.clone()] };
    repo.cancel(cancel.clone()).await.unwrap();
    let after_first = repo.store().list_pending_transactions(&id).unwrap();
    repo.cancel(cancel).await.unwrap();
    let after_second = repo.store().list_pending_transactions(&id).unwrap();
    assert_eq!(after_first, after_second);
    assert!(after_second.is_empty());
}
