//! Multi-peer consensus scenarios over the in-process network: replicated
//! commits, super-majority gating, and cross-peer state convergence.

use serde_json::json;

use crate::common::{insert_statement, row, test_net, update_statement};
use tessera::engine::JSON_ENGINE_ID;
use tessera::transactor::{CommitRequest, GetRequest, PendPolicy, PendRequest, PendResponse, Transactor};
use tessera::transform::{TransformOp, Transforms};

fn insert_transforms(block: &tessera::Block) -> Transforms {
    let mut transforms = Transforms::default();
    transforms.inserts.insert(block.id().clone(), block.clone());
    transforms
}

/// A transaction driven from one peer lands identically on every peer in
/// the cluster
#[tokio::test]
async fn transaction_replicates_to_all_peers() {
    let net = test_net(3, 3).await;
    let (mut coordinator, _, _) = net.transaction_coordinator(0);
    coordinator.open_collection("c1");

    let block = row("c1", &[("id", json!(1)), ("name", json!("Alice"))]);
    let txn = coordinator.begin(JSON_ENGINE_ID, "schema-0", vec![insert_statement("c1", &block)]);
    coordinator.execute(txn).await.expect("distributed transaction should commit");

    for peer in &net.peers {
        let read = peer
            .repo
            .get(GetRequest { block_ids: vec![block.id().clone()], context: None })
            .await
            .unwrap();
        let entry = &read[block.id()];
        assert_eq!(entry.block.as_ref().unwrap().scalar("name"), Some(&json!("Alice")));
        assert_eq!(entry.state.latest.as_ref().map(|l| l.rev), Some(1));
        assert!(entry.state.pendings.is_empty(), "no pendings should linger after commit");
    }
}

/// Multi-collection transactions converge across peers too: every peer
/// sees both collections' rows after GATHER/PEND/COMMIT
#[tokio::test]
async fn cross_collection_transaction_replicates() {
    let net = test_net(3, 3).await;
    let (mut coordinator, _, gathers) = net.transaction_coordinator(0);
    coordinator.open_collection("users");
    coordinator.open_collection("posts");

    let alice = row("users", &[("id", json!(1)), ("balance", json!(100))]);
    let txn = coordinator.begin(JSON_ENGINE_ID, "schema-0", vec![insert_statement("users", &alice)]);
    coordinator.execute(txn).await.unwrap();

    let post = row("posts", &[("id", json!(1001)), ("amount", json!(25))]);
    let txn = coordinator.begin(
        JSON_ENGINE_ID,
        "schema-0",
        vec![
            update_statement("users", alice.id(), vec![TransformOp::assign("balance", json!(75))]),
            insert_statement("posts", &post),
        ],
    );
    coordinator.execute(txn).await.unwrap();

    assert_eq!(gathers.calls.load(std::sync::atomic::Ordering::SeqCst), 2);

    for peer in &net.peers {
        let read = peer
            .repo
            .get(GetRequest { block_ids: vec![alice.id().clone(), post.id().clone()], context: None })
            .await
            .unwrap();
        assert_eq!(read[alice.id()].block.as_ref().unwrap().scalar("balance"), Some(&json!(75)));
        assert_eq!(read[post.id()].block.as_ref().unwrap().scalar("amount"), Some(&json!(25)));
    }
}

/// Super-majority gating: with a 3-peer cluster and two validators
/// rejecting, the round aborts and never reaches commit anywhere
#[tokio::test]
async fn minority_approval_never_commits() {
    let net = test_net(3, 3).await;

    let block = row("c1", &[("id", json!(1))]);
    let id = block.id().clone();

    // peers 1 and 2 already hold a committed rev 1 for this block; peer 0
    // does not
    for peer in &net.peers[1..] {
        assert!(peer
            .repo
            .pend(PendRequest {
                action_id: "seed".into(),
                transforms: insert_transforms(&block),
                policy: PendPolicy::Fail,
                rev: Some(1),
                operations_hash: None,
                transaction: None,
                supercluster_nominees: None,
            })
            .await
            .unwrap()
            .is_success());
        assert!(peer
            .repo
            .commit(CommitRequest {
                action_id: "seed".into(),
                block_ids: vec![id.clone()],
                tail_id: id.clone(),
                rev: 1,
            })
            .await
            .unwrap()
            .is_success());
    }

    // a cluster pend at rev 1: peers 1 and 2 reject (committed conflict),
    // only peer 0 approves, below the super-majority of 2
    let coordinated = net.coordinated(0);
    let response = coordinated
        .pend(PendRequest {
            action_id: "a2".into(),
            transforms: insert_transforms(&block),
            policy: PendPolicy::Return,
            rev: Some(1),
            operations_hash: None,
            transaction: None,
            supercluster_nominees: None,
        })
        .await
        .unwrap();
    assert!(!response.is_success(), "minority approval must not pend: {response:?}");

    // nothing was committed anywhere new; peer 0 still has no committed
    // state for the block
    let peer0_latest = net.peers[0].repo.store().get_latest(&id).unwrap();
    assert!(peer0_latest.is_none());
}

/// Reads through the coordinated repository see cluster state even from a
/// peer that is not in the block's cluster
#[tokio::test]
async fn coordinated_reads_reach_the_responsible_cluster() {
    // five peers, clusters of three: some peers are outside some clusters
    let net = test_net(5, 3).await;
    let (mut coordinator, _, _) = net.transaction_coordinator(0);
    coordinator.open_collection("c1");

    let block = row("c1", &[("id", json!(1)), ("name", json!("Alice"))]);
    let txn = coordinator.begin(JSON_ENGINE_ID, "schema-0", vec![insert_statement("c1", &block)]);
    coordinator.execute(txn).await.expect("transaction should commit");

    // read from every peer's coordinated view: routing finds the cluster
    for index in 0..net.peers.len() {
        let coordinated = net.coordinated(index);
        let read = coordinated
            .get(GetRequest { block_ids: vec![block.id().clone()], context: None })
            .await
            .unwrap();
        assert_eq!(
            read[block.id()].block.as_ref().map(|b| b.scalar("name")).flatten(),
            Some(&json!("Alice")),
            "peer {index} should read the committed row through routing"
        );
    }
}
