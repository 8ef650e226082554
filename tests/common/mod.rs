//! # Tessera Integration Test Harness
//!
//! Builds complete in-process peers (block store, storage repository,
//! cluster member, consensus coordinator, coordinated repository) wired
//! over the reference `InProcessNetwork`, so integration tests exercise
//! the same pipeline a real node runs, minus the external transport.
//!
//! Each peer gets its own temp data directory; tests run in parallel
//! without interference.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;
use tempfile::TempDir;

use tessera::block::{scalar_attrs, Block};
use tessera::cluster::{
    ClusterCoordinator, ClusterMember, ConsensusConfig, CoordinatedRepo, InProcessNetwork, RetryPolicy,
};
use tessera::collection::{CollectionAction, CollectionActions};
use tessera::engine::EngineRegistry;
use tessera::logging::{create_base_env_filter, create_subscriber_builder};
use tessera::storage::{BlockStore, StorageRepo};
use tessera::transaction::{SuperclusterNominator, TransactionCoordinator};
use tessera::transactor::{
    CancelRequest, CancelResponse, CommitRequest, CommitResponse, GetRequest, GetResponse, PendRequest,
    PendResponse, Transactor, TransactorError,
};
use tessera::transform::TransformOp;
use tessera::types::{BlockId, PeerId};

static INIT: Once = Once::new();

/// Initialize test tracing once for the whole binary
pub fn init_test_tracing() {
    INIT.call_once(|| {
        let env_filter = create_base_env_filter("warn");
        create_subscriber_builder(env_filter).init();
    });
}

pub struct TestPeer {
    pub peer_id: PeerId,
    pub repo: Arc<StorageRepo>,
    pub member: Arc<ClusterMember>,
    _dir: TempDir,
}

pub struct TestNet {
    pub network: Arc<InProcessNetwork>,
    pub peers: Vec<TestPeer>,
}

/// Build `peer_count` full peers sharing one in-process network
pub async fn test_net(peer_count: usize, cluster_size: usize) -> TestNet {
    init_test_tracing();
    let network = Arc::new(InProcessNetwork::new(cluster_size));
    let mut peers = Vec::new();
    for index in 0..peer_count {
        let dir = TempDir::new().expect("temp dir");
        let store = Arc::new(BlockStore::open(dir.path()).expect("block store"));
        let repo = Arc::new(StorageRepo::new(store));
        let peer_id = format!("peer-{index}");
        let member = Arc::new(ClusterMember::new(peer_id.clone(), repo.clone()));
        network.register(member.clone()).await;
        peers.push(TestPeer { peer_id, repo, member, _dir: dir });
    }
    TestNet { network, peers }
}

impl TestNet {
    /// A coordinated repository viewed from the given peer
    pub fn coordinated(&self, index: usize) -> Arc<CoordinatedRepo> {
        let peer = &self.peers[index];
        let consensus = ConsensusConfig::default();
        let retry = RetryPolicy {
            initial_interval: Duration::from_millis(10),
            backoff_factor: 2.0,
            max_interval: Duration::from_millis(100),
            max_attempts: 5,
        };
        let coordinator = Arc::new(
            ClusterCoordinator::new(peer.peer_id.clone(), self.network.clone(), consensus, retry)
                .with_local_member(peer.member.clone()),
        );
        Arc::new(
            CoordinatedRepo::new(peer.peer_id.clone(), self.network.clone(), self.network.clone(), coordinator)
                .with_local(peer.repo.clone()),
        )
    }

    /// A transaction coordinator on the given peer, with call counting
    pub fn transaction_coordinator(
        &self,
        index: usize,
    ) -> (TransactionCoordinator, Arc<CountingTransactor>, Arc<CountingNominator>) {
        let coordinated = self.coordinated(index);
        let counting = Arc::new(CountingTransactor::new(coordinated.clone()));
        let nominator = Arc::new(CountingNominator::new(coordinated));
        let coordinator = TransactionCoordinator::new(
            self.peers[index].peer_id.clone(),
            counting.clone() as Arc<dyn Transactor>,
            EngineRegistry::with_builtin(),
        )
        .with_nominator(nominator.clone());
        (coordinator, counting, nominator)
    }
}

/// Transactor decorator that counts calls and can be told to fail commits
pub struct CountingTransactor {
    inner: Arc<dyn Transactor>,
    pub gets: AtomicUsize,
    pub pends: AtomicUsize,
    pub commits: AtomicUsize,
    pub cancels: AtomicUsize,
    pub fail_commits: AtomicBool,
}

impl CountingTransactor {
    pub fn new(inner: Arc<dyn Transactor>) -> Self {
        Self {
            inner,
            gets: AtomicUsize::new(0),
            pends: AtomicUsize::new(0),
            commits: AtomicUsize::new(0),
            cancels: AtomicUsize::new(0),
            fail_commits: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Transactor for CountingTransactor {
    async fn get(&self, request: GetRequest) -> Result<GetResponse, TransactorError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.inner.get(request).await
    }

    async fn pend(&self, request: PendRequest) -> Result<PendResponse, TransactorError> {
        self.pends.fetch_add(1, Ordering::SeqCst);
        self.inner.pend(request).await
    }

    async fn commit(&self, request: CommitRequest) -> Result<CommitResponse, TransactorError> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(TransactorError::Cluster("commit failure injected by test".into()));
        }
        self.inner.commit(request).await
    }

    async fn cancel(&self, request: CancelRequest) -> Result<CancelResponse, TransactorError> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        self.inner.cancel(request).await
    }
}

/// Nominator decorator counting GATHER queries
pub struct CountingNominator {
    inner: Arc<CoordinatedRepo>,
    pub calls: AtomicUsize,
}

impl CountingNominator {
    pub fn new(inner: Arc<CoordinatedRepo>) -> Self {
        Self { inner, calls: AtomicUsize::new(0) }
    }
}

#[async_trait]
impl SuperclusterNominator for CountingNominator {
    async fn nominees(&self, block_id: &BlockId) -> Result<Vec<PeerId>, TransactorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.gather_nominees(block_id).await
    }
}

// --- statement builders ---

pub fn row(collection_id: &str, pairs: &[(&str, serde_json::Value)]) -> Block {
    Block::create(
        "row",
        collection_id,
        scalar_attrs(pairs.iter().map(|(k, v)| (k.to_string(), v.clone()))),
    )
}

pub fn insert_statement(collection_id: &str, block: &Block) -> String {
    serde_json::to_string(&CollectionActions {
        collection_id: collection_id.into(),
        actions: vec![CollectionAction::Insert { block: block.clone() }],
    })
    .expect("statement encoding")
}

pub fn update_statement(collection_id: &str, block_id: &BlockId, ops: Vec<TransformOp>) -> String {
    serde_json::to_string(&CollectionActions {
        collection_id: collection_id.into(),
        actions: vec![CollectionAction::Update { block_id: block_id.clone(), ops }],
    })
    .expect("statement encoding")
}

pub fn delete_statement(collection_id: &str, block_id: &BlockId) -> String {
    serde_json::to_string(&CollectionActions {
        collection_id: collection_id.into(),
        actions: vec![CollectionAction::Delete { block_id: block_id.clone() }],
    })
    .expect("statement encoding")
}
