//! Transport and routing seams for the cluster layer
//!
//! The production transport (libp2p-style peer channels) and the DHT that
//! maps block ids to clusters live outside this repository; the consensus
//! pipeline consumes them through `ClusterTransport` and
//! `ClusterDirectory`. `InProcessNetwork` is the reference implementation
//! of both: members registered in one process, routed by rendezvous
//! hashing. It is what the single-peer binary and the multi-peer
//! integration tests run on.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::cluster::member::ClusterMember;
use crate::cluster::record::{ClusterRecord, CommitSig, PeerInfo, Promise};
use crate::transactor::{GetRequest, GetResponse, Transactor};
use crate::types::{canonical_digest, BlockId, PeerId};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("peer {0} is unreachable")]
    Unreachable(PeerId),

    #[error("request to peer {0} timed out")]
    Timeout(PeerId),

    #[error("peer {peer_id} failed the request: {reason}")]
    Remote { peer_id: PeerId, reason: String },
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Peer channel abstraction: one call per consensus phase, plus reads
#[async_trait]
pub trait ClusterTransport: Send + Sync {
    async fn send_promise(&self, peer_id: &PeerId, record: &ClusterRecord) -> Result<Promise>;
    async fn send_commit(&self, peer_id: &PeerId, record: &ClusterRecord) -> Result<CommitSig>;
    async fn send_get(&self, peer_id: &PeerId, request: GetRequest) -> Result<GetResponse>;
}

/// Routing abstraction: which peers are responsible for a block
#[async_trait]
pub trait ClusterDirectory: Send + Sync {
    async fn find_cluster(&self, block_id: &BlockId) -> Result<BTreeMap<PeerId, PeerInfo>>;
}

/// All peers in one process; the reference collaborator
pub struct InProcessNetwork {
    members: RwLock<HashMap<PeerId, Arc<ClusterMember>>>,
    cluster_size: usize,
}

impl InProcessNetwork {
    pub fn new(cluster_size: usize) -> Self {
        Self { members: RwLock::new(HashMap::new()), cluster_size: cluster_size.max(1) }
    }

    pub async fn register(&self, member: Arc<ClusterMember>) {
        let mut members = self.members.write().await;
        members.insert(member.peer_id().clone(), member);
    }

    async fn member(&self, peer_id: &PeerId) -> Result<Arc<ClusterMember>> {
        let members = self.members.read().await;
        members.get(peer_id).cloned().ok_or_else(|| TransportError::Unreachable(peer_id.clone()))
    }
}

#[async_trait]
impl ClusterTransport for InProcessNetwork {
    async fn send_promise(&self, peer_id: &PeerId, record: &ClusterRecord) -> Result<Promise> {
        let member = self.member(peer_id).await?;
        member
            .handle_promise(record)
            .await
            .map_err(|e| TransportError::Remote { peer_id: peer_id.clone(), reason: e.to_string() })
    }

    async fn send_commit(&self, peer_id: &PeerId, record: &ClusterRecord) -> Result<CommitSig> {
        let member = self.member(peer_id).await?;
        member
            .handle_commit(record)
            .await
            .map_err(|e| TransportError::Remote { peer_id: peer_id.clone(), reason: e.to_string() })
    }

    async fn send_get(&self, peer_id: &PeerId, request: GetRequest) -> Result<GetResponse> {
        let member = self.member(peer_id).await?;
        member
            .repo()
            .get(request)
            .await
            .map_err(|e| TransportError::Remote { peer_id: peer_id.clone(), reason: e.to_string() })
    }
}

#[async_trait]
impl ClusterDirectory for InProcessNetwork {
    /// Rendezvous hashing: every peer scores against the block id and the
    /// top `cluster_size` peers own it. Deterministic on every peer.
    async fn find_cluster(&self, block_id: &BlockId) -> Result<BTreeMap<PeerId, PeerInfo>> {
        let members = self.members.read().await;
        let mut scored: Vec<(String, PeerId)> = members
            .keys()
            .map(|peer_id| (canonical_digest(&(peer_id, block_id)), peer_id.clone()))
            .collect();
        scored.sort();
        Ok(scored
            .into_iter()
            .take(self.cluster_size)
            .map(|(_, peer_id)| (peer_id, PeerInfo::default()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::block_store::BlockStore;
    use crate::storage::repository::StorageRepo;
    use tempfile::TempDir;

    async fn network_with_peers(names: &[&str], cluster_size: usize) -> (InProcessNetwork, Vec<TempDir>) {
        let network = InProcessNetwork::new(cluster_size);
        let mut dirs = Vec::new();
        for name in names {
            let dir = TempDir::new().unwrap();
            let store = Arc::new(BlockStore::open(dir.path()).unwrap());
            let repo = Arc::new(StorageRepo::new(store));
            network.register(Arc::new(ClusterMember::new(*name, repo))).await;
            dirs.push(dir);
        }
        (network, dirs)
    }

    #[tokio::test]
    async fn cluster_selection_is_deterministic_and_sized() {
        let (network, _dirs) = network_with_peers(&["p1", "p2", "p3", "p4", "p5"], 3).await;
        let a = network.find_cluster(&"block-1".to_string()).await.unwrap();
        let b = network.find_cluster(&"block-1".to_string()).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 3);

        let other = network.find_cluster(&"block-2".to_string()).await.unwrap();
        assert_eq!(other.len(), 3);
    }

    #[tokio::test]
    async fn unknown_peer_is_unreachable() {
        let (network, _dirs) = network_with_peers(&["p1"], 1).await;
        let err = network
            .send_get(&"nope".to_string(), GetRequest { block_ids: vec![], context: None })
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Unreachable(_)));
    }
}
