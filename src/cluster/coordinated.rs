//! Coordinated repository: the per-peer request dispatcher
//!
//! Implements the transactor contract by routing every request to the
//! cluster of peers responsible for its blocks. Reads go straight to a
//! responsible peer (this one, when it is in the cluster); mutations run
//! through the two-phase cluster coordinator. Structured failures raised
//! by validating members travel back inside reject reasons and are
//! surfaced to the caller as ordinary tagged responses, so callers cannot
//! tell a local repository from a coordinated one.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

use crate::cluster::coordinator::{ClusterCoordinator, ClusterError};
use crate::cluster::member::{decode_commit_failure, decode_pend_failure};
use crate::cluster::record::{PeerInfo, RepoMessage};
use crate::cluster::transport::{ClusterDirectory, ClusterTransport};
use crate::storage::repository::StorageRepo;
use crate::transactor::{
    CancelRequest, CancelResponse, CommitRequest, CommitResponse, GetRequest, GetResponse, PendRequest,
    PendResponse, Result, Transactor, TransactorError,
};
use crate::transform::block_ids_for_transforms;
use crate::types::{BlockId, PeerId};

pub struct CoordinatedRepo {
    peer_id: PeerId,
    local: Option<Arc<StorageRepo>>,
    directory: Arc<dyn ClusterDirectory>,
    transport: Arc<dyn ClusterTransport>,
    coordinator: Arc<ClusterCoordinator>,
}

impl CoordinatedRepo {
    pub fn new(
        peer_id: impl Into<PeerId>,
        directory: Arc<dyn ClusterDirectory>,
        transport: Arc<dyn ClusterTransport>,
        coordinator: Arc<ClusterCoordinator>,
    ) -> Self {
        Self { peer_id: peer_id.into(), local: None, directory, transport, coordinator }
    }

    /// Serve reads from this peer's own repository when it is in the
    /// responsible cluster
    pub fn with_local(mut self, local: Arc<StorageRepo>) -> Self {
        self.local = Some(local);
        self
    }

    /// Peers authorized to validate cross-cluster ordering for a block:
    /// the block's own cluster
    pub async fn gather_nominees(&self, block_id: &BlockId) -> Result<Vec<PeerId>> {
        let cluster = self
            .directory
            .find_cluster(block_id)
            .await
            .map_err(|e| TransactorError::Transport(e.to_string()))?;
        Ok(cluster.into_keys().collect())
    }

    async fn responsible_peers(&self, block_ids: &BTreeSet<BlockId>) -> Result<BTreeMap<PeerId, PeerInfo>> {
        let mut peers = BTreeMap::new();
        for block_id in block_ids {
            let cluster = self
                .directory
                .find_cluster(block_id)
                .await
                .map_err(|e| TransactorError::Transport(e.to_string()))?;
            peers.extend(cluster);
        }
        Ok(peers)
    }
}

#[async_trait]
impl Transactor for CoordinatedRepo {
    async fn get(&self, request: GetRequest) -> Result<GetResponse> {
        // group ids by responsible cluster, one read per cluster
        let mut by_cluster: BTreeMap<Vec<PeerId>, Vec<BlockId>> = BTreeMap::new();
        let unique: BTreeSet<BlockId> = request.block_ids.iter().cloned().collect();
        for block_id in unique {
            let cluster = self
                .directory
                .find_cluster(&block_id)
                .await
                .map_err(|e| TransactorError::Transport(e.to_string()))?;
            by_cluster.entry(cluster.into_keys().collect()).or_default().push(block_id);
        }

        let mut response = GetResponse::new();
        for (peers, block_ids) in by_cluster {
            let sub_request = GetRequest { block_ids, context: request.context.clone() };
            let sub_response = if peers.iter().any(|p| *p == self.peer_id) && self.local.is_some() {
                self.local.as_ref().unwrap().get(sub_request).await?
            } else {
                let target = peers
                    .first()
                    .ok_or_else(|| TransactorError::Transport("empty cluster".into()))?;
                debug!("🔭 Reading {} block(s) from peer {}", sub_request.block_ids.len(), target);
                self.transport
                    .send_get(target, sub_request)
                    .await
                    .map_err(|e| TransactorError::Transport(e.to_string()))?
            };
            response.extend(sub_response);
        }
        Ok(response)
    }

    async fn pend(&self, request: PendRequest) -> Result<PendResponse> {
        let block_ids = block_ids_for_transforms(&request.transforms);
        let peers = self.responsible_peers(&block_ids).await?;
        let message = RepoMessage::Pend(request);
        let coordinating: Vec<BlockId> = block_ids.iter().cloned().collect();

        match self.coordinator.execute_cluster_transaction(message, peers, coordinating).await {
            Ok(_record) => Ok(PendResponse::Pended {
                block_ids: block_ids.into_iter().collect(),
                pending: Vec::new(),
            }),
            Err(ClusterError::RejectedByValidators { reasons }) => {
                // a validator's structured refusal is the caller's response
                for reason in &reasons {
                    if let Some(response) = decode_pend_failure(reason) {
                        return Ok(response);
                    }
                }
                Ok(PendResponse::Rejected { reason: reasons.join("; ") })
            }
            Err(e) => Err(TransactorError::Cluster(e.to_string())),
        }
    }

    async fn commit(&self, request: CommitRequest) -> Result<CommitResponse> {
        let block_ids: BTreeSet<BlockId> = request.block_ids.iter().cloned().collect();
        let peers = self.responsible_peers(&block_ids).await?;
        let coordinating = request.block_ids.clone();
        let message = RepoMessage::Commit(request);

        match self.coordinator.execute_cluster_transaction(message, peers, coordinating).await {
            Ok(_record) => Ok(CommitResponse::Committed),
            Err(ClusterError::RejectedByValidators { reasons }) => {
                for reason in &reasons {
                    if let Some(response) = decode_commit_failure(reason) {
                        return Ok(response);
                    }
                }
                Err(TransactorError::Cluster(format!("commit rejected: {}", reasons.join("; "))))
            }
            Err(ClusterError::CommitMajorityFailed { reasons, acks, required }) => {
                for reason in &reasons {
                    if let Some(response) = decode_commit_failure(reason) {
                        return Ok(response);
                    }
                }
                Err(TransactorError::Cluster(format!(
                    "commit acknowledged by {acks} of {required} required peers"
                )))
            }
            Err(e) => Err(TransactorError::Cluster(e.to_string())),
        }
    }

    async fn cancel(&self, request: CancelRequest) -> Result<CancelResponse> {
        let block_ids: BTreeSet<BlockId> = request.block_ids.iter().cloned().collect();
        let peers = self.responsible_peers(&block_ids).await?;
        let coordinating = request.block_ids.clone();
        let message = RepoMessage::Cancel(request);

        self.coordinator
            .execute_cluster_transaction(message, peers, coordinating)
            .await
            .map_err(|e| TransactorError::Cluster(e.to_string()))?;
        Ok(CancelResponse::default())
    }
}
