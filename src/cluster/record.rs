//! The cluster consensus envelope
//!
//! A `ClusterRecord` wraps one transactor request (`RepoMessage`) for a
//! two-phase round across the peers responsible for its blocks. The
//! promises and commits maps grow monotonically while the round runs; the
//! record is identified everywhere by the hash of its message's canonical
//! encoding.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::transactor::{CancelRequest, CommitRequest, PendRequest};
use crate::types::{canonical_digest, BlockId, PeerId};

/// A transactor request as it travels between cluster peers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RepoMessage {
    Pend(PendRequest),
    Commit(CommitRequest),
    Cancel(CancelRequest),
}

impl RepoMessage {
    /// Stable hash over the canonical encoding; the identity of a
    /// consensus round
    pub fn hash(&self) -> String {
        canonical_digest(self)
    }

    pub fn block_ids(&self) -> Vec<BlockId> {
        match self {
            RepoMessage::Pend(request) => {
                crate::transform::block_ids_for_transforms(&request.transforms).into_iter().collect()
            }
            RepoMessage::Commit(request) => request.block_ids.clone(),
            RepoMessage::Cancel(request) => request.block_ids.clone(),
        }
    }

    pub fn action_id(&self) -> &str {
        match self {
            RepoMessage::Pend(request) => &request.action_id,
            RepoMessage::Commit(request) => &request.action_id,
            RepoMessage::Cancel(request) => &request.action_id,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addrs: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromiseKind {
    Approve,
    Reject,
}

/// A peer's signed first-phase vote
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Promise {
    #[serde(rename = "type")]
    pub kind: PromiseKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reject_reason: Option<String>,
    pub bytes: String,
}

impl Promise {
    pub fn is_approve(&self) -> bool {
        matches!(self.kind, PromiseKind::Approve)
    }
}

/// A peer's signed second-phase acknowledgement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitSig {
    pub bytes: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterRecord {
    pub message_hash: String,
    pub peers: BTreeMap<PeerId, PeerInfo>,
    pub message: RepoMessage,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub promises: BTreeMap<PeerId, Promise>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub commits: BTreeMap<PeerId, CommitSig>,
    pub coordinating_block_ids: Vec<BlockId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_cluster_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_required_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_size_hint: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_size_confidence: Option<f64>,
}

impl ClusterRecord {
    pub fn new(message: RepoMessage, peers: BTreeMap<PeerId, PeerInfo>, coordinating_block_ids: Vec<BlockId>) -> Self {
        Self {
            message_hash: message.hash(),
            peers,
            message,
            promises: BTreeMap::new(),
            commits: BTreeMap::new(),
            coordinating_block_ids,
            suggested_cluster_size: None,
            min_required_size: None,
            network_size_hint: None,
            network_size_confidence: None,
        }
    }

    pub fn approvals(&self) -> usize {
        self.promises.values().filter(|promise| promise.is_approve()).count()
    }

    pub fn rejections(&self) -> usize {
        self.promises.values().filter(|promise| !promise.is_approve()).count()
    }

    pub fn reject_reasons(&self) -> Vec<String> {
        self.promises
            .values()
            .filter_map(|promise| promise.reject_reason.clone())
            .collect()
    }
}
