//! The transactor contract: get / pend / commit / cancel
//!
//! This is the wire-level surface a block cluster exposes. The local
//! storage repository implements it authoritatively; the coordinated
//! repository implements it by routing each request through cluster
//! consensus. Requests and responses are tagged serde types so the
//! canonical encoding (sorted-key JSON) is the same on every peer.
//!
//! ## Pend policies
//!
//! A pend that collides with already-pending actions resolves per policy:
//! - `f` (fail): strictest; the pend is refused, conflicts listed
//! - `r` (return): refused, and each conflict is enriched with its
//!   pending transform so the caller can reason about it
//! - `w` (wait/continue): most permissive; the pend proceeds and the
//!   conflicts ride along in the success response
//!
//! The semantics are identical for local and remote implementations.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::block::Block;
use crate::transform::{Transform, Transforms};
use crate::types::{ActionId, BlockId, PeerId, Rev, RevRef, Transaction};

#[derive(Error, Debug)]
pub enum TransactorError {
    /// Commit named an action that was never pended; a protocol violation
    #[error("no pending action {action_id} on block {block_id}")]
    NotPending { block_id: BlockId, action_id: ActionId },

    /// A non-delete transform produced no block during commit; corruption
    #[error("commit of {0} produced no block without a delete flag")]
    CommitInconsistent(BlockId),

    #[error("storage error: {0}")]
    Storage(#[from] crate::storage::block_store::StorageError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("cluster error: {0}")]
    Cluster(String),
}

pub type Result<T> = std::result::Result<T, TransactorError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PendPolicy {
    #[serde(rename = "f")]
    Fail,
    #[serde(rename = "r")]
    Return,
    #[serde(rename = "w")]
    Continue,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<Rev>,
    /// Layer this pending action over the latest committed block
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_id: Option<ActionId>,
    /// Committed actions the caller expects present; pendings matching
    /// them are promoted before the read
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub committed: Option<Vec<RevRef>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetRequest {
    pub block_ids: Vec<BlockId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<GetContext>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest: Option<RevRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pendings: Vec<ActionId>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockGetResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block: Option<Block>,
    pub state: BlockState,
}

pub type GetResponse = BTreeMap<BlockId, BlockGetResult>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendRequest {
    pub action_id: ActionId,
    pub transforms: Transforms,
    pub policy: PendPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<Rev>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operations_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction: Option<Transaction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supercluster_nominees: Option<Vec<PeerId>>,
}

/// One pending-action conflict; `transform` is populated under policy `r`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRef {
    pub block_id: BlockId,
    pub action_id: ActionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<Transform>,
}

/// A committed action the caller has not seen, keyed per block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissingAction {
    pub action_id: ActionId,
    pub rev: Rev,
    pub transforms: BTreeMap<BlockId, Transform>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum PendResponse {
    Pended {
        block_ids: Vec<BlockId>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        pending: Vec<PendingRef>,
    },
    PendingConflict {
        pending: Vec<PendingRef>,
    },
    MissingConflict {
        missing: Vec<MissingAction>,
    },
    Rejected {
        reason: String,
    },
}

impl PendResponse {
    pub fn is_success(&self) -> bool {
        matches!(self, PendResponse::Pended { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRequest {
    pub action_id: ActionId,
    pub block_ids: Vec<BlockId>,
    /// The collection's critical block (log tail), the per-collection
    /// serialization point in multi-collection transactions
    pub tail_id: BlockId,
    pub rev: Rev,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CommitResponse {
    Committed,
    MissingConflict { missing: Vec<MissingAction> },
}

impl CommitResponse {
    pub fn is_success(&self) -> bool {
        matches!(self, CommitResponse::Committed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelRequest {
    pub action_id: ActionId,
    pub block_ids: Vec<BlockId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelResponse {}

/// The two-phase block-cluster contract
#[async_trait]
pub trait Transactor: Send + Sync {
    async fn get(&self, request: GetRequest) -> Result<GetResponse>;
    async fn pend(&self, request: PendRequest) -> Result<PendResponse>;
    async fn commit(&self, request: CommitRequest) -> Result<CommitResponse>;
    async fn cancel(&self, request: CancelRequest) -> Result<CancelResponse>;
}
