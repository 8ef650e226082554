//! Member-side handling of cluster consensus rounds
//!
//! Every peer in a block's cluster runs one of these against its local
//! storage repository. Phase handling is idempotent per message hash: a
//! replayed promise or commit returns the signature produced the first
//! time and never re-applies the operation; that is what makes the
//! coordinator's straggler retries safe.
//!
//! Phase semantics per message kind:
//! - `Pend` applies during the promise phase (a pend is revocable; the
//!   coordinator compensates with cancel); the commit phase is a durable
//!   acknowledgement.
//! - `Commit` is precondition-checked during promise (pending present, no
//!   committed revision at or above the target) and applied during the
//!   commit phase.
//! - `Cancel` always promises approval and applies during commit.
//!
//! When a member rejects, `reject_reason` carries the serialized
//! transactor failure response so the coordinating peer can hand the
//! structured conflict back to its caller.

use base64::Engine as _;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::cluster::record::{ClusterRecord, CommitSig, Promise, PromiseKind, RepoMessage};
use crate::storage::repository::StorageRepo;
use crate::transactor::{CommitResponse, PendResponse, Result, Transactor, TransactorError};
use crate::types::{sha256_bytes, PeerId};

#[derive(Default)]
struct SeenRound {
    promise: Option<Promise>,
    commit: Option<CommitSig>,
}

pub struct ClusterMember {
    peer_id: PeerId,
    repo: Arc<StorageRepo>,
    seen: Mutex<HashMap<String, SeenRound>>,
}

impl ClusterMember {
    pub fn new(peer_id: impl Into<PeerId>, repo: Arc<StorageRepo>) -> Self {
        Self { peer_id: peer_id.into(), repo, seen: Mutex::new(HashMap::new()) }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn repo(&self) -> &Arc<StorageRepo> {
        &self.repo
    }

    fn sign(&self, message_hash: &str, phase: &str) -> String {
        let payload = format!("{}:{}:{}", self.peer_id, message_hash, phase);
        base64::engine::general_purpose::STANDARD.encode(sha256_bytes(payload.as_bytes()))
    }

    fn approve(&self, message_hash: &str) -> Promise {
        Promise { kind: PromiseKind::Approve, reject_reason: None, bytes: self.sign(message_hash, "promise") }
    }

    fn reject(&self, message_hash: &str, reason: String) -> Promise {
        Promise {
            kind: PromiseKind::Reject,
            reject_reason: Some(reason),
            bytes: self.sign(message_hash, "promise"),
        }
    }

    pub async fn handle_promise(&self, record: &ClusterRecord) -> Result<Promise> {
        {
            let seen = self.seen.lock().await;
            if let Some(round) = seen.get(&record.message_hash) {
                if let Some(promise) = &round.promise {
                    debug!("Replayed promise for {}", record.message_hash);
                    return Ok(promise.clone());
                }
            }
        }

        let promise = match &record.message {
            RepoMessage::Pend(request) => match self.repo.pend(request.clone()).await? {
                response if response.is_success() => self.approve(&record.message_hash),
                failure => self.reject(&record.message_hash, encode_pend_failure(&failure)),
            },
            RepoMessage::Commit(request) => {
                let mut verdict = self.approve(&record.message_hash);
                for block_id in &request.block_ids {
                    let store = self.repo.store();
                    if store.get_pending_transaction(block_id, &request.action_id)?.is_none() {
                        verdict = self.reject(
                            &record.message_hash,
                            format!("no pending action {} on block {}", request.action_id, block_id),
                        );
                        break;
                    }
                    if let Some(latest) = store.get_latest(block_id)? {
                        if latest.rev >= request.rev {
                            verdict = self.reject(
                                &record.message_hash,
                                format!("block {} already committed at rev {}", block_id, latest.rev),
                            );
                            break;
                        }
                    }
                }
                verdict
            }
            RepoMessage::Cancel(_) => self.approve(&record.message_hash),
        };

        let mut seen = self.seen.lock().await;
        seen.entry(record.message_hash.clone()).or_default().promise = Some(promise.clone());
        Ok(promise)
    }

    pub async fn handle_commit(&self, record: &ClusterRecord) -> Result<CommitSig> {
        {
            let seen = self.seen.lock().await;
            if let Some(round) = seen.get(&record.message_hash) {
                if let Some(commit) = &round.commit {
                    debug!("Replayed commit for {}", record.message_hash);
                    return Ok(commit.clone());
                }
            }
        }

        match &record.message {
            // the pend was applied at promise time
            RepoMessage::Pend(_) => {}
            RepoMessage::Commit(request) => match self.repo.commit(request.clone()).await? {
                CommitResponse::Committed => {}
                failure @ CommitResponse::MissingConflict { .. } => {
                    return Err(TransactorError::Cluster(encode_commit_failure(&failure)));
                }
            },
            RepoMessage::Cancel(request) => {
                self.repo.cancel(request.clone()).await?;
            }
        }

        let commit = CommitSig { bytes: self.sign(&record.message_hash, "commit") };
        let mut seen = self.seen.lock().await;
        seen.entry(record.message_hash.clone()).or_default().commit = Some(commit.clone());
        Ok(commit)
    }

    /// Drop replay state for a finished round
    pub async fn forget(&self, message_hash: &str) {
        self.seen.lock().await.remove(message_hash);
    }
}

pub fn encode_pend_failure(response: &PendResponse) -> String {
    serde_json::to_string(response).unwrap_or_else(|_| "pend failed".into())
}

pub fn decode_pend_failure(reason: &str) -> Option<PendResponse> {
    serde_json::from_str(reason).ok()
}

pub fn encode_commit_failure(response: &CommitResponse) -> String {
    serde_json::to_string(response).unwrap_or_else(|_| "commit failed".into())
}

pub fn decode_commit_failure(reason: &str) -> Option<CommitResponse> {
    serde_json::from_str(reason).ok()
}
