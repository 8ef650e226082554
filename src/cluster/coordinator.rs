//! Cluster coordinator: two-phase consensus for one transactor request
//!
//! Runs on the peer coordinating a request against a block cluster.
//! Phase 1 collects signed promises from every peer in parallel; the round
//! aborts if rejections exceed the super-majority allowance or (for
//! clusters larger than one) approvals fall short of `⌈n·θ_super⌉`.
//! Phase 2 distributes the promised record for commit; the request is
//! committed once `⌊n·θ_simple⌋+1` acknowledgements arrive, and success is
//! returned to the caller immediately. Peers that missed the commit are
//! retried in the background with exponential backoff, receiving the
//! committed record so they can catch up.
//!
//! Before Phase 1 the coordinator validates undersized clusters against
//! the network size estimator: a cluster smaller than the configured
//! minimum is only accepted when the estimator confidently agrees the
//! network is actually that small, or in developer mode.
//!
//! In-flight rounds live in a process-wide table keyed by message hash;
//! entries are created when a round opens and removed on terminal
//! completion or when the last retry batch resolves.

use futures_util::future::join_all;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::cluster::estimator::NetworkSizeEstimator;
use crate::cluster::member::ClusterMember;
use crate::cluster::record::{ClusterRecord, CommitSig, PeerInfo, Promise, RepoMessage};
use crate::cluster::transport::ClusterTransport;
use crate::types::{BlockId, PeerId};

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("rejected by validators: {reasons:?}")]
    RejectedByValidators { reasons: Vec<String> },

    #[error("super-majority failed: {approvals} of {required} required approvals")]
    SuperMajorityFailed { approvals: usize, required: usize },

    #[error("commit acknowledged by {acks} peers, {required} required")]
    CommitMajorityFailed { acks: usize, required: usize, reasons: Vec<String> },

    #[error("cluster of {size} peers is below the required minimum of {required}")]
    ClusterTooSmall { size: usize, required: usize },
}

pub type Result<T> = std::result::Result<T, ClusterError>;

#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    pub super_majority_threshold: f64,
    pub simple_majority_threshold: f64,
    /// Target cluster size the routing layer aims for
    pub suggested_cluster_size: usize,
    pub min_absolute_cluster_size: usize,
    pub allow_cluster_downsize: bool,
    pub cluster_size_tolerance: f64,
    pub developer_mode: bool,
    pub rpc_timeout: Duration,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            super_majority_threshold: 2.0 / 3.0,
            simple_majority_threshold: 0.5,
            suggested_cluster_size: 3,
            min_absolute_cluster_size: 1,
            allow_cluster_downsize: false,
            cluster_size_tolerance: 0.25,
            developer_mode: true,
            rpc_timeout: Duration::from_millis(10_000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub backoff_factor: f64,
    pub max_interval: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(2_000),
            backoff_factor: 2.0,
            max_interval: Duration::from_millis(30_000),
            max_attempts: 5,
        }
    }
}

pub struct ClusterCoordinator {
    peer_id: PeerId,
    transport: Arc<dyn ClusterTransport>,
    local: Option<Arc<ClusterMember>>,
    estimator: Option<Arc<dyn NetworkSizeEstimator>>,
    records: Arc<Mutex<HashMap<String, ClusterRecord>>>,
    consensus: ConsensusConfig,
    retry: RetryPolicy,
}

impl ClusterCoordinator {
    pub fn new(
        peer_id: impl Into<PeerId>,
        transport: Arc<dyn ClusterTransport>,
        consensus: ConsensusConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            peer_id: peer_id.into(),
            transport,
            local: None,
            estimator: None,
            records: Arc::new(Mutex::new(HashMap::new())),
            consensus,
            retry,
        }
    }

    /// Handle this peer's own cluster membership in-process
    pub fn with_local_member(mut self, member: Arc<ClusterMember>) -> Self {
        self.local = Some(member);
        self
    }

    pub fn with_estimator(mut self, estimator: Arc<dyn NetworkSizeEstimator>) -> Self {
        self.estimator = Some(estimator);
        self
    }

    /// Number of rounds currently in flight (including retrying ones)
    pub fn in_flight(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    fn validate_cluster_size(&self, size: usize) -> Result<()> {
        let suggested = self.consensus.suggested_cluster_size;
        if size < suggested && !self.consensus.allow_cluster_downsize {
            let shortfall = (suggested - size) as f64 / suggested as f64;
            if shortfall > self.consensus.cluster_size_tolerance {
                warn!(
                    "Cluster of {} peer(s) is well below the suggested size of {}",
                    size, suggested
                );
            }
        }

        let required = self.consensus.min_absolute_cluster_size;
        if size >= required {
            return Ok(());
        }
        if let Some(estimate) = self.estimator.as_ref().and_then(|e| e.estimate()) {
            if estimate.confidence > 0.5 && estimate.plausibly_matches(size) {
                debug!(
                    "Accepting {}-peer cluster: estimated network size {:.0} (confidence {:.2})",
                    size, estimate.size, estimate.confidence
                );
                return Ok(());
            }
        }
        if self.consensus.developer_mode {
            warn!("⚠️ Accepting undersized cluster of {} peer(s) in developer mode", size);
            return Ok(());
        }
        Err(ClusterError::ClusterTooSmall { size, required })
    }

    /// Run one request through the two-phase protocol
    pub async fn execute_cluster_transaction(
        &self,
        message: RepoMessage,
        peers: BTreeMap<PeerId, PeerInfo>,
        coordinating_block_ids: Vec<BlockId>,
    ) -> Result<ClusterRecord> {
        let peer_count = peers.len();
        self.validate_cluster_size(peer_count)?;

        let mut record = ClusterRecord::new(message, peers, coordinating_block_ids);
        record.suggested_cluster_size = Some(self.consensus.suggested_cluster_size);
        record.min_required_size = Some(self.consensus.min_absolute_cluster_size);
        if let Some(estimate) = self.estimator.as_ref().and_then(|e| e.estimate()) {
            record.network_size_hint = Some(estimate.size);
            record.network_size_confidence = Some(estimate.confidence);
        }

        let message_hash = record.message_hash.clone();
        self.records.lock().unwrap().insert(message_hash.clone(), record.clone());
        debug!(
            "🗳️ Peer {} coordinating round {} across {} peer(s)",
            self.peer_id, message_hash, peer_count
        );

        let outcome = self.run_phases(&mut record).await;
        match &outcome {
            Ok(retrying) if *retrying => {
                // record stays in the table until the retry task resolves
            }
            _ => {
                self.records.lock().unwrap().remove(&message_hash);
            }
        }
        outcome.map(|_| record)
    }

    /// Both phases; returns whether a background retry task took ownership
    /// of the in-flight record
    async fn run_phases(&self, record: &mut ClusterRecord) -> Result<bool> {
        let peer_count = record.peers.len();
        let super_majority = ((peer_count as f64) * self.consensus.super_majority_threshold).ceil() as usize;
        let max_allowed_rejections = peer_count.saturating_sub(super_majority);

        // Phase 1: promises, all peers in parallel
        let promises = self.collect_promises(record).await;
        for (peer_id, promise) in promises {
            match promise {
                Some(promise) => {
                    record.promises.insert(peer_id, promise);
                }
                None => debug!("No promise from {}", peer_id),
            }
        }
        self.update_record(record);

        let rejections = record.rejections();
        if rejections > max_allowed_rejections {
            warn!("❌ Round {} rejected by {} validator(s)", record.message_hash, rejections);
            return Err(ClusterError::RejectedByValidators { reasons: record.reject_reasons() });
        }
        let approvals = record.approvals();
        if peer_count > 1 && approvals < super_majority {
            warn!(
                "❌ Round {} below super-majority: {}/{}",
                record.message_hash, approvals, super_majority
            );
            return Err(ClusterError::SuperMajorityFailed { approvals, required: super_majority });
        }

        // Phase 2: commits
        let simple_majority = ((peer_count as f64) * self.consensus.simple_majority_threshold).floor() as usize + 1;
        let (commits, failures) = self.collect_commits(record, None).await;
        for (peer_id, commit) in commits {
            record.commits.insert(peer_id, commit);
        }
        self.update_record(record);

        let acks = record.commits.len();
        if acks < simple_majority {
            warn!(
                "❌ Round {} below simple majority: {}/{}",
                record.message_hash, acks, simple_majority
            );
            return Err(ClusterError::CommitMajorityFailed { acks, required: simple_majority, reasons: failures });
        }

        let stragglers: BTreeSet<PeerId> = record
            .peers
            .keys()
            .filter(|peer_id| !record.commits.contains_key(*peer_id))
            .cloned()
            .collect();

        if stragglers.is_empty() {
            debug!("✅ Round {} committed by all {} peer(s)", record.message_hash, peer_count);
            return Ok(false);
        }

        info!(
            "🕑 Round {} committed with {} straggler(s); retrying in background",
            record.message_hash,
            stragglers.len()
        );
        self.spawn_retry(record.clone(), stragglers);
        Ok(true)
    }

    async fn collect_promises(&self, record: &ClusterRecord) -> Vec<(PeerId, Option<Promise>)> {
        let futures = record.peers.keys().cloned().map(|peer_id| {
            let record = record.clone();
            async move {
                let promise = self.promise_one(&peer_id, &record).await;
                (peer_id, promise)
            }
        });
        join_all(futures).await
    }

    async fn promise_one(&self, peer_id: &PeerId, record: &ClusterRecord) -> Option<Promise> {
        if let Some(local) = self.local.as_ref().filter(|m| m.peer_id() == peer_id) {
            return match local.handle_promise(record).await {
                Ok(promise) => Some(promise),
                Err(e) => {
                    warn!("Local promise failed: {}", e);
                    None
                }
            };
        }
        match timeout(self.consensus.rpc_timeout, self.transport.send_promise(peer_id, record)).await {
            Ok(Ok(promise)) => Some(promise),
            Ok(Err(e)) => {
                warn!("Promise from {} failed: {}", peer_id, e);
                None
            }
            Err(_) => {
                warn!("Promise from {} timed out", peer_id);
                None
            }
        }
    }

    /// Commit fan-out; restricted to `only` when retrying stragglers
    async fn collect_commits(
        &self,
        record: &ClusterRecord,
        only: Option<&BTreeSet<PeerId>>,
    ) -> (Vec<(PeerId, CommitSig)>, Vec<String>) {
        let targets: Vec<PeerId> = record
            .peers
            .keys()
            .filter(|peer_id| only.map(|set| set.contains(*peer_id)).unwrap_or(true))
            .cloned()
            .collect();

        let futures = targets.into_iter().map(|peer_id| {
            let record = record.clone();
            async move {
                let commit = self.commit_one(&peer_id, &record).await;
                (peer_id, commit)
            }
        });

        let mut commits = Vec::new();
        let mut failures = Vec::new();
        for (peer_id, outcome) in join_all(futures).await {
            match outcome {
                Ok(commit) => commits.push((peer_id, commit)),
                Err(reason) => failures.push(reason),
            }
        }
        (commits, failures)
    }

    async fn commit_one(&self, peer_id: &PeerId, record: &ClusterRecord) -> std::result::Result<CommitSig, String> {
        if let Some(local) = self.local.as_ref().filter(|m| m.peer_id() == peer_id) {
            return local.handle_commit(record).await.map_err(|e| e.to_string());
        }
        match timeout(self.consensus.rpc_timeout, self.transport.send_commit(peer_id, record)).await {
            Ok(Ok(commit)) => Ok(commit),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("commit to {} timed out", peer_id)),
        }
    }

    fn update_record(&self, record: &ClusterRecord) {
        let mut records = self.records.lock().unwrap();
        if let Some(entry) = records.get_mut(&record.message_hash) {
            *entry = record.clone();
        }
    }

    /// Exponential-backoff retries for peers that missed the commit; the
    /// in-flight record is freed when the last straggler resolves or
    /// attempts run out
    fn spawn_retry(&self, record: ClusterRecord, stragglers: BTreeSet<PeerId>) {
        let transport = Arc::clone(&self.transport);
        let records = Arc::clone(&self.records);
        let policy = self.retry.clone();
        let rpc_timeout = self.consensus.rpc_timeout;

        tokio::spawn(async move {
            let mut remaining = stragglers;
            let mut interval = policy.initial_interval;
            let message_hash = record.message_hash.clone();

            for attempt in 1..=policy.max_attempts {
                tokio::time::sleep(interval).await;

                // resend the current committed record so stragglers catch up
                let current = records
                    .lock()
                    .unwrap()
                    .get(&message_hash)
                    .cloned()
                    .unwrap_or_else(|| record.clone());

                let targets: Vec<PeerId> = remaining.iter().cloned().collect();
                for peer_id in targets {
                    let sent = timeout(rpc_timeout, transport.send_commit(&peer_id, &current)).await;
                    match sent {
                        Ok(Ok(commit)) => {
                            remaining.remove(&peer_id);
                            let mut records = records.lock().unwrap();
                            if let Some(entry) = records.get_mut(&message_hash) {
                                entry.commits.insert(peer_id.clone(), commit);
                            }
                            debug!("🕑 Straggler {} caught up on round {}", peer_id, message_hash);
                        }
                        Ok(Err(e)) => {
                            debug!("Retry {} to {} failed: {}", attempt, peer_id, e);
                        }
                        Err(_) => {
                            debug!("Retry {} to {} timed out", attempt, peer_id);
                        }
                    }
                }

                if remaining.is_empty() {
                    break;
                }
                let scaled = interval.as_millis() as f64 * policy.backoff_factor;
                interval = Duration::from_millis(scaled as u64).min(policy.max_interval);
            }

            if !remaining.is_empty() {
                warn!(
                    "Round {} gave up on {} straggler(s) after {} attempts",
                    message_hash,
                    remaining.len(),
                    policy.max_attempts
                );
            }
            records.lock().unwrap().remove(&message_hash);
        });
    }
}
