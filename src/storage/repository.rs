//! Storage repository: the authoritative transactor implementation
//!
//! `StorageRepo` owns the per-block state on this peer and serializes all
//! mutation through the named latch map. It implements the full transactor
//! contract (`get`, `pend`, `commit`, `cancel`) with revision-conflict
//! detection, pending-conflict policies, missing-action replay, and the
//! crash-safe commit write ordering:
//!
//! ```text
//! materialization → revision index → promote pending → latest pointer
//! ```
//!
//! A crash between any two steps leaves the block with an older but
//! consistent `latest`; the orphaned writes ahead of it are harmless and
//! are overwritten when the commit is retried.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::block::Block;
use crate::storage::block_store::{BlockStore, StorageError};
use crate::storage::latch::LatchMap;
use crate::transactor::{
    BlockGetResult, BlockState, CancelRequest, CancelResponse, CommitRequest, CommitResponse, GetRequest,
    GetResponse, MissingAction, PendPolicy, PendRequest, PendResponse, PendingRef, Result, Transactor,
    TransactorError,
};
use crate::transform::{apply_transform, block_ids_for_transforms, transform_for_block_id};
use crate::types::{ActionId, BlockId, Rev, RevRef, Transaction};

/// Hook run before a pend that carries a transaction envelope; lets a
/// validating peer independently confirm the operations hash
#[async_trait]
pub trait PendValidator: Send + Sync {
    async fn validate(&self, transaction: &Transaction, operations_hash: &str) -> std::result::Result<(), String>;
}

pub struct StorageRepo {
    store: Arc<BlockStore>,
    latches: LatchMap,
    validator: Option<Arc<dyn PendValidator>>,
}

impl StorageRepo {
    pub fn new(store: Arc<BlockStore>) -> Self {
        Self { store, latches: LatchMap::new(), validator: None }
    }

    pub fn with_validator(mut self, validator: Arc<dyn PendValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn store(&self) -> &Arc<BlockStore> {
        &self.store
    }

    /// Log pending actions left over from a previous run; their
    /// coordinators will cancel or re-commit them
    pub fn recover_pendings(&self) -> std::result::Result<Vec<(BlockId, ActionId)>, StorageError> {
        let pendings = self.store.list_all_pendings()?;
        if pendings.is_empty() {
            info!("🗃️ No pending actions to recover");
        } else {
            info!("🗃️ Recovered {} pending action(s) from previous run", pendings.len());
            for (block_id, action_id) in &pendings {
                debug!("  pending {} on block {}", action_id, block_id);
            }
        }
        Ok(pendings)
    }

    /// Committed actions at or above `rev`, merged per action id across
    /// the given block
    fn missing_since(
        &self,
        block_id: &BlockId,
        rev: Rev,
        latest: &RevRef,
        missing: &mut BTreeMap<ActionId, MissingAction>,
    ) -> Result<()> {
        for rev_ref in self.store.list_revisions(block_id, rev, latest.rev)? {
            let transform = self
                .store
                .get_transaction(block_id, &rev_ref.action_id)?
                .unwrap_or_default();
            let entry = missing.entry(rev_ref.action_id.clone()).or_insert_with(|| MissingAction {
                action_id: rev_ref.action_id.clone(),
                rev: rev_ref.rev,
                transforms: BTreeMap::new(),
            });
            entry.transforms.insert(block_id.clone(), transform);
        }
        Ok(())
    }

    /// One block's commit, under its latch: the crash-safe write ordering
    async fn commit_block(&self, block_id: &BlockId, action_id: &ActionId, rev: Rev) -> Result<()> {
        let transform = self
            .store
            .get_pending_transaction(block_id, action_id)?
            .ok_or_else(|| TransactorError::NotPending {
                block_id: block_id.clone(),
                action_id: action_id.clone(),
            })?;

        let prior = self.store.get_block(block_id, None).await?;
        let next = apply_transform(prior.as_ref(), &transform);

        if next.is_none() && !transform.delete {
            return Err(TransactorError::CommitInconsistent(block_id.clone()));
        }

        if let Some(block) = &next {
            self.store.save_materialized_block(block_id, action_id, block)?;
        }
        self.store.save_revision(block_id, rev, action_id)?;
        self.store.promote_pending_transaction(block_id, action_id)?;
        self.store.set_latest(block_id, RevRef::new(action_id.clone(), rev))?;
        Ok(())
    }

    /// Read one block under its latch, honoring the get context
    async fn get_block_entry(&self, block_id: &BlockId, request: &GetRequest) -> Result<(Option<Block>, BlockState)> {
        let _guard = self.latches.acquire(block_id).await;
        let context = request.context.as_ref();

        // Catch up: promote pendings the caller knows are committed
        if let Some(committed) = context.and_then(|ctx| ctx.committed.as_ref()) {
            let mut expected: Vec<&RevRef> = committed.iter().collect();
            expected.sort_by_key(|rev_ref| rev_ref.rev);
            for rev_ref in expected {
                let latest_rev = self.store.get_latest(block_id)?.map(|l| l.rev).unwrap_or(0);
                if rev_ref.rev <= latest_rev {
                    continue;
                }
                if self.store.get_pending_transaction(block_id, &rev_ref.action_id)?.is_some() {
                    debug!("⏩ Advancing block {} to rev {} via pending {}", block_id, rev_ref.rev, rev_ref.action_id);
                    self.commit_block(block_id, &rev_ref.action_id, rev_ref.rev).await?;
                }
            }
        }

        let latest = self.store.get_latest(block_id)?;

        if let Some(action_id) = context.and_then(|ctx| ctx.action_id.as_ref()) {
            // Layer the named pending action over the latest committed state
            let base = self.store.get_block(block_id, None).await?;
            let block = match self.store.get_pending_transaction(block_id, action_id)? {
                Some(transform) => apply_transform(base.as_ref(), &transform),
                None => base,
            };
            return Ok((block, BlockState { latest, pendings: vec![action_id.clone()] }));
        }

        let rev = context.and_then(|ctx| ctx.rev);
        let block = self.store.get_block(block_id, rev).await?;
        let pendings = self
            .store
            .list_pending_transactions(block_id)?
            .into_iter()
            .map(|(action_id, _)| action_id)
            .collect();
        Ok((block, BlockState { latest, pendings }))
    }
}

#[async_trait]
impl Transactor for StorageRepo {
    async fn get(&self, request: GetRequest) -> Result<GetResponse> {
        let unique: BTreeSet<BlockId> = request.block_ids.iter().cloned().collect();
        let mut response = GetResponse::new();
        for block_id in unique {
            let (block, state) = self.get_block_entry(&block_id, &request).await?;
            response.insert(block_id, BlockGetResult { block, state });
        }
        Ok(response)
    }

    async fn pend(&self, request: PendRequest) -> Result<PendResponse> {
        if let (Some(validator), Some(transaction), Some(operations_hash)) =
            (&self.validator, &request.transaction, &request.operations_hash)
        {
            if let Err(reason) = validator.validate(transaction, operations_hash).await {
                warn!("Pend {} rejected by validator: {}", request.action_id, reason);
                return Ok(PendResponse::Rejected { reason });
            }
        }

        let block_ids = block_ids_for_transforms(&request.transforms);
        let _guards = self.latches.acquire_sorted(&block_ids).await;

        let mut pending_conflicts: Vec<PendingRef> = Vec::new();
        let mut missing: BTreeMap<ActionId, MissingAction> = BTreeMap::new();

        for block_id in &block_ids {
            let projected = transform_for_block_id(&request.transforms, block_id);

            for (action_id, _) in self.store.list_pending_transactions(block_id)? {
                if action_id != request.action_id {
                    pending_conflicts.push(PendingRef { block_id: block_id.clone(), action_id, transform: None });
                }
            }

            // Inserts conflict with any committed history; explicit revs
            // conflict with anything at or above them
            if request.rev.is_some() || projected.insert.is_some() {
                let threshold = request.rev.unwrap_or(0);
                if let Some(latest) = self.store.get_latest(block_id)? {
                    if latest.rev >= threshold {
                        self.missing_since(block_id, threshold, &latest, &mut missing)?;
                    }
                }
            }
        }

        if !missing.is_empty() {
            let mut missing: Vec<MissingAction> = missing.into_values().collect();
            missing.sort_by_key(|action| action.rev);
            debug!("Pend {} lost to {} committed action(s)", request.action_id, missing.len());
            return Ok(PendResponse::MissingConflict { missing });
        }

        if !pending_conflicts.is_empty() {
            match request.policy {
                PendPolicy::Fail => {
                    return Ok(PendResponse::PendingConflict { pending: pending_conflicts });
                }
                PendPolicy::Return => {
                    for conflict in &mut pending_conflicts {
                        // the conflicting action may have been promoted in
                        // the interim; fall back to the committed table
                        conflict.transform = match self
                            .store
                            .get_pending_transaction(&conflict.block_id, &conflict.action_id)?
                        {
                            Some(transform) => Some(transform),
                            None => self.store.get_transaction(&conflict.block_id, &conflict.action_id)?,
                        };
                    }
                    return Ok(PendResponse::PendingConflict { pending: pending_conflicts });
                }
                PendPolicy::Continue => {
                    debug!(
                        "Pend {} proceeding past {} pending conflict(s)",
                        request.action_id,
                        pending_conflicts.len()
                    );
                }
            }
        }

        for block_id in &block_ids {
            let projected = transform_for_block_id(&request.transforms, block_id);
            self.store.save_pending_transaction(block_id, &request.action_id, &projected)?;
        }

        Ok(PendResponse::Pended {
            block_ids: block_ids.into_iter().collect(),
            pending: pending_conflicts,
        })
    }

    async fn commit(&self, request: CommitRequest) -> Result<CommitResponse> {
        let block_ids: BTreeSet<BlockId> = request.block_ids.iter().cloned().collect();
        let _guards = self.latches.acquire_sorted(&block_ids).await;

        // Revision check across every block before touching any of them
        let mut missing: BTreeMap<ActionId, MissingAction> = BTreeMap::new();
        for block_id in &block_ids {
            if let Some(latest) = self.store.get_latest(block_id)? {
                if latest.rev >= request.rev {
                    self.missing_since(block_id, request.rev, &latest, &mut missing)?;
                }
            }
        }
        if !missing.is_empty() {
            let mut missing: Vec<MissingAction> = missing.into_values().collect();
            missing.sort_by_key(|action| action.rev);
            return Ok(CommitResponse::MissingConflict { missing });
        }

        // Every block must hold the pending entry; anything else is a
        // protocol violation, not a conflict
        for block_id in &block_ids {
            if self.store.get_pending_transaction(block_id, &request.action_id)?.is_none() {
                return Err(TransactorError::NotPending {
                    block_id: block_id.clone(),
                    action_id: request.action_id.clone(),
                });
            }
        }

        for block_id in &block_ids {
            self.commit_block(block_id, &request.action_id, request.rev).await?;
        }

        debug!("✅ Committed action {} at rev {} across {} block(s)", request.action_id, request.rev, block_ids.len());
        Ok(CommitResponse::Committed)
    }

    async fn cancel(&self, request: CancelRequest) -> Result<CancelResponse> {
        let block_ids: BTreeSet<BlockId> = request.block_ids.iter().cloned().collect();
        let _guards = self.latches.acquire_sorted(&block_ids).await;
        for block_id in &block_ids {
            self.store.delete_pending_transaction(block_id, &request.action_id)?;
        }
        Ok(CancelResponse::default())
    }
}
