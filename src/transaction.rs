//! Transaction coordinator: multi-collection orchestration
//!
//! Drives a transaction through its full lifecycle:
//!
//! 1. **Execute**: the named engine turns statements into per-collection
//!    actions, which are applied to each collection's local snapshot;
//!    observed reads accumulate on the transaction.
//! 2. **Log**: each affected collection appends an action entry at
//!    `priorRev + 1`; the tail chunk after the append is the collection's
//!    critical block, the per-collection serialization point.
//! 3. **GATHER**: for multi-collection transactions, the critical blocks'
//!    clusters nominate the supercluster peers that validate cross-cluster
//!    ordering.
//! 4. **PEND**: each collection's transforms are pended (policy `r`) with
//!    the new revision, the operations hash, the transaction envelope, and
//!    the nominees.
//! 5. **COMMIT**: each collection commits against its critical block.
//! 6. **CANCEL**: on any failure, every collection that reached PEND is
//!    compensated with a best-effort cancel before the error surfaces.
//!
//! There is no global sequencer: the only cross-collection serialization
//! point is the supercluster approval during PEND.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cluster::CoordinatedRepo;
use crate::collection::{Collection, CollectionActions, CollectionError};
use crate::engine::{operations_hash, EngineError, EngineRegistry};
use crate::transactor::{
    CancelRequest, CommitRequest, CommitResponse, PendPolicy, PendRequest, PendResponse, Transactor,
    TransactorError,
};
use crate::transform::{block_ids_for_transforms, Transforms};
use crate::types::{BlockId, CollectionId, PeerId, Rev, Stamp, Transaction};

#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("collection not found: {0}")]
    CollectionNotFound(CollectionId),

    #[error("no engine registered under id {0}")]
    UnknownEngine(String),

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("collection error: {0}")]
    Collection(#[from] CollectionError),

    #[error("pend failed for collection {collection_id}: {response:?}")]
    PendFailed { collection_id: CollectionId, response: PendResponse },

    #[error("commit failed for collection {collection_id}: {response:?}")]
    CommitFailed { collection_id: CollectionId, response: CommitResponse },

    #[error(transparent)]
    Transactor(#[from] TransactorError),
}

pub type Result<T> = std::result::Result<T, TransactionError>;

/// Peers authorized to validate cross-cluster ordering for a critical
/// block; provided by the cluster layer
#[async_trait]
pub trait SuperclusterNominator: Send + Sync {
    async fn nominees(&self, block_id: &BlockId) -> crate::transactor::Result<Vec<PeerId>>;
}

#[async_trait]
impl SuperclusterNominator for CoordinatedRepo {
    async fn nominees(&self, block_id: &BlockId) -> crate::transactor::Result<Vec<PeerId>> {
        self.gather_nominees(block_id).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionOutcome {
    pub collection_id: CollectionId,
    pub rev: Rev,
    pub block_ids: Vec<BlockId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionResult {
    pub transaction_id: String,
    pub outcomes: Vec<CollectionOutcome>,
}

/// One collection's share of the pipeline
struct PendPlan {
    collection_id: CollectionId,
    transforms: Transforms,
    rev: Rev,
    tail_id: BlockId,
    block_ids: Vec<BlockId>,
}

pub struct TransactionCoordinator {
    peer_id: PeerId,
    transactor: Arc<dyn Transactor>,
    engines: EngineRegistry,
    nominator: Option<Arc<dyn SuperclusterNominator>>,
    collections: HashMap<CollectionId, Collection>,
}

impl TransactionCoordinator {
    pub fn new(peer_id: impl Into<PeerId>, transactor: Arc<dyn Transactor>, engines: EngineRegistry) -> Self {
        Self {
            peer_id: peer_id.into(),
            transactor,
            engines,
            nominator: None,
            collections: HashMap::new(),
        }
    }

    pub fn with_nominator(mut self, nominator: Arc<dyn SuperclusterNominator>) -> Self {
        self.nominator = Some(nominator);
        self
    }

    /// Collections must be opened before a transaction can touch them
    pub fn open_collection(&mut self, collection_id: impl Into<CollectionId>) {
        let collection_id = collection_id.into();
        self.collections
            .entry(collection_id.clone())
            .or_insert_with(|| Collection::new(collection_id, Arc::clone(&self.transactor)));
    }

    pub fn collection_mut(&mut self, collection_id: &CollectionId) -> Option<&mut Collection> {
        self.collections.get_mut(collection_id)
    }

    /// Build a transaction stamped by this peer
    pub fn begin(&self, engine_id: impl Into<String>, schema_hash: impl Into<String>, statements: Vec<String>) -> Transaction {
        Transaction::new(Stamp::new(self.peer_id.clone(), engine_id, schema_hash), statements)
    }

    /// Discard every collection's buffered edits and recorded reads
    pub fn rollback(&mut self) {
        for collection in self.collections.values_mut() {
            if collection.is_dirty() {
                collection.rollback();
            }
        }
        debug!("↩️ Rolled back local transaction state");
    }

    /// Run a transaction through execute → log → GATHER → PEND → COMMIT
    pub async fn execute(&mut self, mut transaction: Transaction) -> Result<TransactionResult> {
        let engine = self
            .engines
            .get(&transaction.stamp.engine_id)
            .ok_or_else(|| TransactionError::UnknownEngine(transaction.stamp.engine_id.clone()))?;

        let actions = engine.execute(&transaction)?;
        if actions.is_empty() {
            // nothing executed: success without any network traffic
            return Ok(TransactionResult { transaction_id: transaction.id.clone(), outcomes: Vec::new() });
        }

        // Execute statements against each collection's snapshot
        let mut affected: Vec<CollectionId> = Vec::new();
        for collection_actions in &actions {
            let collection = self
                .collections
                .get_mut(&collection_actions.collection_id)
                .ok_or_else(|| TransactionError::CollectionNotFound(collection_actions.collection_id.clone()))?;
            for action in &collection_actions.actions {
                collection.act(action).await?;
            }
            if !affected.contains(&collection_actions.collection_id) {
                affected.push(collection_actions.collection_id.clone());
            }
        }

        let ops_hash = operations_hash(&actions);

        // Reads observed during execution pin the transaction id
        let mut reads: Vec<(BlockId, Rev)> = Vec::new();
        for collection_id in &affected {
            if let Some(collection) = self.collections.get(collection_id) {
                reads.extend(collection.take_reads());
            }
        }
        reads.sort();
        reads.dedup();
        transaction.finalize_reads(reads);

        // Per-collection log append; the tail after the append is the
        // collection's critical block
        let mut plans: Vec<PendPlan> = Vec::new();
        for collection_id in &affected {
            let collection = self
                .collections
                .get_mut(collection_id)
                .ok_or_else(|| TransactionError::CollectionNotFound(collection_id.clone()))?;
            let data_blocks = collection.touched_block_ids();
            let collection_slice: Vec<_> = actions
                .iter()
                .filter(|ca| &ca.collection_id == collection_id)
                .flat_map(|ca| ca.actions.clone())
                .collect();
            let append = collection
                .append_to_log(transaction.id.clone(), collection_slice, data_blocks, affected.clone())
                .await?;
            let transforms = collection.take_transforms();
            // log-chain reads happen after the id was pinned; they belong
            // to this transaction, not the next one's read set
            let _ = collection.take_reads();
            plans.push(PendPlan {
                collection_id: collection_id.clone(),
                transforms,
                rev: append.rev,
                tail_id: append.tail_id,
                block_ids: Vec::new(),
            });
        }

        // GATHER: supercluster nominees across the critical blocks
        let nominees = self.gather(&plans).await?;

        // PEND each collection; any failure compensates everything pended
        for index in 0..plans.len() {
            let request = PendRequest {
                action_id: transaction.id.clone(),
                transforms: plans[index].transforms.clone(),
                policy: PendPolicy::Return,
                rev: Some(plans[index].rev),
                operations_hash: Some(ops_hash.clone()),
                transaction: Some(transaction.clone()),
                supercluster_nominees: nominees.clone(),
            };
            match self.transactor.pend(request).await {
                Ok(PendResponse::Pended { block_ids, .. }) => {
                    plans[index].block_ids = block_ids;
                }
                Ok(failure) => {
                    self.compensate(&transaction.id, &plans[..=index]).await;
                    return Err(TransactionError::PendFailed {
                        collection_id: plans[index].collection_id.clone(),
                        response: failure,
                    });
                }
                Err(e) => {
                    self.compensate(&transaction.id, &plans[..=index]).await;
                    return Err(e.into());
                }
            }
        }

        // COMMIT each collection against its critical block
        for plan in &plans {
            let request = CommitRequest {
                action_id: transaction.id.clone(),
                block_ids: plan.block_ids.clone(),
                tail_id: plan.tail_id.clone(),
                rev: plan.rev,
            };
            match self.transactor.commit(request).await {
                Ok(CommitResponse::Committed) => {}
                Ok(failure) => {
                    self.compensate(&transaction.id, &plans).await;
                    return Err(TransactionError::CommitFailed {
                        collection_id: plan.collection_id.clone(),
                        response: failure,
                    });
                }
                Err(e) => {
                    self.compensate(&transaction.id, &plans).await;
                    return Err(e.into());
                }
            }
        }

        info!(
            "💾 Transaction {} committed across {} collection(s)",
            transaction.id,
            plans.len()
        );
        Ok(TransactionResult {
            transaction_id: transaction.id,
            outcomes: plans
                .into_iter()
                .map(|plan| CollectionOutcome {
                    collection_id: plan.collection_id,
                    rev: plan.rev,
                    block_ids: plan.block_ids,
                })
                .collect(),
        })
    }

    /// Single-collection transactions skip GATHER entirely
    async fn gather(&self, plans: &[PendPlan]) -> Result<Option<Vec<PeerId>>> {
        if plans.len() <= 1 {
            return Ok(None);
        }
        let Some(nominator) = &self.nominator else {
            return Ok(None);
        };
        let mut gathered: BTreeSet<PeerId> = BTreeSet::new();
        for plan in plans {
            gathered.extend(nominator.nominees(&plan.tail_id).await?);
        }
        debug!("🤝 Gathered {} supercluster nominee(s)", gathered.len());
        Ok(Some(gathered.into_iter().collect()))
    }

    /// Best-effort cancel for every collection that reached PEND; failures
    /// are logged, never raised
    async fn compensate(&self, action_id: &str, plans: &[PendPlan]) {
        for plan in plans {
            let block_ids: Vec<BlockId> = block_ids_for_transforms(&plan.transforms).into_iter().collect();
            let request = CancelRequest { action_id: action_id.to_string(), block_ids };
            if let Err(e) = self.transactor.cancel(request).await {
                warn!("Cancel for collection {} failed: {}", plan.collection_id, e);
            }
        }
        warn!("↩️ Compensated transaction {} across {} collection(s)", action_id, plans.len());
    }
}
