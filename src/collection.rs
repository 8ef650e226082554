//! Collections: named groupings of blocks with a tracker and a log
//!
//! A collection owns the tracker buffering its in-flight edits and the
//! append-only log recording its committed actions. Engine actions are
//! applied through `act`, which routes inserts, updates, and deletes into
//! the tracker; the transaction coordinator later drains the buffered
//! transforms and drives them through the transactor.
//!
//! `TransactorSource` adapts any transactor into a `BlockSource` and
//! remembers the latest committed revision of every block it reads; that
//! record becomes the transaction's `reads`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::block::Block;
use crate::log::{ActionContext, Log, LogAppend, LogError};
use crate::tracker::{BlockSource, SourceError, Tracker};
use crate::transactor::{GetRequest, Transactor};
use crate::transform::{TransformOp, Transforms};
use crate::types::{ActionId, BlockId, CollectionId, Rev};

#[derive(Error, Debug)]
pub enum CollectionError {
    #[error("source read failed: {0}")]
    Source(#[from] SourceError),

    #[error("log error: {0}")]
    Log(#[from] LogError),

    #[error("block {block_id} belongs to collection {actual}, not {expected}")]
    WrongCollection { block_id: BlockId, expected: CollectionId, actual: CollectionId },
}

pub type Result<T> = std::result::Result<T, CollectionError>;

/// The engine-facing action vocabulary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum CollectionAction {
    Insert { block: Block },
    Update { block_id: BlockId, ops: Vec<TransformOp> },
    Delete { block_id: BlockId },
}

/// One collection's slice of a transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionActions {
    pub collection_id: CollectionId,
    pub actions: Vec<CollectionAction>,
}

/// `BlockSource` over a transactor, recording observed `(block, rev)` reads
pub struct TransactorSource {
    transactor: Arc<dyn Transactor>,
    reads: Mutex<BTreeMap<BlockId, Rev>>,
}

impl TransactorSource {
    pub fn new(transactor: Arc<dyn Transactor>) -> Self {
        Self { transactor, reads: Mutex::new(BTreeMap::new()) }
    }

    /// Drain the recorded reads
    pub fn take_reads(&self) -> Vec<(BlockId, Rev)> {
        let mut reads = self.reads.lock().unwrap();
        std::mem::take(&mut *reads).into_iter().collect()
    }
}

#[async_trait]
impl BlockSource for TransactorSource {
    async fn try_get(&self, block_id: &BlockId) -> std::result::Result<Option<Block>, SourceError> {
        let response = self
            .transactor
            .get(GetRequest { block_ids: vec![block_id.clone()], context: None })
            .await
            .map_err(|e| SourceError::Read(e.to_string()))?;

        match response.get(block_id) {
            Some(entry) => {
                if let Some(latest) = &entry.state.latest {
                    self.reads.lock().unwrap().insert(block_id.clone(), latest.rev);
                }
                Ok(entry.block.clone())
            }
            None => Ok(None),
        }
    }
}

pub struct Collection {
    collection_id: CollectionId,
    tracker: Tracker<TransactorSource>,
    log: Log,
}

impl Collection {
    pub fn new(collection_id: impl Into<CollectionId>, transactor: Arc<dyn Transactor>) -> Self {
        let collection_id = collection_id.into();
        Self {
            collection_id: collection_id.clone(),
            tracker: Tracker::new(TransactorSource::new(transactor)),
            log: Log::new(collection_id),
        }
    }

    pub fn collection_id(&self) -> &CollectionId {
        &self.collection_id
    }

    /// Apply one engine action to the local snapshot
    pub async fn act(&mut self, action: &CollectionAction) -> Result<()> {
        match action {
            CollectionAction::Insert { block } => {
                if block.header.collection_id != self.collection_id {
                    return Err(CollectionError::WrongCollection {
                        block_id: block.id().clone(),
                        expected: self.collection_id.clone(),
                        actual: block.header.collection_id.clone(),
                    });
                }
                self.tracker.insert(block.clone());
            }
            CollectionAction::Update { block_id, ops } => {
                // surface the read so it lands in the transaction's reads
                let _ = self.tracker.try_get(block_id).await?;
                for op in ops {
                    self.tracker.update(block_id, op.clone());
                }
            }
            CollectionAction::Delete { block_id } => {
                let _ = self.tracker.try_get(block_id).await?;
                self.tracker.delete(block_id);
            }
        }
        Ok(())
    }

    /// Buffered view of a block in this collection
    pub async fn try_get(&self, block_id: &BlockId) -> Result<Option<Block>> {
        Ok(self.tracker.try_get(block_id).await?)
    }

    /// Block ids touched by the buffered edits (before any log append)
    pub fn touched_block_ids(&self) -> Vec<BlockId> {
        self.tracker.touched().into_iter().collect()
    }

    /// Record the action in the log; the append mutates the log chain
    /// blocks through the same tracker
    pub async fn append_to_log(
        &mut self,
        action_id: ActionId,
        actions: Vec<CollectionAction>,
        block_ids: Vec<BlockId>,
        collection_ids: Vec<CollectionId>,
    ) -> Result<LogAppend> {
        Ok(self
            .log
            .append(&mut self.tracker, action_id, actions, block_ids, collection_ids)
            .await?)
    }

    pub async fn add_checkpoint(&mut self, pendings: Vec<crate::types::RevRef>, rev: Rev) -> Result<LogAppend> {
        Ok(self.log.add_checkpoint(&mut self.tracker, pendings, rev).await?)
    }

    pub async fn get_action_context(&mut self) -> Result<ActionContext> {
        Ok(self.log.get_action_context(&mut self.tracker).await?)
    }

    pub async fn log_entries(&mut self) -> Result<Vec<crate::log::LogEntry>> {
        Ok(self.log.entries(&mut self.tracker).await?)
    }

    /// Drain the buffered transforms for pend/commit
    pub fn take_transforms(&mut self) -> Transforms {
        self.tracker.reset()
    }

    /// Drain the reads observed while executing
    pub fn take_reads(&self) -> Vec<(BlockId, Rev)> {
        self.tracker.source().take_reads()
    }

    pub fn is_dirty(&self) -> bool {
        self.tracker.is_dirty()
    }

    /// Discard all buffered edits
    pub fn rollback(&mut self) {
        let _ = self.tracker.reset();
        let _ = self.tracker.source().take_reads();
    }
}
