//! Tracker: a buffered edit layer over a read-through block source
//!
//! A `Tracker` accumulates a `Transforms` buffer on top of any
//! `BlockSource`. Reads prefer the buffer: an inserted block is returned
//! with its pending updates applied regardless of source state, a deleted
//! id reads as absent, and source reads get pending updates layered on
//! before they are returned. `reset` atomically hands the buffer to the
//! caller and starts a fresh one; that is how a collection extracts the
//! transforms for an action.

use async_trait::async_trait;
use std::collections::BTreeSet;
use thiserror::Error;

use crate::block::Block;
use crate::transform::{apply, Transform, Transforms};
use crate::types::BlockId;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("source read failed: {0}")]
    Read(String),
}

/// Read-through seam under a tracker; implemented by the storage
/// repository locally and by the coordinated repository for remote blocks
#[async_trait]
pub trait BlockSource: Send + Sync {
    async fn try_get(&self, block_id: &BlockId) -> Result<Option<Block>, SourceError>;
}

pub struct Tracker<S: BlockSource> {
    source: S,
    transforms: Transforms,
}

impl<S: BlockSource> Tracker<S> {
    pub fn new(source: S) -> Self {
        Self { source, transforms: Transforms::default() }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Buffer a block insert; a prior buffered delete of the same id is
    /// fully retracted
    pub fn insert(&mut self, block: Block) {
        let id = block.id().clone();
        self.transforms.deletes.remove(&id);
        self.transforms.inserts.insert(id, block);
    }

    /// Append an update op to the block's buffered op list
    pub fn update(&mut self, block_id: &BlockId, op: crate::transform::TransformOp) {
        self.transforms.updates.entry(block_id.clone()).or_default().push(op);
    }

    /// Buffer a delete; prior buffered inserts and updates for the id are
    /// fully retracted
    pub fn delete(&mut self, block_id: &BlockId) {
        self.transforms.inserts.remove(block_id);
        self.transforms.updates.remove(block_id);
        self.transforms.deletes.insert(block_id.clone());
    }

    /// Buffered view of a block
    pub async fn try_get(&self, block_id: &BlockId) -> Result<Option<Block>, SourceError> {
        if self.transforms.deletes.contains(block_id) {
            return Ok(None);
        }

        let mut block = match self.transforms.inserts.get(block_id) {
            Some(inserted) => Some(inserted.clone()),
            None => self.source.try_get(block_id).await?,
        };

        if let Some(ref mut current) = block {
            if let Some(ops) = self.transforms.updates.get(block_id) {
                for op in ops {
                    apply(current, op);
                }
            }
        }

        Ok(block)
    }

    /// Atomically take the buffered transforms, leaving an empty buffer
    pub fn reset(&mut self) -> Transforms {
        std::mem::take(&mut self.transforms)
    }

    pub fn transforms(&self) -> &Transforms {
        &self.transforms
    }

    pub fn is_dirty(&self) -> bool {
        !self.transforms.is_empty()
    }

    /// Block ids touched by the buffer
    pub fn touched(&self) -> BTreeSet<BlockId> {
        crate::transform::block_ids_for_transforms(&self.transforms)
    }

    /// Project the buffer onto a single block id
    pub fn transform_for(&self, block_id: &BlockId) -> Transform {
        crate::transform::transform_for_block_id(&self.transforms, block_id)
    }
}
