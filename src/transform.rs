//! Transform algebra: per-block edit descriptors and their composition
//!
//! A `Transform` describes one block's pending edit: materialize a new
//! block (`insert`), remove it (`delete`), or splice attribute arrays
//! (`updates`). `Transforms` is the multi-block edit set carried by an
//! action: inserts, updates, and deletes keyed by block id.
//!
//! ## Composition contracts
//!
//! Composition is deterministic and loud about conflicts:
//! - update lists for the same block concatenate in composition order;
//!   neither side is ever dropped
//! - two inserts for the same id must be value-equal, otherwise
//!   composition fails with `ConflictingInsert`
//! - deletes deduplicate (a set), and an insert colliding with a delete
//!   fails with `ConflictingInsertDelete`
//!
//! Applying the empty transform is the identity, and for any block `b`:
//! `apply_transform(apply_transform(b, t1), t2) == apply_transform(b, concat(t1, t2))`
//! whenever the concatenation succeeds.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

use crate::block::Block;
use crate::types::BlockId;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TransformError {
    #[error("conflicting inserts for block {0}")]
    ConflictingInsert(BlockId),

    #[error("insert and delete composed for block {0}")]
    ConflictingInsertDelete(BlockId),
}

pub type Result<T> = std::result::Result<T, TransformError>;

/// Splice one attribute array: from `index`, remove `delete_count`
/// elements, then insert `inserts` in order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformOp {
    pub attribute: String,
    pub index: usize,
    pub delete_count: usize,
    pub inserts: Vec<Value>,
}

impl TransformOp {
    pub fn splice(attribute: impl Into<String>, index: usize, delete_count: usize, inserts: Vec<Value>) -> Self {
        Self { attribute: attribute.into(), index, delete_count, inserts }
    }

    /// Scalar assignment: replace the single-element array wholesale
    pub fn assign(attribute: impl Into<String>, value: Value) -> Self {
        Self { attribute: attribute.into(), index: 0, delete_count: 1, inserts: vec![value] }
    }
}

/// A single block's edit view: created, deleted, or spliced
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insert: Option<Block>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub updates: Vec<TransformOp>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub delete: bool,
}

impl Transform {
    pub fn inserting(block: Block) -> Self {
        Self { insert: Some(block), ..Default::default() }
    }

    pub fn deleting() -> Self {
        Self { delete: true, ..Default::default() }
    }

    pub fn updating(updates: Vec<TransformOp>) -> Self {
        Self { updates, ..Default::default() }
    }

    pub fn is_empty(&self) -> bool {
        self.insert.is_none() && self.updates.is_empty() && !self.delete
    }
}

/// Multi-block edit set: the payload of an action
///
/// BTree containers keep the canonical encoding deterministic (sorted keys),
/// which the message hashing in the cluster layer depends on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transforms {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inserts: BTreeMap<BlockId, Block>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub updates: BTreeMap<BlockId, Vec<TransformOp>>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub deletes: BTreeSet<BlockId>,
}

impl Transforms {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }
}

/// Mutate `block` in place according to `op`
///
/// Splice bounds are clamped to the current array length; a missing
/// attribute starts as an empty array.
pub fn apply(block: &mut Block, op: &TransformOp) {
    let values = block.attrs.entry(op.attribute.clone()).or_default();
    let start = op.index.min(values.len());
    let end = (op.index + op.delete_count).min(values.len());
    values.splice(start..end, op.inserts.iter().cloned());
}

/// Return a new block with `op` applied; the original is preserved
pub fn with_operation(block: &Block, op: &TransformOp) -> Block {
    let mut next = block.clone();
    apply(&mut next, op);
    next
}

/// Apply a full per-block transform
///
/// `None` means the block does not exist after the transform (deleted, or
/// absent with nothing inserted). An insert carrying updates yields the
/// inserted block with the updates layered on top (the block was created
/// then mutated within the same action).
pub fn apply_transform(block: Option<&Block>, transform: &Transform) -> Option<Block> {
    if transform.delete {
        return None;
    }
    let mut current = match &transform.insert {
        Some(inserted) => inserted.clone(),
        None => block?.clone(),
    };
    for op in &transform.updates {
        apply(&mut current, op);
    }
    Some(current)
}

/// Project the multi-block transform onto a single block's view
pub fn transform_for_block_id(transforms: &Transforms, block_id: &BlockId) -> Transform {
    Transform {
        insert: transforms.inserts.get(block_id).cloned(),
        updates: transforms.updates.get(block_id).cloned().unwrap_or_default(),
        delete: transforms.deletes.contains(block_id),
    }
}

/// Union of all block ids mentioned anywhere in the transform set
pub fn block_ids_for_transforms(transforms: &Transforms) -> BTreeSet<BlockId> {
    let mut ids: BTreeSet<BlockId> = transforms.inserts.keys().cloned().collect();
    ids.extend(transforms.updates.keys().cloned());
    ids.extend(transforms.deletes.iter().cloned());
    ids
}

/// Fold one block's transform into an existing multi-block set
///
/// Update ops append; an insert only lands in an empty slot (equal inserts
/// are tolerated, diverging ones are a caller bug surfaced as
/// `ConflictingInsert`); deletes deduplicate. Insert/delete collisions fail.
pub fn concat_transform(target: &mut Transforms, block_id: &BlockId, transform: Transform) -> Result<()> {
    if let Some(inserted) = transform.insert {
        if target.deletes.contains(block_id) {
            return Err(TransformError::ConflictingInsertDelete(block_id.clone()));
        }
        match target.inserts.get(block_id) {
            None => {
                target.inserts.insert(block_id.clone(), inserted);
            }
            Some(existing) if *existing == inserted => {}
            Some(_) => return Err(TransformError::ConflictingInsert(block_id.clone())),
        }
    }

    if transform.delete {
        if target.inserts.contains_key(block_id) {
            return Err(TransformError::ConflictingInsertDelete(block_id.clone()));
        }
        target.deletes.insert(block_id.clone());
    }

    if !transform.updates.is_empty() {
        target
            .updates
            .entry(block_id.clone())
            .or_default()
            .extend(transform.updates);
    }

    Ok(())
}

/// Compose two multi-block transform sets, `a` then `b`
pub fn merge_transforms(a: &Transforms, b: &Transforms) -> Result<Transforms> {
    let mut merged = a.clone();
    for block_id in block_ids_for_transforms(b) {
        let projected = transform_for_block_id(b, &block_id);
        concat_transform(&mut merged, &block_id, projected)?;
    }
    Ok(merged)
}

/// Compose any number of transform sets in order
pub fn concat_transforms<I>(sets: I) -> Result<Transforms>
where
    I: IntoIterator<Item = Transforms>,
{
    let mut merged = Transforms::default();
    for set in sets {
        merged = merge_transforms(&merged, &set)?;
    }
    Ok(merged)
}
