//! Block storage: per-block revision chains on sled
//!
//! Persistent state for every block a peer stores, kept in five logical
//! sled trees (the key layout mirrors the persisted-state contract):
//!
//! - `metadata`:  `block_id` → `{ latest?, ranges }`
//! - `revisions`: `block_id/rev` → action id (zero-padded rev keys so the
//!   lexicographic order is the numeric order)
//! - `pending`:   `block_id/action_id` → transform awaiting commit
//! - `actions`:   `block_id/action_id` → committed transform
//! - `blocks`:    `block_id/action_id` → materialized block at that commit
//!
//! All values are serde_json encoded. The database flushes every 100ms and
//! must be closed through `close()` on shutdown so the final flush lands.
//!
//! ## Materialization
//!
//! `get_block` walks the revision index backward from the target revision
//! until it finds a materialization, then replays the intervening committed
//! transforms forward and caches the rebuilt block at the most recent
//! action visited. A block whose entire local history lacks a
//! materialization is corrupt (`MaterializationMissing`).
//!
//! ## Restoration
//!
//! Revisions outside the locally-held ranges are fetched through the
//! `BlockRestorer` callback (provided by the peer layer). An archive is
//! applied atomically (transforms, materializations, and revision index
//! first, then the merged range list) under the caller's block latch.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::block::Block;
use crate::transform::{apply_transform, Transform};
use crate::types::{ActionId, BlockId, Rev, RevRef};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("sled database error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("no materialization in the history of block {block_id} at or below rev {rev}")]
    MaterializationMissing { block_id: BlockId, rev: Rev },

    #[error("revision {rev} of block {block_id} is not available locally and could not be restored")]
    RevisionUnavailable { block_id: BlockId, rev: Rev },

    #[error("no pending action {action_id} on block {block_id}")]
    PendingMissing { block_id: BlockId, action_id: ActionId },

    #[error("restore failed: {0}")]
    Restore(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// An inclusive revision range held locally; `end == None` means the range
/// extends through the latest committed revision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevRange {
    pub start: Rev,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<Rev>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest: Option<RevRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ranges: Vec<RevRange>,
}

/// Everything needed to restore a span of a block's history
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockArchive {
    pub transforms: BTreeMap<ActionId, Transform>,
    pub materializations: BTreeMap<ActionId, Block>,
    pub revisions: BTreeMap<Rev, ActionId>,
}

/// Peer-layer callback that fetches missing revision ranges
#[async_trait]
pub trait BlockRestorer: Send + Sync {
    async fn restore(&self, block_id: &BlockId, rev: Rev) -> Result<Option<BlockArchive>>;
}

pub struct BlockStore {
    db: std::sync::Mutex<Option<sled::Db>>,
    metadata: sled::Tree,
    revisions: sled::Tree,
    pending: sled::Tree,
    actions: sled::Tree,
    blocks: sled::Tree,
    restorer: Option<Arc<dyn BlockRestorer>>,
}

fn rev_key(block_id: &BlockId, rev: Rev) -> String {
    // zero-padded so lexicographic order equals numeric order
    format!("{block_id}/{rev:020}")
}

fn action_key(block_id: &BlockId, action_id: &ActionId) -> String {
    format!("{block_id}/{action_id}")
}

impl BlockStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = sled::Config::new()
            .path(path)
            .flush_every_ms(Some(100))
            .cache_capacity(64 * 1024 * 1024)
            .mode(sled::Mode::HighThroughput);

        let db = config.open()?;
        let metadata = db.open_tree("metadata")?;
        let revisions = db.open_tree("revisions")?;
        let pending = db.open_tree("pending")?;
        let actions = db.open_tree("actions")?;
        let blocks = db.open_tree("blocks")?;

        Ok(Self {
            db: std::sync::Mutex::new(Some(db)),
            metadata,
            revisions,
            pending,
            actions,
            blocks,
            restorer: None,
        })
    }

    pub fn with_restorer(mut self, restorer: Arc<dyn BlockRestorer>) -> Self {
        self.restorer = Some(restorer);
        self
    }

    /// Flush and close the database, ensuring all pending writes are persisted
    pub async fn close(&self) -> Result<()> {
        info!("Flushing block store to disk...");
        let db = {
            let mut db_guard = self.db.lock().unwrap();
            db_guard.take()
        };
        if let Some(db) = db {
            db.flush_async().await?;
            info!("✅ Block store flushed");
        }
        Ok(())
    }

    // --- metadata ---

    pub fn get_metadata(&self, block_id: &BlockId) -> Result<BlockMetadata> {
        match self.metadata.get(block_id.as_bytes())? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(BlockMetadata::default()),
        }
    }

    fn put_metadata(&self, block_id: &BlockId, metadata: &BlockMetadata) -> Result<()> {
        self.metadata.insert(block_id.as_bytes(), serde_json::to_vec(metadata)?)?;
        Ok(())
    }

    pub fn get_latest(&self, block_id: &BlockId) -> Result<Option<RevRef>> {
        Ok(self.get_metadata(block_id)?.latest)
    }

    /// Advance the latest pointer; the covering range is extended to
    /// include the new revision
    pub fn set_latest(&self, block_id: &BlockId, latest: RevRef) -> Result<()> {
        let mut metadata = self.get_metadata(block_id)?;
        extend_ranges(&mut metadata.ranges, latest.rev);
        metadata.latest = Some(latest);
        self.put_metadata(block_id, &metadata)
    }

    // --- revision index ---

    pub fn save_revision(&self, block_id: &BlockId, rev: Rev, action_id: &ActionId) -> Result<()> {
        self.revisions.insert(rev_key(block_id, rev).as_bytes(), action_id.as_bytes())?;
        Ok(())
    }

    pub fn revision_action(&self, block_id: &BlockId, rev: Rev) -> Result<Option<ActionId>> {
        Ok(self
            .revisions
            .get(rev_key(block_id, rev).as_bytes())?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    /// Locally-present revisions between `start` and `end` inclusive,
    /// ascending when `start <= end`, descending otherwise
    pub fn list_revisions(&self, block_id: &BlockId, start: Rev, end: Rev) -> Result<Vec<RevRef>> {
        let (lo, hi) = if start <= end { (start, end) } else { (end, start) };
        let from = rev_key(block_id, lo);
        let to = rev_key(block_id, hi + 1);

        let mut found = Vec::new();
        for item in self.revisions.range(from.as_bytes()..to.as_bytes()) {
            let (key, value) = item?;
            let key = String::from_utf8_lossy(&key);
            let rev: Rev = key
                .rsplit('/')
                .next()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            found.push(RevRef::new(String::from_utf8_lossy(&value).into_owned(), rev));
        }
        if start > end {
            found.reverse();
        }
        Ok(found)
    }

    // --- pending / committed actions ---

    pub fn save_pending_transaction(&self, block_id: &BlockId, action_id: &ActionId, transform: &Transform) -> Result<()> {
        self.pending
            .insert(action_key(block_id, action_id).as_bytes(), serde_json::to_vec(transform)?)?;
        Ok(())
    }

    pub fn get_pending_transaction(&self, block_id: &BlockId, action_id: &ActionId) -> Result<Option<Transform>> {
        match self.pending.get(action_key(block_id, action_id).as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Idempotent: removing an absent pending entry is a no-op
    pub fn delete_pending_transaction(&self, block_id: &BlockId, action_id: &ActionId) -> Result<()> {
        self.pending.remove(action_key(block_id, action_id).as_bytes())?;
        Ok(())
    }

    pub fn list_pending_transactions(&self, block_id: &BlockId) -> Result<Vec<(ActionId, Transform)>> {
        let prefix = format!("{block_id}/");
        let mut pendings = Vec::new();
        for item in self.pending.scan_prefix(prefix.as_bytes()) {
            let (key, value) = item?;
            let key = String::from_utf8_lossy(&key);
            let action_id = key[prefix.len()..].to_string();
            pendings.push((action_id, serde_json::from_slice(&value)?));
        }
        Ok(pendings)
    }

    /// Move an action from the pending table to the committed table
    pub fn promote_pending_transaction(&self, block_id: &BlockId, action_id: &ActionId) -> Result<()> {
        let key = action_key(block_id, action_id);
        let transform = self.pending.remove(key.as_bytes())?.ok_or_else(|| StorageError::PendingMissing {
            block_id: block_id.clone(),
            action_id: action_id.clone(),
        })?;
        self.actions.insert(key.as_bytes(), transform)?;
        Ok(())
    }

    pub fn get_transaction(&self, block_id: &BlockId, action_id: &ActionId) -> Result<Option<Transform>> {
        match self.actions.get(action_key(block_id, action_id).as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Every pending entry in the store, for startup recovery reporting
    pub fn list_all_pendings(&self) -> Result<Vec<(BlockId, ActionId)>> {
        let mut pendings = Vec::new();
        for item in self.pending.iter() {
            let (key, _) = item?;
            let key = String::from_utf8_lossy(&key);
            if let Some((block_id, action_id)) = key.rsplit_once('/') {
                pendings.push((block_id.to_string(), action_id.to_string()));
            }
        }
        Ok(pendings)
    }

    // --- materializations ---

    pub fn save_materialized_block(&self, block_id: &BlockId, action_id: &ActionId, block: &Block) -> Result<()> {
        self.blocks
            .insert(action_key(block_id, action_id).as_bytes(), serde_json::to_vec(block)?)?;
        Ok(())
    }

    pub fn get_materialized_block(&self, block_id: &BlockId, action_id: &ActionId) -> Result<Option<Block>> {
        match self.blocks.get(action_key(block_id, action_id).as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    // --- reads ---

    /// Materialize the block at `rev` (latest when omitted)
    ///
    /// Restores the revision from the peer layer first when it falls
    /// outside the locally-held ranges. Returns `None` for a block with no
    /// committed history, or whose state at the revision is deleted.
    pub async fn get_block(&self, block_id: &BlockId, rev: Option<Rev>) -> Result<Option<Block>> {
        let metadata = self.get_metadata(block_id)?;
        let latest = match &metadata.latest {
            Some(latest) => latest.clone(),
            None => return Ok(None),
        };
        let target_rev = rev.unwrap_or(latest.rev);

        self.ensure_revision(block_id, target_rev, &metadata).await?;
        self.materialize(block_id, target_rev)
    }

    async fn ensure_revision(&self, block_id: &BlockId, rev: Rev, metadata: &BlockMetadata) -> Result<()> {
        if ranges_contain(&metadata.ranges, rev) {
            return Ok(());
        }
        let restorer = self.restorer.as_ref().ok_or_else(|| StorageError::RevisionUnavailable {
            block_id: block_id.clone(),
            rev,
        })?;
        debug!("📦 Restoring block {} rev {}", block_id, rev);
        let archive = restorer
            .restore(block_id, rev)
            .await?
            .ok_or_else(|| StorageError::RevisionUnavailable { block_id: block_id.clone(), rev })?;
        self.apply_archive(block_id, archive)
    }

    /// Write an archive's contents, then extend and merge the range list
    pub fn apply_archive(&self, block_id: &BlockId, archive: BlockArchive) -> Result<()> {
        for (action_id, transform) in &archive.transforms {
            self.actions
                .insert(action_key(block_id, action_id).as_bytes(), serde_json::to_vec(transform)?)?;
        }
        for (action_id, block) in &archive.materializations {
            self.save_materialized_block(block_id, action_id, block)?;
        }
        let mut metadata = self.get_metadata(block_id)?;
        for (rev, action_id) in &archive.revisions {
            self.save_revision(block_id, *rev, action_id)?;
            extend_ranges(&mut metadata.ranges, *rev);
            let advance = metadata.latest.as_ref().map(|l| l.rev < *rev).unwrap_or(true);
            if advance {
                metadata.latest = Some(RevRef::new(action_id.clone(), *rev));
            }
        }
        self.put_metadata(block_id, &metadata)
    }

    fn materialize(&self, block_id: &BlockId, target_rev: Rev) -> Result<Option<Block>> {
        // Walk backward until a materialization is found
        let walk = self.list_revisions(block_id, target_rev, 0)?;
        if walk.is_empty() {
            return Err(StorageError::RevisionUnavailable { block_id: block_id.clone(), rev: target_rev });
        }

        let mut replay: Vec<ActionId> = Vec::new();
        let mut base: Option<Block> = None;
        let mut found = false;
        for rev_ref in &walk {
            if let Some(block) = self.get_materialized_block(block_id, &rev_ref.action_id)? {
                base = Some(block);
                found = true;
                break;
            }
            replay.push(rev_ref.action_id.clone());
        }
        if !found {
            // every block that ever existed carries at least one
            // materialization; walking off the known history is corruption
            let earliest = replay.last().cloned().unwrap_or_default();
            let rebuildable = self
                .get_transaction(block_id, &earliest)?
                .map(|transform| transform.insert.is_some())
                .unwrap_or(false);
            if !rebuildable {
                return Err(StorageError::MaterializationMissing { block_id: block_id.clone(), rev: target_rev });
            }
        }

        // Replay the intervening transforms in forward order
        let mut current = base;
        for action_id in replay.iter().rev() {
            let transform = self
                .get_transaction(block_id, action_id)?
                .ok_or_else(|| StorageError::MaterializationMissing { block_id: block_id.clone(), rev: target_rev })?;
            current = apply_transform(current.as_ref(), &transform);
        }

        // Cache at the most recent action visited
        if let (Some(block), Some(newest)) = (&current, walk.first()) {
            self.save_materialized_block(block_id, &newest.action_id, block)?;
        }

        Ok(current)
    }
}

fn ranges_contain(ranges: &[RevRange], rev: Rev) -> bool {
    ranges
        .iter()
        .any(|range| rev >= range.start && range.end.map(|end| rev <= end).unwrap_or(true))
}

/// Grow the range list to cover `rev`, merging adjacent/overlapping ranges
fn extend_ranges(ranges: &mut Vec<RevRange>, rev: Rev) {
    ranges.push(RevRange { start: rev, end: Some(rev) });
    ranges.sort_by_key(|range| range.start);
    let mut merged: Vec<RevRange> = Vec::with_capacity(ranges.len());
    for range in ranges.drain(..) {
        match merged.last_mut() {
            Some(last) => {
                let last_end = last.end.unwrap_or(Rev::MAX);
                if last_end == Rev::MAX || range.start <= last_end.saturating_add(1) {
                    let range_end = range.end.unwrap_or(Rev::MAX);
                    if range_end > last_end {
                        last.end = range.end;
                    }
                } else {
                    merged.push(range);
                }
            }
            None => merged.push(range),
        }
    }
    *ranges = merged;
}
