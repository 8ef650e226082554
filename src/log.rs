//! Per-collection action log
//!
//! An append-only chain of fixed-capacity chunk blocks (32 entries each)
//! living in the block layer itself: the log's header and chunks are
//! ordinary blocks mutated through the collection's tracker, so log
//! appends ride in the same transforms (and the same consensus rounds)
//! as the data mutations they record.
//!
//! The header block has a stable derived id per collection and points at
//! the current tail chunk plus the latest log revision. When a tail chunk
//! fills up it is sealed: a successor chunk is allocated carrying the
//! deterministic hash of the sealed chunk's contents, forming a verifiable
//! hash chain back to the first chunk.
//!
//! Entries are either actions (what was committed, against which blocks)
//! or checkpoints (the set of actions still logically committed from the
//! application's view). `get_action_context` folds the latest checkpoint
//! with everything appended after it.

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::block::Block;
use crate::collection::CollectionAction;
use crate::tracker::{BlockSource, SourceError, Tracker};
use crate::transform::TransformOp;
use crate::types::{canonical_digest, ActionId, BlockId, CollectionId, Rev, RevRef};

/// Entries per chunk before a new chain block is allocated
pub const ENTRIES_PER_CHUNK: usize = 32;

#[derive(Error, Debug)]
pub enum LogError {
    #[error("source read failed: {0}")]
    Source(#[from] SourceError),

    #[error("log entry encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("log chain corrupt: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, LogError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionEntry {
    pub rev: Rev,
    pub action_id: ActionId,
    pub actions: Vec<CollectionAction>,
    pub block_ids: Vec<BlockId>,
    pub collection_ids: Vec<CollectionId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub rev: Rev,
    pub pendings: Vec<RevRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogEntry {
    Action(ActionEntry),
    Checkpoint(CheckpointEntry),
}

impl LogEntry {
    pub fn rev(&self) -> Rev {
        match self {
            LogEntry::Action(entry) => entry.rev,
            LogEntry::Checkpoint(entry) => entry.rev,
        }
    }
}

/// Result of one log append
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogAppend {
    /// The chunk the entry landed in; the collection's critical block
    pub tail_id: BlockId,
    pub rev: Rev,
}

/// The committed view the application acts on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionContext {
    pub committed: Vec<RevRef>,
    pub rev: Rev,
}

/// Stable derived header id for a collection's log
pub fn log_header_id(collection_id: &CollectionId) -> BlockId {
    canonical_digest(&("log-header", collection_id))
}

pub struct Log {
    collection_id: CollectionId,
    header_id: BlockId,
}

impl Log {
    pub fn new(collection_id: impl Into<CollectionId>) -> Self {
        let collection_id = collection_id.into();
        let header_id = log_header_id(&collection_id);
        Self { collection_id, header_id }
    }

    pub fn header_id(&self) -> &BlockId {
        &self.header_id
    }

    /// Ensure the header and first chunk exist in the tracker's view
    async fn ensure_open<S: BlockSource>(&self, tracker: &mut Tracker<S>) -> Result<(BlockId, Rev)> {
        if let Some(header) = tracker.try_get(&self.header_id).await? {
            let tail_id = scalar_string(&header, "tail")
                .ok_or_else(|| LogError::Corrupt("log header missing tail pointer".into()))?;
            let rev = scalar_u64(&header, "rev").unwrap_or(0);
            return Ok((tail_id, rev));
        }

        let chunk = Block::create("log-chunk", self.collection_id.clone(), [("entries".to_string(), vec![])].into());
        let chunk_id = chunk.id().clone();
        tracker.insert(chunk);

        let header = Block::with_id(
            self.header_id.clone(),
            "log-header",
            self.collection_id.clone(),
            [
                ("tail".to_string(), vec![json!(chunk_id.clone())]),
                ("rev".to_string(), vec![json!(0)]),
            ]
            .into(),
        );
        tracker.insert(header);
        Ok((chunk_id, 0))
    }

    /// Append an action entry at `priorRev + 1`
    pub async fn append<S: BlockSource>(
        &self,
        tracker: &mut Tracker<S>,
        action_id: ActionId,
        actions: Vec<CollectionAction>,
        block_ids: Vec<BlockId>,
        collection_ids: Vec<CollectionId>,
    ) -> Result<LogAppend> {
        let (_, prior_rev) = self.ensure_open(tracker).await?;
        let rev = prior_rev + 1;
        let entry = LogEntry::Action(ActionEntry { rev, action_id, actions, block_ids, collection_ids });
        let tail_id = self.push_entry(tracker, entry, rev).await?;
        Ok(LogAppend { tail_id, rev })
    }

    /// Record which actions remain logically committed, at the given rev
    pub async fn add_checkpoint<S: BlockSource>(
        &self,
        tracker: &mut Tracker<S>,
        pendings: Vec<RevRef>,
        rev: Rev,
    ) -> Result<LogAppend> {
        self.ensure_open(tracker).await?;
        let entry = LogEntry::Checkpoint(CheckpointEntry { rev, pendings });
        let tail_id = self.push_entry(tracker, entry, rev).await?;
        Ok(LogAppend { tail_id, rev })
    }

    async fn push_entry<S: BlockSource>(&self, tracker: &mut Tracker<S>, entry: LogEntry, rev: Rev) -> Result<BlockId> {
        let header = tracker
            .try_get(&self.header_id)
            .await?
            .ok_or_else(|| LogError::Corrupt("log header vanished".into()))?;
        let mut tail_id = scalar_string(&header, "tail")
            .ok_or_else(|| LogError::Corrupt("log header missing tail pointer".into()))?;

        let tail = tracker
            .try_get(&tail_id)
            .await?
            .ok_or_else(|| LogError::Corrupt(format!("log tail chunk {} missing", tail_id)))?;
        let mut entry_count = tail.attrs.get("entries").map(|values| values.len()).unwrap_or(0);

        if entry_count >= ENTRIES_PER_CHUNK {
            // seal the full chunk and chain a successor to it
            let prior_hash = canonical_digest(&tail);
            let successor = Block::create(
                "log-chunk",
                self.collection_id.clone(),
                [
                    ("entries".to_string(), vec![]),
                    ("prior_id".to_string(), vec![json!(tail_id.clone())]),
                    ("prior_hash".to_string(), vec![json!(prior_hash)]),
                ]
                .into(),
            );
            let successor_id = successor.id().clone();
            tracker.insert(successor);
            tracker.update(&self.header_id, TransformOp::assign("tail", json!(successor_id.clone())));
            tail_id = successor_id;
            entry_count = 0;
        }

        let encoded = serde_json::to_value(&entry)?;
        tracker.update(&tail_id, TransformOp::splice("entries", entry_count, 0, vec![encoded]));
        tracker.update(&self.header_id, TransformOp::assign("rev", json!(rev)));
        Ok(tail_id)
    }

    /// The current tail chunk id and latest log revision
    pub async fn state<S: BlockSource>(&self, tracker: &mut Tracker<S>) -> Result<(BlockId, Rev)> {
        self.ensure_open(tracker).await
    }

    fn parse_chunk(&self, block: &Block) -> Result<(Vec<LogEntry>, Option<BlockId>, Option<String>)> {
        let mut entries = Vec::new();
        if let Some(raw) = block.attrs.get("entries") {
            for value in raw {
                entries.push(serde_json::from_value(value.clone())?);
            }
        }
        Ok((entries, scalar_string(block, "prior_id"), scalar_string(block, "prior_hash")))
    }

    /// All entries in forward (ascending rev) order
    pub async fn entries<S: BlockSource>(&self, tracker: &mut Tracker<S>) -> Result<Vec<LogEntry>> {
        let (tail_id, _) = self.ensure_open(tracker).await?;
        let mut chunks_reversed: Vec<Vec<LogEntry>> = Vec::new();
        let mut cursor = Some(tail_id);

        while let Some(chunk_id) = cursor {
            let chunk = tracker
                .try_get(&chunk_id)
                .await?
                .ok_or_else(|| LogError::Corrupt(format!("log chunk {} missing", chunk_id)))?;
            let (entries, prior_id, _) = self.parse_chunk(&chunk)?;
            chunks_reversed.push(entries);
            cursor = prior_id;
        }

        Ok(chunks_reversed.into_iter().rev().flatten().collect())
    }

    /// Entries in reverse (descending rev) order
    pub async fn entries_reverse<S: BlockSource>(&self, tracker: &mut Tracker<S>) -> Result<Vec<LogEntry>> {
        let mut entries = self.entries(tracker).await?;
        entries.reverse();
        Ok(entries)
    }

    /// Exactly the entries with `rev > given`, in forward order
    pub async fn get_from<S: BlockSource>(&self, tracker: &mut Tracker<S>, rev: Rev) -> Result<Vec<LogEntry>> {
        Ok(self
            .entries(tracker)
            .await?
            .into_iter()
            .filter(|entry| entry.rev() > rev)
            .collect())
    }

    /// Latest checkpoint's pendings unioned with actions appended after it
    pub async fn get_action_context<S: BlockSource>(&self, tracker: &mut Tracker<S>) -> Result<ActionContext> {
        let (_, rev) = self.ensure_open(tracker).await?;
        let mut after_checkpoint: Vec<RevRef> = Vec::new();
        let mut committed: Vec<RevRef> = Vec::new();

        for entry in self.entries_reverse(tracker).await? {
            match entry {
                LogEntry::Action(action) => {
                    after_checkpoint.push(RevRef::new(action.action_id, action.rev));
                }
                LogEntry::Checkpoint(checkpoint) => {
                    committed = checkpoint.pendings;
                    break;
                }
            }
        }

        after_checkpoint.reverse();
        committed.extend(after_checkpoint);
        Ok(ActionContext { committed, rev })
    }

    /// Walk the chain and confirm every sealed chunk's recorded hash
    /// matches its predecessor's contents
    pub async fn verify_hash_chain<S: BlockSource>(&self, tracker: &mut Tracker<S>) -> Result<bool> {
        let (tail_id, _) = self.ensure_open(tracker).await?;
        let mut cursor = Some(tail_id);

        while let Some(chunk_id) = cursor {
            let chunk = tracker
                .try_get(&chunk_id)
                .await?
                .ok_or_else(|| LogError::Corrupt(format!("log chunk {} missing", chunk_id)))?;
            let (_, prior_id, prior_hash) = self.parse_chunk(&chunk)?;
            if let (Some(prior_id), Some(prior_hash)) = (&prior_id, &prior_hash) {
                let prior = tracker
                    .try_get(prior_id)
                    .await?
                    .ok_or_else(|| LogError::Corrupt(format!("log chunk {} missing", prior_id)))?;
                if canonical_digest(&prior) != *prior_hash {
                    return Ok(false);
                }
            }
            cursor = prior_id;
        }
        Ok(true)
    }
}

fn scalar_string(block: &Block, attribute: &str) -> Option<String> {
    block
        .scalar(attribute)
        .and_then(|value| value.as_str())
        .map(|s| s.to_string())
}

fn scalar_u64(block: &Block, attribute: &str) -> Option<u64> {
    block.scalar(attribute).and_then(|value| value.as_u64())
}
