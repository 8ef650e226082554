//! Storage Layer
//!
//! Everything a single peer persists lives here: per-block revision
//! chains, pending and committed action tables, and materialized block
//! snapshots, all under sled with crash-safe write ordering.
//!
//! ## Components
//!
//! ### Block store (`block_store.rs`)
//! The sled-backed per-block state: metadata (latest pointer plus
//! locally-held revision ranges), the revision→action index, pending and
//! committed transform tables, and cached materializations. Rebuilds any
//! revision by walking back to a materialization and replaying transforms
//! forward; restores missing ranges through the peer layer's archive
//! callback.
//!
//! ### Latches (`latch.rs`)
//! Named per-block async mutexes. Multi-block critical sections acquire
//! in sorted id order and release in reverse.
//!
//! ### Repository (`repository.rs`)
//! The authoritative transactor implementation: conflict-checked `pend`,
//! crash-ordered `commit`, idempotent `cancel`, and context-aware `get`
//! with missing-action catch-up.
//!
//! ## Commit write ordering
//!
//! ```text
//! materialization → revision index → promote pending → latest pointer
//! ```
//!
//! The latest pointer moves last, so a crash mid-commit leaves the block
//! readable at its previous revision and the retried commit simply
//! overwrites the orphaned writes.

pub mod block_store;
pub mod latch;
pub mod repository;

pub use block_store::{BlockArchive, BlockMetadata, BlockRestorer, BlockStore, RevRange, StorageError};
pub use latch::LatchMap;
pub use repository::{PendValidator, StorageRepo};
