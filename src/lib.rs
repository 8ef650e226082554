//! # Tessera: Peer-to-Peer Transactional Block Storage
//!
//! Tessera is a transactional storage engine over content-addressed,
//! versioned immutable blocks distributed across independent clusters of
//! peers. Logical structures are built on the block layer and mutated only
//! through a distributed transaction pipeline with cluster-based
//! consensus.
//!
//! ## Layers
//!
//! - [`types`], [`block`]: identifiers, the transaction envelope, and
//!   content-addressed blocks
//! - [`transform`]: per-block edit descriptors and their composition
//! - [`tracker`]: buffered edits over a read-through block source
//! - [`storage`]: sled-backed per-block state and the authoritative
//!   transactor implementation
//! - [`cluster`]: two-phase promise/commit consensus across the peers
//!   responsible for a block
//! - [`log`], [`collection`]: per-collection append-only action logs and
//!   the collection snapshot they describe
//! - [`engine`], [`transaction`]: statement interpretation and
//!   multi-collection transaction orchestration
//!
//! The peer transport, DHT routing, and network size estimation are
//! consumed through traits; `cluster::InProcessNetwork` is the in-process
//! reference implementation used by the single-peer binary and the tests.

pub mod block;
pub mod cluster;
pub mod collection;
pub mod config;
pub mod engine;
pub mod log;
pub mod logging;
pub mod storage;
pub mod tracker;
pub mod transaction;
pub mod transactor;
pub mod transform;
pub mod types;

pub use block::{Block, BlockHeader};
pub use collection::{Collection, CollectionAction, CollectionActions};
pub use engine::{EngineRegistry, JsonEngine, TransactionEngine, JSON_ENGINE_ID};
pub use tracker::{BlockSource, Tracker};
pub use transaction::{TransactionCoordinator, TransactionError, TransactionResult};
pub use transactor::{PendPolicy, PendResponse, Transactor};
pub use transform::{Transform, TransformOp, Transforms};
pub use types::{ActionId, BlockId, CollectionId, PeerId, Rev, RevRef, Stamp, Transaction};
