//! Core identifiers and shared primitives
//!
//! Every higher layer of tessera speaks in terms of the types defined here:
//! string block/action/collection/peer identifiers, per-block revision
//! numbers, the `(action, rev)` pairs that index committed state, and the
//! transaction envelope (`Stamp` + `Transaction`) that travels with every
//! pend request.
//!
//! ## Identifier derivation
//!
//! - Block ids are content-addressed at creation (see `block::Block::create`)
//!   and opaque strings afterward.
//! - Action ids are 16 cryptographically random bytes, base64url encoded
//!   without padding. Collision resistance is what makes them safe to use as
//!   keys in the pending/committed tables.
//! - Stamp ids are derived from `(peer_id, timestamp, engine_id, schema_hash)`
//!   so two peers never mint the same stamp.
//! - Transaction ids are a deterministic digest of
//!   `(stamp.id, statements, reads)`: the same statements observed against
//!   the same versions always produce the same id.
//!
//! All digests are SHA-256 over the canonical encoding (serde_json with
//! sorted map keys; all multi-value containers in tessera are BTree-based),
//! rendered as base58btc.

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub type BlockId = String;
pub type ActionId = String;
pub type CollectionId = String;
pub type PeerId = String;
pub type Rev = u64;

/// A committed `(actionId, rev)` pair, the canonical revision index entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevRef {
    pub action_id: ActionId,
    pub rev: Rev,
}

impl RevRef {
    pub fn new(action_id: impl Into<ActionId>, rev: Rev) -> Self {
        Self { action_id: action_id.into(), rev }
    }
}

/// Transaction provenance: who created it, when, and under which engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stamp {
    pub id: String,
    pub peer_id: PeerId,
    pub timestamp: u64,
    pub engine_id: String,
    pub schema_hash: String,
}

impl Stamp {
    /// Create a stamp for the given peer and engine, fixed at creation time
    pub fn new(peer_id: impl Into<PeerId>, engine_id: impl Into<String>, schema_hash: impl Into<String>) -> Self {
        let peer_id = peer_id.into();
        let engine_id = engine_id.into();
        let schema_hash = schema_hash.into();
        let timestamp = chrono::Utc::now().timestamp_millis() as u64;
        let id = canonical_digest(&(&peer_id, timestamp, &engine_id, &schema_hash));
        Self { id, peer_id, timestamp, engine_id, schema_hash }
    }
}

/// The unit submitted to the transaction coordinator
///
/// `reads` accumulates the `(blockId, rev)` versions observed while the
/// engine executed; `id` is recomputed whenever the reads change so it stays
/// a deterministic function of `(stamp.id, statements, reads)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub stamp: Stamp,
    pub statements: Vec<String>,
    pub reads: Vec<(BlockId, Rev)>,
    pub id: String,
}

impl Transaction {
    pub fn new(stamp: Stamp, statements: Vec<String>) -> Self {
        let id = derive_transaction_id(&stamp.id, &statements, &[]);
        Self { stamp, statements, reads: Vec::new(), id }
    }

    /// Record the observed reads and refresh the derived id
    pub fn finalize_reads(&mut self, reads: Vec<(BlockId, Rev)>) {
        self.reads = reads;
        self.id = derive_transaction_id(&self.stamp.id, &self.statements, &self.reads);
    }
}

fn derive_transaction_id(stamp_id: &str, statements: &[String], reads: &[(BlockId, Rev)]) -> String {
    canonical_digest(&(stamp_id, statements, reads))
}

/// SHA-256 over the canonical serde_json encoding, rendered as base58btc
pub fn canonical_digest<T: Serialize>(value: &T) -> String {
    let bytes = serde_json::to_vec(value).expect("canonical encoding cannot fail for tessera types");
    sha256_bs58(&bytes)
}

/// base58btc rendering of a SHA-256 digest over raw bytes
pub fn sha256_bs58(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    bs58::encode(digest).into_string()
}

/// Raw SHA-256 digest bytes
pub fn sha256_bytes(bytes: &[u8]) -> Vec<u8> {
    Sha256::digest(bytes).to_vec()
}

/// Fresh collision-resistant action id: 16 random bytes, base64url
pub fn new_action_id() -> ActionId {
    let raw: [u8; 16] = rand::random();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(raw)
}
