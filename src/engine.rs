//! Transaction engines
//!
//! An engine turns a transaction's opaque statements into per-collection
//! actions. Engines are values registered under version-pinned ids: a
//! coordinator only runs engines it was explicitly given. They must be
//! deterministic: the same statements against the same snapshot produce
//! the same actions on every peer, which is what lets validators confirm
//! the propagated operations hash independently.
//!
//! The built-in `JsonEngine` (id `json-actions/1`) interprets each
//! statement as a JSON-encoded `CollectionActions` document; it is the
//! reference engine and the one the tests drive.

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::collection::CollectionActions;
use crate::types::{canonical_digest, Transaction};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("statement {index} is invalid: {reason}")]
    InvalidStatement { index: usize, reason: String },
}

pub type Result<T> = std::result::Result<T, EngineError>;

pub trait TransactionEngine: Send + Sync {
    /// Version-pinned engine identifier; transactions name the engine
    /// that must interpret them
    fn engine_id(&self) -> &str;

    fn execute(&self, transaction: &Transaction) -> Result<Vec<CollectionActions>>;
}

/// Digest of the produced actions in canonical order; travels with every
/// pend so validating peers can recompute and confirm it
pub fn operations_hash(actions: &[CollectionActions]) -> String {
    canonical_digest(&actions)
}

pub const JSON_ENGINE_ID: &str = "json-actions/1";

/// Reference engine: statements are JSON `CollectionActions` documents
pub struct JsonEngine;

impl TransactionEngine for JsonEngine {
    fn engine_id(&self) -> &str {
        JSON_ENGINE_ID
    }

    fn execute(&self, transaction: &Transaction) -> Result<Vec<CollectionActions>> {
        let mut all = Vec::with_capacity(transaction.statements.len());
        for (index, statement) in transaction.statements.iter().enumerate() {
            let parsed: CollectionActions = serde_json::from_str(statement)
                .map_err(|e| EngineError::InvalidStatement { index, reason: e.to_string() })?;
            if parsed.collection_id.is_empty() {
                return Err(EngineError::InvalidStatement {
                    index,
                    reason: "collection_id must be a non-empty string".into(),
                });
            }
            if parsed.actions.is_empty() {
                return Err(EngineError::InvalidStatement {
                    index,
                    reason: "actions must be a non-empty array".into(),
                });
            }
            all.push(parsed);
        }
        Ok(all)
    }
}

/// Engines available to a coordinator, by id
#[derive(Default)]
pub struct EngineRegistry {
    engines: HashMap<String, Arc<dyn TransactionEngine>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in JSON engine
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(JsonEngine));
        registry
    }

    pub fn register(&mut self, engine: Arc<dyn TransactionEngine>) {
        self.engines.insert(engine.engine_id().to_string(), engine);
    }

    pub fn get(&self, engine_id: &str) -> Option<Arc<dyn TransactionEngine>> {
        self.engines.get(engine_id).cloned()
    }
}
