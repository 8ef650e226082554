//! Named per-block latches
//!
//! Every mutation of per-block state passes through here. Multi-block
//! operations acquire latches in lexicographically sorted id order and
//! release in reverse, which is what makes concurrent commits over
//! overlapping block sets deadlock-free.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;

use crate::types::BlockId;

#[derive(Default)]
pub struct LatchMap {
    latches: Mutex<HashMap<BlockId, Arc<tokio::sync::Mutex<()>>>>,
}

/// Held latches; dropping releases in reverse acquisition order
pub struct LatchGuards {
    guards: Vec<OwnedMutexGuard<()>>,
}

impl Drop for LatchGuards {
    fn drop(&mut self) {
        while let Some(guard) = self.guards.pop() {
            drop(guard);
        }
    }
}

impl LatchMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn latch_for(&self, block_id: &BlockId) -> Arc<tokio::sync::Mutex<()>> {
        let mut latches = self.latches.lock().unwrap();
        latches.entry(block_id.clone()).or_default().clone()
    }

    /// Acquire a single block's latch
    pub async fn acquire(&self, block_id: &BlockId) -> LatchGuards {
        let latch = self.latch_for(block_id);
        LatchGuards { guards: vec![latch.lock_owned().await] }
    }

    /// Acquire latches for every id, in sorted order
    pub async fn acquire_sorted(&self, block_ids: &BTreeSet<BlockId>) -> LatchGuards {
        let mut guards = Vec::with_capacity(block_ids.len());
        for block_id in block_ids {
            let latch = self.latch_for(block_id);
            guards.push(latch.lock_owned().await);
        }
        LatchGuards { guards }
    }
}
