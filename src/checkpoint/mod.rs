// src/checkpoint/mod.rs

//! Checkpoint manager: durable snapshots of a run for resume.

pub mod file;
pub mod record;
pub mod store;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, warn};

use crate::errors::PersistenceError;
use crate::types::ThreadId;

pub use file::FileCheckpointStore;
pub use record::Checkpoint;
pub use store::{CheckpointStore, InMemoryCheckpointStore};

/// Default number of checkpoints retained per thread.
pub const DEFAULT_KEEP: usize = 2;

/// Serializes checkpoint writes and enforces per-thread monotonicity.
///
/// All writes of all threads pass through one lock; there is therefore a
/// single writer per thread at any time.
#[derive(Debug)]
pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
    keep: usize,
    last: Mutex<HashMap<ThreadId, u64>>,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            store,
            keep: DEFAULT_KEEP,
            last: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_keep(mut self, keep: usize) -> Self {
        self.keep = keep.max(1);
        self
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    /// Persist `checkpoint`. Returns only once the store reports it durable.
    ///
    /// Superseded checkpoints are pruned afterwards; a failed prune is
    /// logged and does not fail the save.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<(), PersistenceError> {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        let thread = &checkpoint.thread_id;

        if let Some(&prev) = last.get(thread) {
            if checkpoint.sequence <= prev {
                return Err(PersistenceError::NonMonotonic {
                    thread: thread.clone(),
                    last: prev,
                    attempted: checkpoint.sequence,
                });
            }
        }

        self.store.save(checkpoint)?;
        last.insert(thread.clone(), checkpoint.sequence);
        debug!(
            thread = %thread,
            seq = checkpoint.sequence,
            phase = %checkpoint.phase,
            "checkpoint saved"
        );

        match self.store.prune(thread, self.keep) {
            Ok(0) => {}
            Ok(n) => debug!(thread = %thread, pruned = n, "pruned superseded checkpoints"),
            Err(err) => warn!(thread = %thread, error = %err, "failed to prune checkpoints"),
        }
        Ok(())
    }

    /// Latest intact checkpoint of `thread`.
    pub fn load_latest(&self, thread: &str) -> Result<Option<Checkpoint>, PersistenceError> {
        let checkpoint = self.store.load_latest(thread)?;
        if let Some(cp) = &checkpoint {
            let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
            let entry = last.entry(thread.to_string()).or_insert(cp.sequence);
            *entry = (*entry).max(cp.sequence);
        }
        Ok(checkpoint)
    }

    /// Highest sequence written or loaded for `thread` by this manager.
    pub fn last_sequence(&self, thread: &str) -> Option<u64> {
        self.last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(thread)
            .copied()
    }

    pub fn threads(&self) -> Result<Vec<ThreadId>, PersistenceError> {
        self.store.threads()
    }
}
