// src/checkpoint/store.rs

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::anyhow;

use crate::checkpoint::record::Checkpoint;
use crate::errors::PersistenceError;
use crate::types::ThreadId;

/// Durable storage of checkpoints, keyed by thread id.
///
/// `save` must not return before the record is durable.
pub trait CheckpointStore: Send + Sync + Debug {
    fn save(&self, checkpoint: &Checkpoint) -> Result<(), PersistenceError>;

    /// Latest intact checkpoint of `thread`, or `None` if there is none.
    fn load_latest(&self, thread: &str) -> Result<Option<Checkpoint>, PersistenceError>;

    /// Delete all but the newest `keep` checkpoints. Returns how many were
    /// removed.
    fn prune(&self, thread: &str, keep: usize) -> Result<usize, PersistenceError>;

    /// Every thread with at least one checkpoint.
    fn threads(&self) -> Result<Vec<ThreadId>, PersistenceError>;
}

/// Checkpoints kept in process memory.
///
/// Useful for tests and embedders that do not need crash recovery.
/// Saves can be switched to fail to exercise the halt path.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCheckpointStore {
    records: Arc<Mutex<BTreeMap<ThreadId, Vec<Checkpoint>>>>,
    fail_saves: Arc<AtomicBool>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Every retained checkpoint of `thread`, oldest first.
    pub fn history(&self, thread: &str) -> Vec<Checkpoint> {
        self.lock().get(thread).cloned().unwrap_or_default()
    }

    /// Seed the store directly, bypassing sequence checks.
    pub fn insert(&self, checkpoint: Checkpoint) {
        let mut records = self.lock();
        let list = records.entry(checkpoint.thread_id.clone()).or_default();
        list.push(checkpoint);
        list.sort_by_key(|c| c.sequence);
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<ThreadId, Vec<Checkpoint>>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    fn save(&self, checkpoint: &Checkpoint) -> Result<(), PersistenceError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(PersistenceError::Io(anyhow!(
                "in-memory store refused checkpoint {} of thread '{}'",
                checkpoint.sequence,
                checkpoint.thread_id
            )));
        }
        self.insert(checkpoint.clone());
        Ok(())
    }

    fn load_latest(&self, thread: &str) -> Result<Option<Checkpoint>, PersistenceError> {
        Ok(self
            .lock()
            .get(thread)
            .and_then(|list| list.last().cloned()))
    }

    fn prune(&self, thread: &str, keep: usize) -> Result<usize, PersistenceError> {
        let mut records = self.lock();
        let Some(list) = records.get_mut(thread) else {
            return Ok(0);
        };
        let excess = list.len().saturating_sub(keep.max(1));
        list.drain(..excess);
        Ok(excess)
    }

    fn threads(&self) -> Result<Vec<ThreadId>, PersistenceError> {
        Ok(self.lock().keys().cloned().collect())
    }
}
