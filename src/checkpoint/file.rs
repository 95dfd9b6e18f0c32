// src/checkpoint/file.rs

//! File-backed checkpoint store.
//!
//! Layout:
//!
//! ```text
//! <root>/<thread-id>/<sequence, 20 digits>.ckpt
//! ```
//!
//! Each record is a blake3 hex digest on the first line followed by the
//! JSON-encoded [`Checkpoint`]. Records are replaced atomically through
//! [`FileSystem::write_atomic`]; any whose digest does not match are skipped
//! on load.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::anyhow;
use blake3::Hasher;
use tracing::{debug, warn};

use crate::checkpoint::record::Checkpoint;
use crate::checkpoint::store::CheckpointStore;
use crate::errors::PersistenceError;
use crate::fs::{FileSystem, RealFileSystem};
use crate::types::ThreadId;

const RECORD_EXT: &str = "ckpt";

#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    root: PathBuf,
    fs: Arc<dyn FileSystem>,
}

impl FileCheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_fs(root, Arc::new(RealFileSystem))
    }

    pub fn with_fs(root: impl Into<PathBuf>, fs: Arc<dyn FileSystem>) -> Self {
        Self {
            root: root.into(),
            fs,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn thread_dir(&self, thread: &str) -> Result<PathBuf, PersistenceError> {
        let valid = !thread.is_empty()
            && thread
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(PersistenceError::Io(anyhow!(
                "thread id '{thread}' is not usable as a directory name"
            )));
        }
        Ok(self.root.join(thread))
    }

    fn record_path(dir: &Path, sequence: u64) -> PathBuf {
        dir.join(format!("{sequence:020}.{RECORD_EXT}"))
    }

    /// Record files of a thread with their sequence numbers, ascending.
    fn records(&self, thread: &str) -> Result<Vec<(u64, PathBuf)>, PersistenceError> {
        let dir = self.thread_dir(thread)?;
        if !self.fs.is_dir(&dir) {
            return Ok(Vec::new());
        }

        let mut records: Vec<(u64, PathBuf)> = self
            .fs
            .list_dir(&dir)
            .map_err(PersistenceError::Io)?
            .into_iter()
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some(RECORD_EXT))
            .filter_map(|p| {
                let seq = p.file_stem()?.to_str()?.parse::<u64>().ok()?;
                Some((seq, p))
            })
            .collect();
        records.sort_by_key(|(seq, _)| *seq);
        Ok(records)
    }

    fn decode(thread: &str, bytes: &[u8]) -> Result<Checkpoint, PersistenceError> {
        let corrupt = |reason: &str| PersistenceError::Corrupt {
            thread: thread.to_string(),
            reason: reason.to_string(),
        };

        let text = std::str::from_utf8(bytes).map_err(|_| corrupt("record is not UTF-8"))?;
        let (digest, body) = text
            .split_once('\n')
            .ok_or_else(|| corrupt("missing checksum line"))?;
        if digest != checksum(body.as_bytes()) {
            return Err(corrupt("checksum mismatch"));
        }

        let checkpoint: Checkpoint = serde_json::from_str(body)?;
        if checkpoint.thread_id != thread {
            return Err(corrupt("record belongs to another thread"));
        }
        Ok(checkpoint)
    }
}

fn checksum(bytes: &[u8]) -> String {
    let mut hasher = Hasher::new();
    hasher.update(bytes);
    hasher.finalize().to_hex().to_string()
}

impl CheckpointStore for FileCheckpointStore {
    fn save(&self, checkpoint: &Checkpoint) -> Result<(), PersistenceError> {
        let dir = self.thread_dir(&checkpoint.thread_id)?;
        let body = serde_json::to_string(checkpoint)?;
        let record = format!("{}\n{}", checksum(body.as_bytes()), body);

        let path = Self::record_path(&dir, checkpoint.sequence);
        self.fs
            .write_atomic(&path, record.as_bytes())
            .map_err(PersistenceError::Io)?;

        debug!(
            thread = %checkpoint.thread_id,
            seq = checkpoint.sequence,
            path = ?path,
            "checkpoint written"
        );
        Ok(())
    }

    fn load_latest(&self, thread: &str) -> Result<Option<Checkpoint>, PersistenceError> {
        for (seq, path) in self.records(thread)?.into_iter().rev() {
            let bytes = match self.fs.read(&path) {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(thread, seq, error = %err, "unreadable checkpoint; trying an older one");
                    continue;
                }
            };
            match Self::decode(thread, &bytes) {
                Ok(checkpoint) => return Ok(Some(checkpoint)),
                Err(err) => {
                    warn!(thread, seq, error = %err, "skipping damaged checkpoint");
                }
            }
        }
        Ok(None)
    }

    fn prune(&self, thread: &str, keep: usize) -> Result<usize, PersistenceError> {
        let records = self.records(thread)?;
        let excess = records.len().saturating_sub(keep.max(1));

        for (seq, path) in records.iter().take(excess) {
            self.fs.remove_file(path).map_err(PersistenceError::Io)?;
            debug!(thread, seq, "pruned checkpoint");
        }
        Ok(excess)
    }

    fn threads(&self) -> Result<Vec<ThreadId>, PersistenceError> {
        if !self.fs.is_dir(&self.root) {
            return Ok(Vec::new());
        }
        let mut threads: Vec<ThreadId> = self
            .fs
            .list_dir(&self.root)
            .map_err(PersistenceError::Io)?
            .into_iter()
            .filter(|p| self.fs.is_dir(p))
            .filter_map(|p| p.file_name()?.to_str().map(str::to_string))
            .collect();
        threads.sort();
        Ok(threads)
    }
}
