// src/fs/mock.rs

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{anyhow, bail, Result};

use super::FileSystem;

/// In-memory filesystem for checkpoint tests.
///
/// Directories are implicit: a path is a directory when some file lives
/// below it. Writes can be switched to fail to simulate a full disk.
#[derive(Debug, Clone, Default)]
pub struct MockFileSystem {
    files: Arc<Mutex<BTreeMap<PathBuf, Vec<u8>>>>,
    fail_writes: Arc<AtomicBool>,
}

impl MockFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(&self, path: impl AsRef<Path>, content: impl Into<Vec<u8>>) {
        self.files()
            .insert(path.as_ref().to_path_buf(), content.into());
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Stored file paths, sorted.
    pub fn paths(&self) -> Vec<PathBuf> {
        self.files().keys().cloned().collect()
    }

    fn files(&self) -> MutexGuard<'_, BTreeMap<PathBuf, Vec<u8>>> {
        self.files.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl FileSystem for MockFileSystem {
    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        self.files()
            .get(path)
            .cloned()
            .ok_or_else(|| anyhow!("no such file: {}", path.display()))
    }

    fn write_atomic(&self, path: &Path, contents: &[u8]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("write refused: {}", path.display());
        }
        self.add_file(path, contents);
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        match self.files().remove(path) {
            Some(_) => Ok(()),
            None => bail!("no such file: {}", path.display()),
        }
    }

    fn is_dir(&self, path: &Path) -> bool {
        self.files()
            .keys()
            .any(|p| p != path && p.starts_with(path))
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let mut children: Vec<PathBuf> = self
            .files()
            .keys()
            .filter_map(|p| {
                let first = p.strip_prefix(path).ok()?.components().next()?;
                Some(path.join(first))
            })
            .collect();
        if children.is_empty() {
            bail!("not a directory: {}", path.display());
        }
        children.dedup();
        Ok(children)
    }
}
