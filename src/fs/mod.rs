// src/fs/mod.rs

//! Filesystem seam under the file-backed checkpoint store.

use std::fmt::Debug;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub mod mock;

/// What the checkpoint store needs from a filesystem.
pub trait FileSystem: Send + Sync + Debug {
    fn read(&self, path: &Path) -> Result<Vec<u8>>;

    /// Replace `path` with `contents` so that readers observe either the
    /// previous file or the complete new one. Parent directories are
    /// created as needed.
    fn write_atomic(&self, path: &Path, contents: &[u8]) -> Result<()>;

    fn remove_file(&self, path: &Path) -> Result<()>;

    fn is_dir(&self, path: &Path) -> bool;

    /// Full paths of the entries in `path`, sorted.
    fn list_dir(&self, path: &Path) -> Result<Vec<PathBuf>>;
}

/// `std::fs` backed implementation.
#[derive(Debug, Clone, Default)]
pub struct RealFileSystem;

impl RealFileSystem {
    fn staging_path(path: &Path) -> PathBuf {
        let mut name = path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        path.with_file_name(name)
    }
}

impl FileSystem for RealFileSystem {
    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        fs::read(path).with_context(|| format!("reading {}", path.display()))
    }

    fn write_atomic(&self, path: &Path, contents: &[u8]) -> Result<()> {
        let parent = path
            .parent()
            .with_context(|| format!("{} has no parent directory", path.display()))?;
        fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;

        let staging = Self::staging_path(path);
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&staging)
                .with_context(|| format!("creating {}", staging.display()))?;
            file.write_all(contents)
                .and_then(|()| file.sync_all())
                .with_context(|| format!("writing {}", staging.display()))?;
        }
        fs::rename(&staging, path).with_context(|| {
            format!("moving {} into place", staging.display())
        })?;

        // Make the rename itself durable. Not every platform lets a
        // directory be opened, so this is best effort.
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        fs::remove_file(path).with_context(|| format!("removing {}", path.display()))
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let mut entries = fs::read_dir(path)
            .with_context(|| format!("listing {}", path.display()))?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<std::io::Result<Vec<_>>>()
            .with_context(|| format!("listing {}", path.display()))?;
        entries.sort();
        Ok(entries)
    }
}
