//! Storage backend trait.

use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use warden_core::Timestamp;

/// Kind of a storage entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// Regular file
    File,
    /// Directory
    Directory,
    /// Symbolic link (only reported by [`StorageBackend::symlink_metadata`])
    Symlink,
}

/// Entry metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// Entry kind
    pub kind: EntryKind,
    /// Size in bytes (zero for directories on backends without a size)
    pub len: u64,
    /// Last modification time
    pub modified: Option<Timestamp>,
    /// Creation time, where the platform reports it
    pub created: Option<Timestamp>,
    /// Unix permission bits
    pub permissions: Option<u32>,
}

impl Metadata {
    /// Is this a regular file
    #[must_use]
    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }

    /// Is this a directory
    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    /// Is this a symbolic link
    #[must_use]
    pub fn is_symlink(&self) -> bool {
        self.kind == EntryKind::Symlink
    }
}

/// One entry of a directory listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// Entry name (final component)
    pub name: String,
    /// Metadata of the entry itself, not of a link target
    pub metadata: Metadata,
}

/// Aggregate size of a subtree
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeUsage {
    /// Sum of regular file sizes
    pub bytes: u64,
    /// Number of regular files
    pub files: u64,
    /// Number of directories below the root
    pub directories: u64,
}

/// Hierarchical byte storage addressed by absolute paths.
///
/// Semantics follow POSIX: writes require the parent directory to exist,
/// `rename` replaces an existing file, `metadata` follows symbolic links
/// and `symlink_metadata` does not.
#[async_trait]
pub trait StorageBackend: Send + Sync + std::fmt::Debug {
    /// Metadata, following symbolic links
    async fn metadata(&self, path: &Path) -> StorageResult<Metadata>;

    /// Metadata of the entry itself
    async fn symlink_metadata(&self, path: &Path) -> StorageResult<Metadata>;

    /// Resolve all symbolic links and relative components of an existing path
    async fn canonicalize(&self, path: &Path) -> StorageResult<PathBuf>;

    /// Read a whole file
    async fn read(&self, path: &Path) -> StorageResult<Vec<u8>>;

    /// Replace a file's content; readers never observe a partial write
    async fn write(&self, path: &Path, data: &[u8]) -> StorageResult<()>;

    /// Append to a file, creating it if missing
    async fn append(&self, path: &Path, data: &[u8]) -> StorageResult<()>;

    /// Create one directory
    async fn create_dir(&self, path: &Path) -> StorageResult<()>;

    /// Create a directory and any missing parents
    async fn create_dir_all(&self, path: &Path) -> StorageResult<()>;

    /// Remove a file
    async fn remove_file(&self, path: &Path) -> StorageResult<()>;

    /// Remove an empty directory
    async fn remove_dir(&self, path: &Path) -> StorageResult<()>;

    /// Remove a directory and everything under it
    async fn remove_dir_all(&self, path: &Path) -> StorageResult<()>;

    /// Move an entry
    async fn rename(&self, from: &Path, to: &Path) -> StorageResult<()>;

    /// List a directory
    async fn read_dir(&self, path: &Path) -> StorageResult<Vec<DirEntry>>;

    /// Remove scratch files a crashed or abandoned write left below `root`.
    ///
    /// Returns how many were removed. Backends that write in place have
    /// nothing to sweep.
    async fn sweep_scratch(&self, _root: &Path) -> StorageResult<u64> {
        Ok(0)
    }

    /// Walk a subtree without following symbolic links and total it up
    async fn tree_usage(&self, root: &Path) -> StorageResult<TreeUsage> {
        let mut usage = TreeUsage::default();
        let mut pending = vec![root.to_path_buf()];

        while let Some(dir) = pending.pop() {
            let entries = match self.read_dir(&dir).await {
                Ok(entries) => entries,
                // Raced with a concurrent delete
                Err(StorageError::NotFound) if dir != root => continue,
                Err(e) => return Err(e),
            };
            for entry in entries {
                match entry.metadata.kind {
                    EntryKind::File => {
                        usage.bytes += entry.metadata.len;
                        usage.files += 1;
                    }
                    EntryKind::Directory => {
                        usage.directories += 1;
                        pending.push(dir.join(&entry.name));
                    }
                    EntryKind::Symlink => {}
                }
            }
        }

        Ok(usage)
    }
}
