//! Local disk backend.

use crate::backend::{DirEntry, EntryKind, Metadata, StorageBackend};
use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use warden_core::Timestamp;

/// Prefix of the scratch files used for atomic replacement.
///
/// Entries with this prefix are hidden from [`StorageBackend::read_dir`],
/// so callers must never let tenants create names that carry it.
pub const SCRATCH_PREFIX: &str = ".warden-tmp-";

/// Backend over the host filesystem via `tokio::fs`
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalStorage;

impl LocalStorage {
    /// Create a new local backend
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn temp_path(path: &Path) -> StorageResult<PathBuf> {
        let parent = path.parent().ok_or(StorageError::NotFound)?;
        Ok(parent.join(format!("{SCRATCH_PREFIX}{}", uuid::Uuid::new_v4().simple())))
    }
}

fn convert_metadata(meta: &std::fs::Metadata) -> Metadata {
    let file_type = meta.file_type();
    let kind = if file_type.is_symlink() {
        EntryKind::Symlink
    } else if file_type.is_dir() {
        EntryKind::Directory
    } else {
        EntryKind::File
    };

    #[cfg(unix)]
    let permissions = {
        use std::os::unix::fs::PermissionsExt;
        Some(meta.permissions().mode() & 0o777)
    };
    #[cfg(not(unix))]
    let permissions = None;

    Metadata {
        kind,
        len: meta.len(),
        modified: meta.modified().ok().map(Timestamp::from),
        created: meta.created().ok().map(Timestamp::from),
        permissions,
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    async fn metadata(&self, path: &Path) -> StorageResult<Metadata> {
        let meta = tokio::fs::metadata(path).await?;
        Ok(convert_metadata(&meta))
    }

    async fn symlink_metadata(&self, path: &Path) -> StorageResult<Metadata> {
        let meta = tokio::fs::symlink_metadata(path).await?;
        Ok(convert_metadata(&meta))
    }

    async fn canonicalize(&self, path: &Path) -> StorageResult<PathBuf> {
        Ok(tokio::fs::canonicalize(path).await?)
    }

    async fn read(&self, path: &Path) -> StorageResult<Vec<u8>> {
        Ok(tokio::fs::read(path).await?)
    }

    async fn write(&self, path: &Path, data: &[u8]) -> StorageResult<()> {
        if let Ok(meta) = tokio::fs::metadata(path).await {
            if meta.is_dir() {
                return Err(StorageError::IsADirectory);
            }
        }

        // Write beside the target and rename over it
        let temp = Self::temp_path(path)?;
        let result = async {
            let mut file = tokio::fs::File::create(&temp).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
            tokio::fs::rename(&temp, path).await
        }
        .await;

        if let Err(e) = result {
            if let Err(cleanup) = tokio::fs::remove_file(&temp).await {
                tracing::debug!(error = %cleanup, "failed to remove scratch file");
            }
            return Err(e.into());
        }
        Ok(())
    }

    async fn append(&self, path: &Path, data: &[u8]) -> StorageResult<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }

    async fn create_dir(&self, path: &Path) -> StorageResult<()> {
        Ok(tokio::fs::create_dir(path).await?)
    }

    async fn create_dir_all(&self, path: &Path) -> StorageResult<()> {
        Ok(tokio::fs::create_dir_all(path).await?)
    }

    async fn remove_file(&self, path: &Path) -> StorageResult<()> {
        let meta = tokio::fs::symlink_metadata(path).await?;
        if meta.is_dir() {
            return Err(StorageError::IsADirectory);
        }
        Ok(tokio::fs::remove_file(path).await?)
    }

    async fn remove_dir(&self, path: &Path) -> StorageResult<()> {
        Ok(tokio::fs::remove_dir(path).await?)
    }

    async fn remove_dir_all(&self, path: &Path) -> StorageResult<()> {
        Ok(tokio::fs::remove_dir_all(path).await?)
    }

    async fn rename(&self, from: &Path, to: &Path) -> StorageResult<()> {
        Ok(tokio::fs::rename(from, to).await?)
    }

    async fn read_dir(&self, path: &Path) -> StorageResult<Vec<DirEntry>> {
        let mut reader = tokio::fs::read_dir(path).await?;
        let mut entries = Vec::new();

        while let Some(entry) = reader.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(SCRATCH_PREFIX) {
                continue;
            }
            let meta = match tokio::fs::symlink_metadata(entry.path()).await {
                Ok(meta) => meta,
                // Removed between listing and stat
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            entries.push(DirEntry {
                name,
                metadata: convert_metadata(&meta),
            });
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn sweep_scratch(&self, root: &Path) -> StorageResult<u64> {
        let mut removed = 0;
        let mut pending = vec![root.to_path_buf()];

        while let Some(dir) = pending.pop() {
            let mut reader = match tokio::fs::read_dir(&dir).await {
                Ok(reader) => reader,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound && dir != root => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = reader.next_entry().await? {
                let file_type = entry.file_type().await?;
                let scratch = entry.file_name().to_string_lossy().starts_with(SCRATCH_PREFIX);
                if scratch && file_type.is_file() {
                    match tokio::fs::remove_file(entry.path()).await {
                        Ok(()) => removed += 1,
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                } else if file_type.is_dir() {
                    pending.push(entry.path());
                }
            }
        }

        if removed > 0 {
            tracing::debug!(root = %root.display(), removed, "swept scratch files");
        }
        Ok(removed)
    }
}
