//! Storage errors.

use warden_core::WardenError;

/// Storage result type
pub type StorageResult<T> = Result<T, StorageError>;

/// Storage error, classified by kind.
///
/// Errors carry no path; the caller attaches the
/// tenant-relative path when converting into a [`WardenError`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// Nothing exists at the path
    #[error("not found")]
    NotFound,

    /// A path component is not a directory
    #[error("not a directory")]
    NotADirectory,

    /// File operation on a directory
    #[error("is a directory")]
    IsADirectory,

    /// Target already exists
    #[error("already exists")]
    AlreadyExists,

    /// Directory has entries
    #[error("directory not empty")]
    DirectoryNotEmpty,

    /// Call exceeded its time bound
    #[error("timed out")]
    TimedOut,

    /// Any other I/O failure
    #[error("{kind}")]
    Io {
        /// Description of the I/O error kind
        kind: String,
    },
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        match err.kind() {
            ErrorKind::NotFound => Self::NotFound,
            ErrorKind::NotADirectory => Self::NotADirectory,
            ErrorKind::IsADirectory => Self::IsADirectory,
            ErrorKind::AlreadyExists => Self::AlreadyExists,
            ErrorKind::DirectoryNotEmpty => Self::DirectoryNotEmpty,
            ErrorKind::TimedOut => Self::TimedOut,
            kind => Self::Io {
                kind: kind.to_string(),
            },
        }
    }
}

impl StorageError {
    /// Convert into the gateway taxonomy, attaching a tenant-relative path
    #[must_use]
    pub fn into_warden(self, path: &str) -> WardenError {
        let path = path.to_string();
        match self {
            Self::NotFound => WardenError::NotFound { path },
            Self::NotADirectory => WardenError::NotADirectory { path },
            Self::IsADirectory => WardenError::IsADirectory { path },
            Self::AlreadyExists => WardenError::AlreadyExists { path },
            Self::DirectoryNotEmpty => WardenError::DirectoryNotEmpty { path },
            other => WardenError::storage(other.to_string()),
        }
    }
}

impl From<StorageError> for WardenError {
    fn from(err: StorageError) -> Self {
        err.into_warden("")
    }
}
