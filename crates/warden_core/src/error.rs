//! Error taxonomy for WARDEN.
//!
//! Every gateway operation fails with exactly one [`WardenError`]. The
//! internal variant keeps full detail for audit logging; [`WardenError::public`]
//! is what crosses the boundary to callers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Result type used across WARDEN crates
pub type WardenResult<T> = Result<T, WardenError>;

/// Which quota ceiling was hit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaResource {
    /// Total bytes stored
    Bytes,
    /// Total number of regular files
    Files,
}

impl fmt::Display for QuotaResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes => write!(f, "bytes"),
            Self::Files => write!(f, "files"),
        }
    }
}

/// Gateway error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WardenError {
    /// Path would leave the tenant's sandbox
    #[error("Path escapes sandbox: {path}")]
    PathEscape {
        /// Path as supplied by the caller
        path: String,
    },

    /// Malformed path input
    #[error("Invalid path {path:?}: {reason}")]
    InvalidPath {
        /// Path as supplied by the caller
        path: String,
        /// What is wrong with it
        reason: String,
    },

    /// Nothing exists at the path
    #[error("Not found: {path}")]
    NotFound {
        /// Tenant-relative path
        path: String,
    },

    /// Directory operation on a non-directory
    #[error("Not a directory: {path}")]
    NotADirectory {
        /// Tenant-relative path
        path: String,
    },

    /// File operation on a directory
    #[error("Is a directory: {path}")]
    IsADirectory {
        /// Tenant-relative path
        path: String,
    },

    /// Accepting the operation would exceed a quota ceiling
    #[error("Quota exceeded for {resource}: {used} used + {requested} requested > {limit}")]
    QuotaExceeded {
        /// Ceiling that was hit
        resource: QuotaResource,
        /// Amount the operation asked for
        requested: u64,
        /// Usage (committed plus reserved) at the time of the request
        used: u64,
        /// Configured ceiling
        limit: u64,
    },

    /// Token bucket exhausted
    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited {
        /// Time until enough tokens will have refilled
        retry_after_ms: u64,
    },

    /// Path lock could not be acquired in time
    #[error("Lock timeout on {path} after {waited_ms}ms")]
    LockTimeout {
        /// Tenant-relative path
        path: String,
        /// How long the caller waited
        waited_ms: u64,
    },

    /// Underlying storage failure
    #[error("Storage error: {reason}")]
    Storage {
        /// Error kind, never an absolute path
        reason: String,
    },

    /// Extension not on the allowlist
    #[error("File type '{extension}' not allowed")]
    FileTypeNotAllowed {
        /// Offending extension, with leading dot
        extension: String,
    },

    /// Resulting file would be larger than the per-file limit
    #[error("File too large: {size} bytes (limit: {limit})")]
    FileTooLarge {
        /// Size the file would have
        size: u64,
        /// Configured limit
        limit: u64,
    },

    /// Target already exists
    #[error("Already exists: {path}")]
    AlreadyExists {
        /// Tenant-relative path
        path: String,
    },

    /// Non-recursive delete of a populated directory
    #[error("Directory not empty: {path}")]
    DirectoryNotEmpty {
        /// Tenant-relative path
        path: String,
    },

    /// Request could not be decoded
    #[error("Invalid request: {reason}")]
    InvalidRequest {
        /// What is wrong with it
        reason: String,
    },
}

/// Stable error code reported to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// See [`WardenError::PathEscape`]
    PathEscape,
    /// See [`WardenError::InvalidPath`]
    InvalidPath,
    /// See [`WardenError::NotFound`]
    NotFound,
    /// See [`WardenError::NotADirectory`]
    NotADirectory,
    /// See [`WardenError::IsADirectory`]
    IsADirectory,
    /// See [`WardenError::QuotaExceeded`]
    QuotaExceeded,
    /// See [`WardenError::RateLimited`]
    RateLimited,
    /// See [`WardenError::LockTimeout`]
    LockTimeout,
    /// See [`WardenError::Storage`]
    StorageError,
    /// See [`WardenError::FileTypeNotAllowed`]
    FileTypeNotAllowed,
    /// See [`WardenError::FileTooLarge`]
    FileTooLarge,
    /// See [`WardenError::AlreadyExists`]
    AlreadyExists,
    /// See [`WardenError::DirectoryNotEmpty`]
    DirectoryNotEmpty,
    /// See [`WardenError::InvalidRequest`]
    InvalidRequest,
}

impl ErrorCode {
    /// Wire representation of the code
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::PathEscape => "PATH_ESCAPE",
            Self::InvalidPath => "INVALID_PATH",
            Self::NotFound => "NOT_FOUND",
            Self::NotADirectory => "NOT_A_DIRECTORY",
            Self::IsADirectory => "IS_A_DIRECTORY",
            Self::QuotaExceeded => "QUOTA_EXCEEDED",
            Self::RateLimited => "RATE_LIMITED",
            Self::LockTimeout => "LOCK_TIMEOUT",
            Self::StorageError => "STORAGE_ERROR",
            Self::FileTypeNotAllowed => "FILE_TYPE_NOT_ALLOWED",
            Self::FileTooLarge => "FILE_TOO_LARGE",
            Self::AlreadyExists => "ALREADY_EXISTS",
            Self::DirectoryNotEmpty => "DIRECTORY_NOT_EMPTY",
            Self::InvalidRequest => "INVALID_REQUEST",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-facing view of an error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicError {
    /// Stable code
    pub code: ErrorCode,
    /// Human-readable message
    pub message: String,
    /// Whether retrying the same request later may succeed
    pub retryable: bool,
}

impl fmt::Display for PublicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl WardenError {
    /// Construct a storage error from a reason
    #[must_use]
    pub fn storage(reason: impl Into<String>) -> Self {
        Self::Storage {
            reason: reason.into(),
        }
    }

    /// Construct an invalid request error
    #[must_use]
    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }

    /// Construct an invalid path error
    #[must_use]
    pub fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Internal error code
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::PathEscape { .. } => ErrorCode::PathEscape,
            Self::InvalidPath { .. } => ErrorCode::InvalidPath,
            Self::NotFound { .. } => ErrorCode::NotFound,
            Self::NotADirectory { .. } => ErrorCode::NotADirectory,
            Self::IsADirectory { .. } => ErrorCode::IsADirectory,
            Self::QuotaExceeded { .. } => ErrorCode::QuotaExceeded,
            Self::RateLimited { .. } => ErrorCode::RateLimited,
            Self::LockTimeout { .. } => ErrorCode::LockTimeout,
            Self::Storage { .. } => ErrorCode::StorageError,
            Self::FileTypeNotAllowed { .. } => ErrorCode::FileTypeNotAllowed,
            Self::FileTooLarge { .. } => ErrorCode::FileTooLarge,
            Self::AlreadyExists { .. } => ErrorCode::AlreadyExists,
            Self::DirectoryNotEmpty { .. } => ErrorCode::DirectoryNotEmpty,
            Self::InvalidRequest { .. } => ErrorCode::InvalidRequest,
        }
    }

    /// Whether the caller may retry after backing off
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::LockTimeout { .. })
    }

    /// Whether this is a sandbox violation
    #[must_use]
    pub const fn is_escape(&self) -> bool {
        matches!(self, Self::PathEscape { .. })
    }

    /// Caller-facing code and message.
    ///
    /// Sandbox escapes are reported exactly like a missing path so that the
    /// boundary of the sandbox cannot be mapped out.
    #[must_use]
    pub fn public(&self) -> PublicError {
        match self {
            Self::PathEscape { path } => Self::NotFound { path: path.clone() }.public(),
            other => PublicError {
                code: other.code(),
                message: other.to_string(),
                retryable: other.is_retryable(),
            },
        }
    }
}
