//! Gateway startup errors.

use warden_core::ConfigError;
use warden_storage::StorageError;

/// Why a gateway could not be opened
#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    /// Configuration rejected
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Base directory could not be prepared
    #[error("Cannot prepare base directory: {0}")]
    Storage(#[from] StorageError),
}
