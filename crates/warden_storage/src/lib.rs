//! WARDEN Storage
//!
//! The outbound storage interface consumed by the gateway, plus two
//! implementations: the local disk and an in-memory tree.
//! Backends know nothing about tenants; they operate on absolute paths.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod error;
pub mod local;
pub mod memory;

pub use backend::{DirEntry, EntryKind, Metadata, StorageBackend, TreeUsage};
pub use error::{StorageError, StorageResult};
pub use local::{LocalStorage, SCRATCH_PREFIX};
pub use memory::MemoryStorage;
