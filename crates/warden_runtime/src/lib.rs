//! WARDEN Runtime
//!
//! Coordination of concurrent mutations against the shared sandbox tree.
//! Every wait is bounded and every lock is released by its guard.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod coordinator;
pub mod monitor;

pub use coordinator::{LockTimeout, MutationCoordinator, PathLockGuard, SubtreeMode};
pub use monitor::LockStats;
