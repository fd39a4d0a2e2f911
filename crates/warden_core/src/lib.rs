//! WARDEN Core Types
//!
//! Pure types shared by every WARDEN crate: tenant identity, the typed
//! error taxonomy, gateway configuration, clocks and content digests.
//! Nothing in this crate touches the filesystem except config loading.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod digest;
pub mod error;
pub mod id;
pub mod time;

// Re-exports
pub use config::{ConfigError, GatewayConfig, QuotaLimits, RateConfig, TenantLimits, TenantOverrides};
pub use digest::{ContentDigest, DigestError};
pub use error::{ErrorCode, PublicError, QuotaResource, WardenError, WardenResult};
pub use id::TenantId;
pub use time::{Clock, ManualClock, SystemClock, Timestamp};
