//! WARDEN Policy
//!
//! The admission side of the gateway: where a tenant path lands on
//! storage, how much a tenant may store, and how often it may ask.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod filter;
pub mod quota;
pub mod rate;
pub mod resolver;

pub use filter::AdmissionFilter;
pub use quota::{QuotaTracker, QuotaUsage, Reservation};
pub use rate::{BucketState, RateLimiter};
pub use resolver::{PathResolver, RelativePath, ResolvedPath};
