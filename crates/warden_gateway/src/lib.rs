//! WARDEN Gateway
//!
//! The tenant-facing surface: every filesystem operation resolves its paths
//! inside the caller's sandbox, is admitted by the rate limiter and file
//! filters, serializes mutations per canonical path and keeps quota
//! accounting exact. Sandbox escapes are audited and reported to the caller
//! as if the path did not exist.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod gateway;
pub mod request;
pub mod types;

pub use error::OpenError;
pub use gateway::{AUDIT_TARGET, Gateway, GatewayBuilder};
pub use request::{Encoding, ReadView, Request, Response};
pub use types::{
    DeleteReceipt, DirReceipt, FileStat, ListEntry, ListOptions, Listing, ReadOptions, ReadResult,
    SearchMatch, SearchOptions, SearchResult, TransferReceipt, UsageReport, WriteReceipt,
};

#[cfg(test)]
mod scenarios;
