//! Tenant identity.
//!
//! Tenant ids are opaque strings handed over by the external authenticator.
//! They are never used as path components directly: the sandbox directory
//! is named by [`TenantId::sandbox_key`].

use crate::error::{WardenError, WardenResult};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Tenant identifier - scopes a sandbox root and all quota/rate state
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

impl TenantId {
    /// Create a tenant id from the authenticator's claim
    ///
    /// # Errors
    ///
    /// Returns error if the id is empty or contains a NUL byte
    pub fn new(id: impl Into<String>) -> WardenResult<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(WardenError::invalid_path("", "empty tenant id"));
        }
        if id.contains('\0') {
            return Err(WardenError::invalid_path("", "tenant id contains NUL byte"));
        }
        Ok(Self(id))
    }

    /// Get as string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Directory name of this tenant's sandbox.
    ///
    /// Ids that already are UUIDs are used verbatim (hyphenated, lowercase);
    /// anything else maps to a name-based UUID v5 in the DNS namespace.
    #[must_use]
    pub fn sandbox_key(&self) -> String {
        match Uuid::parse_str(&self.0) {
            Ok(uuid) => uuid.hyphenated().to_string(),
            Err(_) => Uuid::new_v5(&Uuid::NAMESPACE_DNS, self.0.as_bytes())
                .hyphenated()
                .to_string(),
        }
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TenantId {
    type Error = WardenError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TenantId> for String {
    fn from(tenant: TenantId) -> Self {
        tenant.0
    }
}

impl std::str::FromStr for TenantId {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}
