//! Gateway configuration.
//!
//! Loaded from a JSON file, then overlaid with `WARDEN_*` environment
//! variables, then validated. Every field has a default so an empty
//! object is a valid configuration.

use crate::id::TenantId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Extensions accepted by default for reads and writes
pub const DEFAULT_ALLOWED_EXTENSIONS: &[&str] = &[
    ".txt", ".md", ".json", ".csv", ".xml", ".html", ".css", ".js", ".py", ".java", ".cpp",
    ".c", ".h", ".rb", ".go", ".rs", ".php", ".sql", ".yaml", ".yml", ".ini", ".cfg", ".conf",
    ".log", ".dockerfile", ".gitignore", ".env.example", ".pdf", ".docx", ".xlsx", ".pptx",
    ".zip", ".tar", ".gz",
];

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("Failed to read config {path}: {source}")]
    Io {
        /// Config file path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid JSON for this schema
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    /// Environment variable has an unparsable value
    #[error("Invalid value for {var}: {value:?}")]
    Env {
        /// Variable name
        var: String,
        /// Raw value
        value: String,
    },

    /// Semantically invalid setting
    #[error("Invalid config field {field}: {reason}")]
    Invalid {
        /// Offending field
        field: String,
        /// What is wrong with it
        reason: String,
    },
}

/// Per-tenant storage ceilings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaLimits {
    /// Maximum total bytes across all files
    pub max_bytes: u64,
    /// Maximum number of regular files
    pub max_files: u64,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            max_bytes: 100 * 1024 * 1024, // 100 MiB
            max_files: 10_000,
        }
    }
}

/// Token bucket parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateConfig {
    /// Bucket capacity (burst size)
    pub capacity: u32,
    /// Tokens added per second
    pub refill_per_sec: f64,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            capacity: 50,
            refill_per_sec: 10.0,
        }
    }
}

/// Optional per-tenant overrides of the global limits
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantOverrides {
    /// Override for [`QuotaLimits::max_bytes`]
    pub max_bytes: Option<u64>,
    /// Override for [`QuotaLimits::max_files`]
    pub max_files: Option<u64>,
    /// Override for [`RateConfig::capacity`]
    pub rate_capacity: Option<u32>,
    /// Override for [`RateConfig::refill_per_sec`]
    pub rate_refill_per_sec: Option<f64>,
}

/// Effective limits for one tenant
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TenantLimits {
    /// Storage ceilings
    pub quota: QuotaLimits,
    /// Rate parameters
    pub rate: RateConfig,
}

/// Gateway configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Directory holding one sandbox per tenant
    pub base_dir: PathBuf,
    /// Default storage ceilings
    pub quota: QuotaLimits,
    /// Default token bucket
    pub rate: RateConfig,
    /// Bound on waiting for a path lock
    pub lock_timeout_ms: u64,
    /// Bound on any single storage call
    pub io_timeout_ms: u64,
    /// Largest file that may be read or produced
    pub max_file_size: u64,
    /// Extension allowlist; `None` disables the filter
    pub allowed_extensions: Option<BTreeSet<String>>,
    /// Per-tenant overrides keyed by tenant id
    pub tenants: BTreeMap<String, TenantOverrides>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("./user-workspaces"),
            quota: QuotaLimits::default(),
            rate: RateConfig::default(),
            lock_timeout_ms: 5_000,
            io_timeout_ms: 30_000,
            max_file_size: 10 * 1024 * 1024, // 10 MiB
            allowed_extensions: Some(
                DEFAULT_ALLOWED_EXTENSIONS
                    .iter()
                    .map(|ext| (*ext).to_string())
                    .collect(),
            ),
            tenants: BTreeMap::new(),
        }
    }
}

impl GatewayConfig {
    /// Create a default configuration rooted at `base_dir`
    #[must_use]
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            ..Self::default()
        }
    }

    /// Load a JSON config file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw)?;
        tracing::debug!(path = %path.display(), "loaded gateway config");
        Ok(config)
    }

    /// Overlay `WARDEN_*` variables from the process environment
    ///
    /// # Errors
    ///
    /// Returns error if a variable is set to an unparsable value
    pub fn apply_env(self) -> Result<Self, ConfigError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Overlay `WARDEN_*` variables using a custom lookup
    ///
    /// # Errors
    ///
    /// Returns error if a variable is set to an unparsable value
    pub fn apply_env_from<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(var: &str, value: String) -> Result<T, ConfigError> {
            value.trim().parse().map_err(|_| ConfigError::Env {
                var: var.to_string(),
                value,
            })
        }

        if let Some(v) = lookup("WARDEN_BASE_DIR") {
            self.base_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("WARDEN_MAX_BYTES") {
            self.quota.max_bytes = parse("WARDEN_MAX_BYTES", v)?;
        }
        if let Some(v) = lookup("WARDEN_MAX_FILES") {
            self.quota.max_files = parse("WARDEN_MAX_FILES", v)?;
        }
        if let Some(v) = lookup("WARDEN_RATE_CAPACITY") {
            self.rate.capacity = parse("WARDEN_RATE_CAPACITY", v)?;
        }
        if let Some(v) = lookup("WARDEN_RATE_REFILL") {
            self.rate.refill_per_sec = parse("WARDEN_RATE_REFILL", v)?;
        }
        if let Some(v) = lookup("WARDEN_LOCK_TIMEOUT_MS") {
            self.lock_timeout_ms = parse("WARDEN_LOCK_TIMEOUT_MS", v)?;
        }
        if let Some(v) = lookup("WARDEN_IO_TIMEOUT_MS") {
            self.io_timeout_ms = parse("WARDEN_IO_TIMEOUT_MS", v)?;
        }
        if let Some(v) = lookup("WARDEN_MAX_FILE_SIZE") {
            self.max_file_size = parse("WARDEN_MAX_FILE_SIZE", v)?;
        }
        Ok(self)
    }

    /// Check that limits are usable
    ///
    /// # Errors
    ///
    /// Returns error naming the first invalid field
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &str, reason: &str) -> ConfigError {
            ConfigError::Invalid {
                field: field.to_string(),
                reason: reason.to_string(),
            }
        }

        if self.base_dir.as_os_str().is_empty() {
            return Err(invalid("base_dir", "must not be empty"));
        }
        if self.lock_timeout_ms == 0 {
            return Err(invalid("lock_timeout_ms", "must be positive"));
        }
        if self.io_timeout_ms == 0 {
            return Err(invalid("io_timeout_ms", "must be positive"));
        }
        if self.max_file_size == 0 {
            return Err(invalid("max_file_size", "must be positive"));
        }
        check_rate("rate", &self.rate)?;
        for (tenant, overrides) in &self.tenants {
            let limits = self.apply_overrides(overrides);
            check_rate(&format!("tenants.{tenant}"), &limits.rate)?;
        }
        Ok(())
    }

    /// Effective limits for a tenant
    #[must_use]
    pub fn limits_for(&self, tenant: &TenantId) -> TenantLimits {
        match self.tenants.get(tenant.as_str()) {
            Some(overrides) => self.apply_overrides(overrides),
            None => TenantLimits {
                quota: self.quota,
                rate: self.rate,
            },
        }
    }

    /// Effective limits of every tenant that has overrides
    pub fn overridden_limits(&self) -> impl Iterator<Item = (&str, TenantLimits)> + '_ {
        self.tenants
            .iter()
            .map(|(tenant, overrides)| (tenant.as_str(), self.apply_overrides(overrides)))
    }

    fn apply_overrides(&self, overrides: &TenantOverrides) -> TenantLimits {
        TenantLimits {
            quota: QuotaLimits {
                max_bytes: overrides.max_bytes.unwrap_or(self.quota.max_bytes),
                max_files: overrides.max_files.unwrap_or(self.quota.max_files),
            },
            rate: RateConfig {
                capacity: overrides.rate_capacity.unwrap_or(self.rate.capacity),
                refill_per_sec: overrides
                    .rate_refill_per_sec
                    .unwrap_or(self.rate.refill_per_sec),
            },
        }
    }

    /// Lock acquisition bound
    #[must_use]
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Storage call bound
    #[must_use]
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    /// Set default quota
    #[must_use]
    pub fn with_quota(mut self, max_bytes: u64, max_files: u64) -> Self {
        self.quota = QuotaLimits {
            max_bytes,
            max_files,
        };
        self
    }

    /// Set default rate
    #[must_use]
    pub fn with_rate(mut self, capacity: u32, refill_per_sec: f64) -> Self {
        self.rate = RateConfig {
            capacity,
            refill_per_sec,
        };
        self
    }

    /// Set lock timeout
    #[must_use]
    pub fn with_lock_timeout(mut self, timeout_ms: u64) -> Self {
        self.lock_timeout_ms = timeout_ms;
        self
    }

    /// Set storage call timeout
    #[must_use]
    pub fn with_io_timeout(mut self, timeout_ms: u64) -> Self {
        self.io_timeout_ms = timeout_ms;
        self
    }

    /// Set maximum file size
    #[must_use]
    pub fn with_max_file_size(mut self, max_file_size: u64) -> Self {
        self.max_file_size = max_file_size;
        self
    }

    /// Replace the extension allowlist
    #[must_use]
    pub fn with_allowed_extensions(mut self, extensions: Option<BTreeSet<String>>) -> Self {
        self.allowed_extensions = extensions;
        self
    }

    /// Add overrides for one tenant
    #[must_use]
    pub fn with_tenant(mut self, tenant: impl Into<String>, overrides: TenantOverrides) -> Self {
        self.tenants.insert(tenant.into(), overrides);
        self
    }
}

fn check_rate(field: &str, rate: &RateConfig) -> Result<(), ConfigError> {
    if rate.capacity == 0 {
        return Err(ConfigError::Invalid {
            field: format!("{field}.capacity"),
            reason: "must be positive".to_string(),
        });
    }
    if !rate.refill_per_sec.is_finite() || rate.refill_per_sec <= 0.0 {
        return Err(ConfigError::Invalid {
            field: format!("{field}.refill_per_sec"),
            reason: "must be a positive finite number".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_config_default() {
        let config = GatewayConfig::default();
        assert_eq!(config.quota.max_bytes, 100 * 1024 * 1024);
        assert_eq!(config.max_file_size, 10 * 1024 * 1024);
        assert_eq!(config.lock_timeout(), Duration::from_secs(5));
        assert!(config.allowed_extensions.as_ref().unwrap().contains(".rs"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_empty_json() {
        let config: GatewayConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, GatewayConfig::default());
    }

    #[test]
    fn test_config_partial_json() {
        let config: GatewayConfig = serde_json::from_str(
            r#"{"base_dir": "/srv/ws", "quota": {"max_bytes": 1000}, "allowed_extensions": null}"#,
        )
        .unwrap();
        assert_eq!(config.base_dir, PathBuf::from("/srv/ws"));
        assert_eq!(config.quota.max_bytes, 1000);
        assert_eq!(config.quota.max_files, QuotaLimits::default().max_files);
        assert!(config.allowed_extensions.is_none());
    }

    #[test]
    fn test_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warden.json");
        std::fs::write(&path, r#"{"lock_timeout_ms": 250}"#).unwrap();

        let config = GatewayConfig::from_file(&path).unwrap();
        assert_eq!(config.lock_timeout_ms, 250);

        let missing = GatewayConfig::from_file(dir.path().join("missing.json"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_config_env_overlay() {
        let env: HashMap<&str, &str> = [
            ("WARDEN_BASE_DIR", "/data"),
            ("WARDEN_MAX_BYTES", "2048"),
            ("WARDEN_RATE_REFILL", "2.5"),
        ]
        .into_iter()
        .collect();

        let config = GatewayConfig::default()
            .apply_env_from(|key| env.get(key).map(|v| (*v).to_string()))
            .unwrap();
        assert_eq!(config.base_dir, PathBuf::from("/data"));
        assert_eq!(config.quota.max_bytes, 2048);
        assert_eq!(config.rate.refill_per_sec, 2.5);
    }

    #[test]
    fn test_config_env_invalid() {
        let result = GatewayConfig::default().apply_env_from(|key| {
            (key == "WARDEN_MAX_FILES").then(|| "lots".to_string())
        });
        assert!(matches!(result, Err(ConfigError::Env { .. })));
    }

    #[test]
    fn test_config_validate() {
        assert!(GatewayConfig::default().with_rate(0, 1.0).validate().is_err());
        assert!(GatewayConfig::default().with_rate(1, 0.0).validate().is_err());
        assert!(GatewayConfig::default().with_rate(1, f64::NAN).validate().is_err());
        assert!(GatewayConfig::default().with_lock_timeout(0).validate().is_err());

        let bad_override = GatewayConfig::default().with_tenant(
            "t",
            TenantOverrides {
                rate_capacity: Some(0),
                ..Default::default()
            },
        );
        assert!(bad_override.validate().is_err());
    }

    #[test]
    fn test_limits_for_tenant() {
        let config = GatewayConfig::default().with_quota(1000, 10).with_tenant(
            "vip",
            TenantOverrides {
                max_bytes: Some(5000),
                rate_capacity: Some(99),
                ..Default::default()
            },
        );

        let vip = config.limits_for(&TenantId::new("vip").unwrap());
        assert_eq!(vip.quota.max_bytes, 5000);
        assert_eq!(vip.quota.max_files, 10);
        assert_eq!(vip.rate.capacity, 99);

        let other = config.limits_for(&TenantId::new("other").unwrap());
        assert_eq!(other.quota.max_bytes, 1000);
        assert_eq!(other.rate, RateConfig::default());
    }
}
