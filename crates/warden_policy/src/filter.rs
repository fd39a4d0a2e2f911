//! File admission filter: extension allowlist and per-file size ceiling.

use std::collections::BTreeSet;
use std::path::Path;
use warden_core::{GatewayConfig, WardenError, WardenResult};

/// Extension and size checks applied to file contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionFilter {
    allowed: Option<BTreeSet<String>>,
    max_file_size: u64,
}

impl AdmissionFilter {
    /// Create a filter; extensions are matched case-insensitively
    #[must_use]
    pub fn new(allowed: Option<BTreeSet<String>>, max_file_size: u64) -> Self {
        Self {
            allowed: allowed.map(|set| set.into_iter().map(|ext| ext.to_lowercase()).collect()),
            max_file_size,
        }
    }

    /// Build from gateway configuration
    #[must_use]
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self::new(config.allowed_extensions.clone(), config.max_file_size)
    }

    /// Largest admissible file
    #[must_use]
    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    /// Check a file name against the allowlist.
    ///
    /// The extension is taken from the final component. Dotfiles such as
    /// `.gitignore` have no extension and are matched by their whole name.
    ///
    /// # Errors
    ///
    /// Returns `FileTypeNotAllowed`
    pub fn check_name(&self, name: &str) -> WardenResult<()> {
        let Some(allowed) = &self.allowed else {
            return Ok(());
        };

        let file_name = Path::new(name)
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        let extension = Path::new(&file_name)
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy()))
            .unwrap_or_default();

        let whole_name_ok = file_name.starts_with('.') && allowed.contains(&file_name);
        if whole_name_ok || (!extension.is_empty() && allowed.contains(&extension)) {
            return Ok(());
        }
        Err(WardenError::FileTypeNotAllowed { extension })
    }

    /// Check the size a file would have
    ///
    /// # Errors
    ///
    /// Returns `FileTooLarge`
    pub fn check_size(&self, size: u64) -> WardenResult<()> {
        if size > self.max_file_size {
            return Err(WardenError::FileTooLarge {
                size,
                limit: self.max_file_size,
            });
        }
        Ok(())
    }
}

impl Default for AdmissionFilter {
    fn default() -> Self {
        Self::from_config(&GatewayConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_allowlist() {
        let filter = AdmissionFilter::default();
        assert!(filter.check_name("notes.txt").is_ok());
        assert!(filter.check_name("src/main.RS").is_ok());
        assert!(filter.check_name(".gitignore").is_ok());
        assert!(filter.check_name("config/.env.example").is_ok());
        assert!(filter.check_name("archive.tar.gz").is_ok());
    }

    #[test]
    fn test_rejected_names() {
        let filter = AdmissionFilter::default();
        assert_eq!(
            filter.check_name("payload.exe"),
            Err(WardenError::FileTypeNotAllowed {
                extension: ".exe".to_string()
            })
        );
        assert!(filter.check_name("Makefile").is_err());
        assert!(filter.check_name(".bashrc").is_err());
    }

    #[test]
    fn test_disabled_allowlist() {
        let filter = AdmissionFilter::new(None, 10);
        assert!(filter.check_name("anything.exe").is_ok());
        assert!(filter.check_name("Makefile").is_ok());
    }

    #[test]
    fn test_case_insensitive_config() {
        let allowed = [".TXT".to_string()].into_iter().collect();
        let filter = AdmissionFilter::new(Some(allowed), 10);
        assert!(filter.check_name("a.txt").is_ok());
        assert!(filter.check_name("a.Txt").is_ok());
    }

    #[test]
    fn test_size() {
        let filter = AdmissionFilter::new(None, 100);
        assert!(filter.check_size(100).is_ok());
        assert_eq!(
            filter.check_size(101),
            Err(WardenError::FileTooLarge {
                size: 101,
                limit: 100
            })
        );
    }
}
