//! Path Resolver.
//!
//! Resolution runs in two phases. [`PathResolver::lexical`] normalizes the
//! caller's path without touching storage, so `../tenantB/secret.txt` is
//! rejected before any filesystem access. [`PathResolver::verify`] then
//! resolves the symbolic links actually present on disk and re-checks that
//! the result still lies under the tenant's sandbox root.
//!
//! A resolved path is only valid for the operation that immediately
//! follows; the gateway re-verifies before every storage call.

use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use warden_core::{TenantId, WardenError, WardenResult};
use warden_storage::{SCRATCH_PREFIX, StorageBackend, StorageError};

/// Lexically normalized tenant-relative path.
///
/// Contains only normal components; the empty path denotes the sandbox
/// root itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelativePath(PathBuf);

impl RelativePath {
    /// The sandbox root
    #[must_use]
    pub fn root() -> Self {
        Self(PathBuf::new())
    }

    /// Parse and normalize caller input
    ///
    /// # Errors
    ///
    /// Returns `InvalidPath` for empty, absolute or NUL-containing input or a
    /// component using the backend's reserved scratch prefix, and
    /// `PathEscape` if `..` segments climb above the root
    pub fn parse(raw: &str) -> WardenResult<Self> {
        if raw.is_empty() {
            return Err(WardenError::invalid_path(raw, "empty path"));
        }
        if raw.contains('\0') {
            return Err(WardenError::invalid_path(
                raw.replace('\0', "\\0"),
                "contains NUL byte",
            ));
        }

        let mut normalized = PathBuf::new();
        for component in Path::new(raw).components() {
            match component {
                Component::Prefix(_) | Component::RootDir => {
                    return Err(WardenError::invalid_path(raw, "absolute path"));
                }
                Component::CurDir => {}
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(WardenError::PathEscape {
                            path: raw.to_string(),
                        });
                    }
                }
                Component::Normal(name) => {
                    // Scratch entries are invisible to listings and usage walks
                    if name.to_string_lossy().starts_with(SCRATCH_PREFIX) {
                        return Err(WardenError::invalid_path(raw, "reserved name"));
                    }
                    normalized.push(name);
                }
            }
        }
        Ok(Self(normalized))
    }

    /// Whether this names the sandbox root
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0.as_os_str().is_empty()
    }

    /// Borrow as a relative `Path`
    #[must_use]
    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// Final component
    #[must_use]
    pub fn file_name(&self) -> Option<String> {
        self.0
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
    }

    /// Append one entry name
    #[must_use]
    pub fn join(&self, name: impl AsRef<Path>) -> Self {
        Self(self.0.join(name))
    }

    /// Whether `self` is `other` or lies beneath it
    #[must_use]
    pub fn starts_with(&self, other: &Self) -> bool {
        self.0.starts_with(&other.0)
    }
}

impl fmt::Display for RelativePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            return f.write_str(".");
        }
        let mut first = true;
        for component in self.0.components() {
            if !first {
                f.write_str("/")?;
            }
            write!(f, "{}", component.as_os_str().to_string_lossy())?;
            first = false;
        }
        Ok(())
    }
}

/// A tenant path mapped onto storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    root: PathBuf,
    absolute: PathBuf,
    relative: RelativePath,
}

impl ResolvedPath {
    /// Absolute storage path; canonical once verified
    #[must_use]
    pub fn absolute(&self) -> &Path {
        &self.absolute
    }

    /// Tenant-relative form, safe to show the caller
    #[must_use]
    pub fn relative(&self) -> &RelativePath {
        &self.relative
    }

    /// The tenant's sandbox root
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether the path is the sandbox root itself
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.absolute == self.root
    }

    /// Re-anchor a lexical child of this path
    #[must_use]
    pub fn child(&self, name: &str) -> Self {
        Self {
            root: self.root.clone(),
            absolute: self.absolute.join(name),
            relative: self.relative.join(name),
        }
    }
}

/// Maps tenant-relative paths into sandbox roots under a base directory
#[derive(Debug, Clone)]
pub struct PathResolver {
    base_dir: PathBuf,
    backend: Arc<dyn StorageBackend>,
}

impl PathResolver {
    /// Create a resolver; `base_dir` must already be canonical
    #[must_use]
    pub fn new(base_dir: impl Into<PathBuf>, backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            base_dir: base_dir.into(),
            backend,
        }
    }

    /// Canonical base directory
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Sandbox root of a tenant
    #[must_use]
    pub fn sandbox_root(&self, tenant: &TenantId) -> PathBuf {
        self.base_dir.join(tenant.sandbox_key())
    }

    /// Phase one: lexical normalization, no storage access
    ///
    /// # Errors
    ///
    /// Returns `InvalidPath` or `PathEscape`, see [`RelativePath::parse`]
    pub fn lexical(&self, tenant: &TenantId, raw: &str) -> WardenResult<ResolvedPath> {
        let relative = RelativePath::parse(raw)?;
        let root = self.sandbox_root(tenant);
        Ok(ResolvedPath {
            absolute: root.join(relative.as_path()),
            root,
            relative,
        })
    }

    /// Phase two: resolve links on disk and re-check containment.
    ///
    /// The deepest existing ancestor is canonicalized and the missing tail
    /// appended to it. A symbolic link anywhere on that tail which cannot be
    /// resolved is treated as an escape, since creating through it would
    /// land wherever it points.
    ///
    /// # Errors
    ///
    /// Returns `PathEscape` if the canonical path leaves the sandbox root
    pub async fn verify(&self, resolved: &ResolvedPath) -> WardenResult<ResolvedPath> {
        let escape = || WardenError::PathEscape {
            path: resolved.relative.to_string(),
        };

        let mut current = resolved.absolute.clone();
        let mut tail: Vec<OsString> = Vec::new();
        let canonical = loop {
            match self.backend.canonicalize(&current).await {
                Ok(canonical) => break canonical,
                Err(StorageError::NotFound | StorageError::NotADirectory)
                    if current != resolved.root =>
                {
                    if let Ok(meta) = self.backend.symlink_metadata(&current).await {
                        if meta.is_symlink() {
                            tracing::debug!(path = %resolved.relative, "dangling link on path");
                            return Err(escape());
                        }
                    }
                    let Some(name) = current.file_name() else {
                        return Err(escape());
                    };
                    tail.push(name.to_os_string());
                    current.pop();
                }
                Err(e) => return Err(e.into_warden(&resolved.relative.to_string())),
            }
        };

        if !canonical.starts_with(&resolved.root) {
            return Err(escape());
        }

        let mut absolute = canonical;
        for name in tail.iter().rev() {
            absolute.push(name);
        }
        Ok(ResolvedPath {
            root: resolved.root.clone(),
            absolute,
            relative: resolved.relative.clone(),
        })
    }

    /// Both phases
    ///
    /// # Errors
    ///
    /// Returns `InvalidPath`, `PathEscape`, or a storage failure
    pub async fn resolve(&self, tenant: &TenantId, raw: &str) -> WardenResult<ResolvedPath> {
        let lexical = self.lexical(tenant, raw)?;
        self.verify(&lexical).await
    }
}
