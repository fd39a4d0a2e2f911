//! Workspace Gateway.
//!
//! Every operation follows the same skeleton: rate check, lexical path
//! check, tenant initialization, link verification, then for mutations
//! lock and quota reservation, the storage call, and commit or release.
//! Locks and reservations are guards, so any early return (or a dropped
//! future) undoes them.

use crate::error::OpenError;
use crate::types::{
    DeleteReceipt, DirReceipt, FileStat, ListEntry, ListOptions, Listing, ReadOptions, ReadResult,
    SearchMatch, SearchOptions, SearchResult, TransferReceipt, UsageReport, WriteReceipt,
};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};
use warden_core::{
    Clock, ContentDigest, GatewayConfig, SystemClock, TenantId, WardenError, WardenResult,
};
use warden_policy::{
    AdmissionFilter, PathResolver, QuotaTracker, RateLimiter, Reservation, ResolvedPath,
};
use warden_runtime::{LockStats, LockTimeout, MutationCoordinator, PathLockGuard};
use warden_storage::{EntryKind, LocalStorage, Metadata, StorageBackend, StorageError, StorageResult};

/// Audit log target
pub const AUDIT_TARGET: &str = "warden::audit";

trait StorageResultExt<T> {
    /// Attach the tenant-relative path of `at` to a storage failure
    fn at(self, at: &ResolvedPath) -> WardenResult<T>;
}

impl<T> StorageResultExt<T> for StorageResult<T> {
    fn at(self, at: &ResolvedPath) -> WardenResult<T> {
        self.map_err(|e| e.into_warden(&at.relative().to_string()))
    }
}

fn lock_error(at: &ResolvedPath) -> impl FnOnce(LockTimeout) -> WardenError + '_ {
    move |e| e.into_warden(&at.relative().to_string())
}

fn signed(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn display_name(path: &ResolvedPath) -> String {
    path.relative().file_name().unwrap_or_else(|| ".".to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    Replace,
    Append,
}

/// Builder for [`Gateway`]
#[derive(Debug)]
pub struct GatewayBuilder {
    config: GatewayConfig,
    backend: Option<Arc<dyn StorageBackend>>,
    clock: Option<Arc<dyn Clock>>,
}

impl GatewayBuilder {
    /// Start from a configuration
    #[must_use]
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            backend: None,
            clock: None,
        }
    }

    /// Use a storage backend other than the local disk
    #[must_use]
    pub fn with_backend(mut self, backend: Arc<dyn StorageBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Use a clock other than the system clock for rate limiting
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Validate the configuration and prepare the base directory
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid or the base directory
    /// cannot be created
    pub async fn open(self) -> Result<Gateway, OpenError> {
        let config = self.config;
        config.validate()?;
        let backend = self
            .backend
            .unwrap_or_else(|| Arc::new(LocalStorage::new()));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock::new()));

        backend.create_dir_all(&config.base_dir).await?;
        let base_dir = backend.canonicalize(&config.base_dir).await?;

        let mut quota = QuotaTracker::new(config.quota);
        let mut rate = RateLimiter::new(config.rate, clock);
        for (tenant, limits) in config.overridden_limits() {
            quota = quota.with_tenant(tenant, limits.quota);
            rate = rate.with_tenant(tenant, limits.rate);
        }

        tracing::info!(
            base_dir = %base_dir.display(),
            tenants_configured = config.tenants.len(),
            "gateway opened"
        );

        Ok(Gateway {
            resolver: PathResolver::new(base_dir, backend.clone()),
            coordinator: MutationCoordinator::new(config.lock_timeout()),
            filter: AdmissionFilter::from_config(&config),
            quota,
            rate,
            backend,
            tenants: RwLock::new(HashMap::new()),
            config,
        })
    }
}

/// Tenant-isolated filesystem gateway
pub struct Gateway {
    config: GatewayConfig,
    backend: Arc<dyn StorageBackend>,
    resolver: PathResolver,
    quota: QuotaTracker,
    rate: RateLimiter,
    coordinator: MutationCoordinator,
    filter: AdmissionFilter,
    tenants: RwLock<HashMap<TenantId, Arc<OnceCell<()>>>>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("base_dir", &self.resolver.base_dir())
            .field("backend", &self.backend)
            .finish_non_exhaustive()
    }
}

impl Gateway {
    /// Builder
    #[must_use]
    pub fn builder(config: GatewayConfig) -> GatewayBuilder {
        GatewayBuilder::new(config)
    }

    /// Open a gateway over the local disk
    ///
    /// # Errors
    ///
    /// See [`GatewayBuilder::open`]
    pub async fn open(config: GatewayConfig) -> Result<Self, OpenError> {
        GatewayBuilder::new(config).open().await
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Lock table metrics
    #[must_use]
    pub fn lock_stats(&self) -> LockStats {
        self.coordinator.stats()
    }

    // ---- plumbing ----

    async fn io<T>(&self, fut: impl Future<Output = StorageResult<T>>) -> StorageResult<T> {
        match tokio::time::timeout(self.config.io_timeout(), fut).await {
            Ok(result) => result,
            Err(_) => Err(StorageError::TimedOut),
        }
    }

    async fn verify(&self, path: &ResolvedPath) -> WardenResult<ResolvedPath> {
        match tokio::time::timeout(self.config.io_timeout(), self.resolver.verify(path)).await {
            Ok(result) => result,
            Err(_) => Err(StorageError::TimedOut.into_warden(&path.relative().to_string())),
        }
    }

    /// Verify again under the lock; the canonical path must not have moved
    async fn recheck(&self, path: &ResolvedPath) -> WardenResult<ResolvedPath> {
        let current = self.verify(path).await?;
        if current.absolute() != path.absolute() {
            tracing::debug!(path = %path.relative(), "canonical path changed under lock");
            return Err(WardenError::storage("path changed during operation"));
        }
        Ok(current)
    }

    async fn ensure_tenant(&self, tenant: &TenantId) -> WardenResult<()> {
        let existing = self.tenants.read().await.get(tenant).cloned();
        let cell = match existing {
            Some(cell) => cell,
            None => self
                .tenants
                .write()
                .await
                .entry(tenant.clone())
                .or_default()
                .clone(),
        };
        cell.get_or_try_init(|| self.init_tenant(tenant))
            .await
            .map(|_| ())
    }

    /// Create the sandbox root, drop scratch files an earlier process left
    /// behind and seed quota from what is already on disk
    async fn init_tenant(&self, tenant: &TenantId) -> WardenResult<()> {
        let root = self.resolver.sandbox_root(tenant);
        self.io(self.backend.create_dir_all(&root))
            .await
            .map_err(|e| e.into_warden("."))?;
        let swept = self
            .io(self.backend.sweep_scratch(&root))
            .await
            .map_err(|e| e.into_warden("."))?;
        if swept > 0 {
            tracing::warn!(%tenant, swept, "removed leftover scratch files");
        }
        let usage = self
            .io(self.backend.tree_usage(&root))
            .await
            .map_err(|e| e.into_warden("."))?;
        self.quota.seed(tenant, usage.bytes, usage.files).await;
        tracing::info!(%tenant, bytes = usage.bytes, files = usage.files, "tenant sandbox ready");
        Ok(())
    }

    async fn enter(&self, tenant: &TenantId, path: &str) -> WardenResult<ResolvedPath> {
        self.rate.check(tenant, 1).await?;
        let lexical = self.resolver.lexical(tenant, path)?;
        self.ensure_tenant(tenant).await?;
        self.verify(&lexical).await
    }

    async fn enter_pair(
        &self,
        tenant: &TenantId,
        from: &str,
        to: &str,
    ) -> WardenResult<(ResolvedPath, ResolvedPath)> {
        self.rate.check(tenant, 1).await?;
        let from = self.resolver.lexical(tenant, from)?;
        let to = self.resolver.lexical(tenant, to)?;
        self.ensure_tenant(tenant).await?;
        Ok((self.verify(&from).await?, self.verify(&to).await?))
    }

    /// Metadata of a path that may not exist; directories are refused
    async fn existing_file(&self, path: &ResolvedPath) -> WardenResult<Option<Metadata>> {
        match self.io(self.backend.metadata(path.absolute())).await {
            Ok(meta) if meta.is_dir() => Err(WardenError::IsADirectory {
                path: path.relative().to_string(),
            }),
            Ok(meta) => Ok(Some(meta)),
            Err(StorageError::NotFound) => Ok(None),
            Err(e) => Err(e.into_warden(&path.relative().to_string())),
        }
    }

    async fn ensure_parent(&self, path: &ResolvedPath) -> WardenResult<()> {
        match path.absolute().parent() {
            Some(parent) if !path.is_root() => self
                .io(self.backend.create_dir_all(parent))
                .await
                .at(path),
            _ => Ok(()),
        }
    }

    /// Re-walk the sandbox after a mutation whose effect on disk is unknown.
    ///
    /// A storage call that timed out keeps running on the blocking pool and
    /// may still land, so the count is taken with the tenant's subtree lock
    /// held exclusively: every other mutation has drained first.
    async fn settle(&self, tenant: &TenantId, guard: PathLockGuard) {
        let _exclusive = if guard.is_exclusive() {
            guard
        } else {
            drop(guard);
            match self.coordinator.acquire_subtree(tenant).await {
                Ok(exclusive) => exclusive,
                Err(e) => {
                    tracing::warn!(%tenant, waited_ms = e.waited_ms, "quota reseed skipped, subtree busy");
                    return;
                }
            }
        };

        let root = self.resolver.sandbox_root(tenant);
        if let Err(e) = self.io(self.backend.sweep_scratch(&root)).await {
            tracing::warn!(%tenant, error = %e, "scratch sweep failed");
        }
        match self.io(self.backend.tree_usage(&root)).await {
            Ok(usage) => {
                self.quota.seed(tenant, usage.bytes, usage.files).await;
                tracing::info!(%tenant, bytes = usage.bytes, files = usage.files, "quota reseeded");
            }
            Err(e) => tracing::warn!(%tenant, error = %e, "quota reseed failed"),
        }
    }

    /// Give up on a failed mutating storage call. The claim is returned
    /// first; a timeout then triggers [`Gateway::settle`].
    async fn abandon(
        &self,
        tenant: &TenantId,
        guard: PathLockGuard,
        reservation: Reservation,
        err: StorageError,
        at: &ResolvedPath,
    ) -> WardenError {
        reservation.release();
        if err == StorageError::TimedOut {
            self.settle(tenant, guard).await;
        }
        err.into_warden(&at.relative().to_string())
    }

    fn finish<T>(
        &self,
        tenant: &TenantId,
        op: &'static str,
        result: WardenResult<T>,
    ) -> WardenResult<T> {
        match &result {
            Err(WardenError::PathEscape { path }) => {
                tracing::warn!(target: AUDIT_TARGET, %tenant, op, path = %path, "sandbox escape rejected");
            }
            Err(WardenError::LockTimeout { path, waited_ms }) => {
                let stats = self.lock_stats();
                tracing::warn!(
                    %tenant,
                    op,
                    path = %path,
                    waited_ms,
                    mean_wait_us = u64::try_from(stats.mean_wait().as_micros()).unwrap_or(u64::MAX),
                    timeout_rate = stats.timeout_rate(),
                    tracked_paths = stats.tracked_paths,
                    "lock contention"
                );
            }
            Err(err) => tracing::debug!(%tenant, op, code = %err.code(), error = %err, "operation failed"),
            Ok(_) => tracing::trace!(%tenant, op, "operation complete"),
        }
        result
    }

    // ---- read-only operations ----

    /// Describe a file or directory
    ///
    /// # Errors
    ///
    /// `PathEscape`, `InvalidPath`, `NotFound`, `RateLimited`, `StorageError`
    pub async fn stat(&self, tenant: &TenantId, path: &str) -> WardenResult<FileStat> {
        let result = self.stat_inner(tenant, path).await;
        self.finish(tenant, "stat", result)
    }

    async fn stat_inner(&self, tenant: &TenantId, path: &str) -> WardenResult<FileStat> {
        let resolved = self.enter(tenant, path).await?;
        let meta = self
            .io(self.backend.metadata(resolved.absolute()))
            .await
            .at(&resolved)?;
        let entries = if meta.is_dir() {
            let entries = self
                .io(self.backend.read_dir(resolved.absolute()))
                .await
                .at(&resolved)?;
            Some(entries.len() as u64)
        } else {
            None
        };
        Ok(FileStat::new(
            resolved.relative().to_string(),
            display_name(&resolved),
            &meta,
            entries,
        ))
    }

    /// List a directory
    ///
    /// # Errors
    ///
    /// `PathEscape`, `InvalidPath`, `NotFound`, `NotADirectory`, `RateLimited`,
    /// `StorageError`
    pub async fn list(
        &self,
        tenant: &TenantId,
        path: &str,
        options: ListOptions,
    ) -> WardenResult<Listing> {
        let result = self.list_inner(tenant, path, options).await;
        self.finish(tenant, "list", result)
    }

    async fn list_inner(
        &self,
        tenant: &TenantId,
        path: &str,
        options: ListOptions,
    ) -> WardenResult<Listing> {
        let resolved = self.enter(tenant, path).await?;
        let meta = self
            .io(self.backend.metadata(resolved.absolute()))
            .await
            .at(&resolved)?;
        if !meta.is_dir() {
            return Err(WardenError::NotADirectory {
                path: resolved.relative().to_string(),
            });
        }

        let all = self
            .io(self.backend.read_dir(resolved.absolute()))
            .await
            .at(&resolved)?;
        let mut entries = Vec::new();
        let mut truncated = false;
        for entry in all
            .into_iter()
            .filter(|e| options.show_hidden || !e.name.starts_with('.'))
        {
            if entries.len() >= options.max_items {
                truncated = true;
                break;
            }
            entries.push(ListEntry::new(entry.name, &entry.metadata));
        }

        Ok(Listing {
            path: resolved.relative().to_string(),
            entries,
            truncated,
        })
    }

    /// Read a whole file
    ///
    /// # Errors
    ///
    /// `PathEscape`, `InvalidPath`, `NotFound`, `IsADirectory`,
    /// `FileTypeNotAllowed`, `FileTooLarge`, `RateLimited`, `StorageError`
    pub async fn read(&self, tenant: &TenantId, path: &str) -> WardenResult<ReadResult> {
        self.read_with(tenant, path, ReadOptions::default()).await
    }

    /// Read a file, optionally only its first lines
    ///
    /// # Errors
    ///
    /// Same as [`Gateway::read`]
    pub async fn read_with(
        &self,
        tenant: &TenantId,
        path: &str,
        options: ReadOptions,
    ) -> WardenResult<ReadResult> {
        let result = self.read_inner(tenant, path, options).await;
        self.finish(tenant, "read", result)
    }

    async fn read_inner(
        &self,
        tenant: &TenantId,
        path: &str,
        options: ReadOptions,
    ) -> WardenResult<ReadResult> {
        let resolved = self.enter(tenant, path).await?;
        let meta = self
            .io(self.backend.metadata(resolved.absolute()))
            .await
            .at(&resolved)?;
        if meta.is_dir() {
            return Err(WardenError::IsADirectory {
                path: resolved.relative().to_string(),
            });
        }
        self.filter.check_name(&display_name(&resolved))?;
        self.filter.check_size(meta.len)?;

        let mut content = self
            .io(self.backend.read(resolved.absolute()))
            .await
            .at(&resolved)?;
        let size = content.len() as u64;
        self.filter.check_size(size)?;

        let digest = ContentDigest::compute(&content);
        let cut = options.cut(&content);
        let truncated = cut < content.len();
        content.truncate(cut);

        Ok(ReadResult {
            path: resolved.relative().to_string(),
            content,
            size,
            digest,
            truncated,
        })
    }

    /// Find entries below a directory whose name matches a glob
    ///
    /// Symbolic links are reported but never descended into.
    ///
    /// # Errors
    ///
    /// `PathEscape`, `InvalidPath` (including a malformed pattern),
    /// `NotFound`, `NotADirectory`, `RateLimited`, `StorageError`
    pub async fn search(
        &self,
        tenant: &TenantId,
        path: &str,
        options: &SearchOptions,
    ) -> WardenResult<SearchResult> {
        let result = self.search_inner(tenant, path, options).await;
        self.finish(tenant, "search", result)
    }

    async fn search_inner(
        &self,
        tenant: &TenantId,
        path: &str,
        options: &SearchOptions,
    ) -> WardenResult<SearchResult> {
        let resolved = self.enter(tenant, path).await?;
        let pattern = glob::Pattern::new(&options.pattern)
            .map_err(|e| WardenError::invalid_path(&options.pattern, e.msg))?;
        let meta = self
            .io(self.backend.metadata(resolved.absolute()))
            .await
            .at(&resolved)?;
        if !meta.is_dir() {
            return Err(WardenError::NotADirectory {
                path: resolved.relative().to_string(),
            });
        }

        let mut matches = Vec::new();
        let mut truncated = false;
        let mut pending = VecDeque::from([resolved.clone()]);
        'walk: while let Some(dir) = pending.pop_front() {
            let entries = match self.io(self.backend.read_dir(dir.absolute())).await {
                Ok(entries) => entries,
                // Removed while walking
                Err(StorageError::NotFound) if dir != resolved => continue,
                Err(e) => return Err(e.into_warden(&dir.relative().to_string())),
            };
            for entry in entries {
                let child = dir.child(&entry.name);
                if entry.metadata.is_dir() {
                    pending.push_back(child.clone());
                }
                if options.files_only && !entry.metadata.is_file() {
                    continue;
                }
                if !pattern.matches(&entry.name) {
                    continue;
                }
                if matches.len() >= options.max_results {
                    truncated = true;
                    break 'walk;
                }
                let listed = ListEntry::new(entry.name, &entry.metadata);
                matches.push(SearchMatch {
                    path: child.relative().to_string(),
                    kind: listed.kind,
                    size: listed.size,
                    modified: listed.modified,
                });
            }
        }
        matches.sort_by(|a, b| a.path.cmp(&b.path));

        Ok(SearchResult {
            directory: resolved.relative().to_string(),
            pattern: options.pattern.clone(),
            matches,
            truncated,
        })
    }

    /// Quota and rate state of a tenant
    ///
    /// # Errors
    ///
    /// `StorageError` if the tenant's sandbox cannot be initialized
    pub async fn usage(&self, tenant: &TenantId) -> WardenResult<UsageReport> {
        let result = self.usage_inner(tenant).await;
        self.finish(tenant, "usage", result)
    }

    async fn usage_inner(&self, tenant: &TenantId) -> WardenResult<UsageReport> {
        self.ensure_tenant(tenant).await?;
        let quota = self.quota.usage(tenant).await;
        let bucket = self.rate.state(tenant).await;
        Ok(UsageReport {
            tenant: tenant.to_string(),
            bytes_used: quota.bytes_used,
            file_count: quota.file_count,
            reserved_bytes: quota.reserved_bytes,
            reserved_files: quota.reserved_files,
            limits: quota.limits,
            rate_tokens: bucket.tokens,
            rate_capacity: bucket.capacity,
            max_file_size: self.config.max_file_size,
            allowed_extensions: self
                .config
                .allowed_extensions
                .as_ref()
                .map(|set| set.iter().cloned().collect()),
        })
    }

    // ---- mutating operations ----

    /// Replace a file's content, creating it and any missing parents
    ///
    /// # Errors
    ///
    /// `PathEscape`, `InvalidPath`, `IsADirectory`, `FileTypeNotAllowed`,
    /// `FileTooLarge`, `QuotaExceeded`, `LockTimeout`, `RateLimited`,
    /// `StorageError`
    pub async fn write(
        &self,
        tenant: &TenantId,
        path: &str,
        data: &[u8],
    ) -> WardenResult<WriteReceipt> {
        let result = self.write_inner(tenant, path, data, WriteMode::Replace).await;
        self.finish(tenant, "write", result)
    }

    /// Append to a file, creating it and any missing parents
    ///
    /// # Errors
    ///
    /// Same as [`Gateway::write`]
    pub async fn append(
        &self,
        tenant: &TenantId,
        path: &str,
        data: &[u8],
    ) -> WardenResult<WriteReceipt> {
        let result = self.write_inner(tenant, path, data, WriteMode::Append).await;
        self.finish(tenant, "append", result)
    }

    async fn write_inner(
        &self,
        tenant: &TenantId,
        path: &str,
        data: &[u8],
        mode: WriteMode,
    ) -> WardenResult<WriteReceipt> {
        let resolved = self.enter(tenant, path).await?;
        if resolved.is_root() {
            return Err(WardenError::IsADirectory {
                path: resolved.relative().to_string(),
            });
        }
        self.filter.check_name(&display_name(&resolved))?;
        self.filter.check_size(data.len() as u64)?;

        let guard = self
            .coordinator
            .acquire(tenant, resolved.absolute())
            .await
            .map_err(lock_error(&resolved))?;
        let target = self.recheck(&resolved).await?;

        let existing = self.existing_file(&target).await?;
        let old_len = existing.as_ref().map_or(0, |meta| meta.len);
        let written = data.len() as u64;
        let size = match mode {
            WriteMode::Replace => written,
            WriteMode::Append => old_len + written,
        };
        self.filter.check_size(size)?;

        let reservation = self
            .quota
            .reserve(
                tenant,
                signed(size) - signed(old_len),
                i64::from(existing.is_none()),
            )
            .await?;
        if existing.is_none() {
            self.ensure_parent(&target).await?;
        }
        let stored = match mode {
            WriteMode::Replace => self.io(self.backend.write(target.absolute(), data)).await,
            WriteMode::Append => self.io(self.backend.append(target.absolute(), data)).await,
        };
        if let Err(e) = stored {
            return Err(self.abandon(tenant, guard, reservation, e, &target).await);
        }
        reservation.commit();

        Ok(WriteReceipt {
            path: target.relative().to_string(),
            size,
            bytes_written: written,
            digest: ContentDigest::compute(data),
            created: existing.is_none(),
        })
    }

    /// Remove a file or directory
    ///
    /// # Errors
    ///
    /// `PathEscape`, `InvalidPath` (the sandbox root), `NotFound`,
    /// `DirectoryNotEmpty`, `LockTimeout`, `RateLimited`, `StorageError`
    pub async fn delete(
        &self,
        tenant: &TenantId,
        path: &str,
        recursive: bool,
    ) -> WardenResult<DeleteReceipt> {
        let result = self.delete_inner(tenant, path, recursive).await;
        self.finish(tenant, "delete", result)
    }

    async fn delete_inner(
        &self,
        tenant: &TenantId,
        path: &str,
        recursive: bool,
    ) -> WardenResult<DeleteReceipt> {
        let resolved = self.enter(tenant, path).await?;
        if resolved.is_root() {
            return Err(WardenError::invalid_path(
                path,
                "cannot delete the sandbox root",
            ));
        }

        let guard = if recursive {
            self.coordinator.acquire_subtree(tenant).await
        } else {
            self.coordinator.acquire(tenant, resolved.absolute()).await
        }
        .map_err(lock_error(&resolved))?;
        let target = self.recheck(&resolved).await?;
        let meta = self
            .io(self.backend.metadata(target.absolute()))
            .await
            .at(&target)?;

        let (bytes_freed, files_removed) = if !meta.is_dir() {
            let reservation = self.quota.reserve(tenant, -signed(meta.len), -1).await?;
            if let Err(e) = self.io(self.backend.remove_file(target.absolute())).await {
                return Err(self.abandon(tenant, guard, reservation, e, &target).await);
            }
            reservation.commit();
            (meta.len, 1)
        } else if recursive {
            let usage = self
                .io(self.backend.tree_usage(target.absolute()))
                .await
                .at(&target)?;
            let reservation = self
                .quota
                .reserve(tenant, -signed(usage.bytes), -signed(usage.files))
                .await?;
            if let Err(e) = self.io(self.backend.remove_dir_all(target.absolute())).await {
                // Part of the tree may already be gone
                reservation.release();
                self.settle(tenant, guard).await;
                return Err(e.into_warden(&target.relative().to_string()));
            }
            reservation.commit();
            (usage.bytes, usage.files)
        } else {
            self.io(self.backend.remove_dir(target.absolute()))
                .await
                .at(&target)?;
            (0, 0)
        };

        tracing::debug!(%tenant, path = %target.relative(), bytes_freed, files_removed, "deleted");
        Ok(DeleteReceipt {
            path: target.relative().to_string(),
            kind: meta.kind,
            bytes_freed,
            files_removed,
        })
    }

    /// Move a file or directory.
    ///
    /// An existing destination file is replaced. Moving a path onto itself
    /// succeeds without change.
    ///
    /// # Errors
    ///
    /// `PathEscape` (either side), `InvalidPath`, `NotFound`, `IsADirectory`,
    /// `NotADirectory`, `FileTypeNotAllowed`, `QuotaExceeded`, `LockTimeout`,
    /// `RateLimited`, `StorageError`
    pub async fn r#move(
        &self,
        tenant: &TenantId,
        from: &str,
        to: &str,
    ) -> WardenResult<TransferReceipt> {
        let result = self.move_inner(tenant, from, to).await;
        self.finish(tenant, "move", result)
    }

    async fn move_inner(
        &self,
        tenant: &TenantId,
        from: &str,
        to: &str,
    ) -> WardenResult<TransferReceipt> {
        let (src, dst) = self.enter_pair(tenant, from, to).await?;
        if src.is_root() {
            return Err(WardenError::invalid_path(from, "cannot move the sandbox root"));
        }
        let initial = self
            .io(self.backend.metadata(src.absolute()))
            .await
            .at(&src)?;

        // Directory moves cover a whole subtree
        let mut guard = if initial.is_dir() {
            self.coordinator.acquire_subtree(tenant).await
        } else {
            self.coordinator
                .acquire_pair(tenant, src.absolute(), dst.absolute())
                .await
        }
        .map_err(lock_error(&src))?;
        let mut src = self.recheck(&src).await?;
        let mut dst = self.recheck(&dst).await?;
        let mut src_meta = self
            .io(self.backend.metadata(src.absolute()))
            .await
            .at(&src)?;
        if src_meta.is_dir() && !guard.is_exclusive() {
            // Replaced by a directory before the locks were taken
            drop(guard);
            guard = self
                .coordinator
                .acquire_subtree(tenant)
                .await
                .map_err(lock_error(&src))?;
            src = self.recheck(&src).await?;
            dst = self.recheck(&dst).await?;
            src_meta = self
                .io(self.backend.metadata(src.absolute()))
                .await
                .at(&src)?;
        }
        let receipt = |replaced| TransferReceipt {
            from: src.relative().to_string(),
            to: dst.relative().to_string(),
            kind: src_meta.kind,
            bytes_copied: 0,
            replaced,
        };

        if src.absolute() == dst.absolute() {
            return Ok(receipt(false));
        }
        if src_meta.is_dir() && dst.absolute().starts_with(src.absolute()) {
            return Err(WardenError::invalid_path(
                to,
                "cannot move a directory into itself",
            ));
        }
        if src_meta.is_file() {
            self.filter.check_name(&display_name(&dst))?;
        }

        let replaced = self.existing_file(&dst).await?;
        if replaced.is_some() && src_meta.is_dir() {
            return Err(WardenError::NotADirectory {
                path: dst.relative().to_string(),
            });
        }
        let reservation = match &replaced {
            Some(meta) => self.quota.reserve(tenant, -signed(meta.len), -1).await?,
            None => self.quota.reserve(tenant, 0, 0).await?,
        };
        if replaced.is_none() {
            self.ensure_parent(&dst).await?;
        }
        if let Err(e) = self.io(self.backend.rename(src.absolute(), dst.absolute())).await {
            return Err(self.abandon(tenant, guard, reservation, e, &src).await);
        }
        reservation.commit();

        Ok(receipt(replaced.is_some()))
    }

    /// Copy a file; an existing destination file is replaced
    ///
    /// # Errors
    ///
    /// `PathEscape` (either side), `InvalidPath`, `NotFound`, `IsADirectory`,
    /// `FileTypeNotAllowed`, `FileTooLarge`, `QuotaExceeded`, `LockTimeout`,
    /// `RateLimited`, `StorageError`
    pub async fn copy(
        &self,
        tenant: &TenantId,
        from: &str,
        to: &str,
    ) -> WardenResult<TransferReceipt> {
        let result = self.copy_inner(tenant, from, to).await;
        self.finish(tenant, "copy", result)
    }

    async fn copy_inner(
        &self,
        tenant: &TenantId,
        from: &str,
        to: &str,
    ) -> WardenResult<TransferReceipt> {
        let (src, dst) = self.enter_pair(tenant, from, to).await?;
        self.filter.check_name(&display_name(&dst))?;

        let guard = self
            .coordinator
            .acquire_pair(tenant, src.absolute(), dst.absolute())
            .await
            .map_err(lock_error(&src))?;
        let src = self.recheck(&src).await?;
        let dst = self.recheck(&dst).await?;

        let src_meta = self
            .io(self.backend.metadata(src.absolute()))
            .await
            .at(&src)?;
        if src_meta.is_dir() {
            return Err(WardenError::IsADirectory {
                path: src.relative().to_string(),
            });
        }
        if src.absolute() == dst.absolute() {
            return Err(WardenError::invalid_path(
                to,
                "source and destination are the same file",
            ));
        }
        self.filter.check_size(src_meta.len)?;

        let existing = self.existing_file(&dst).await?;
        let old_len = existing.as_ref().map_or(0, |meta| meta.len);
        let data = self.io(self.backend.read(src.absolute())).await.at(&src)?;
        let size = data.len() as u64;
        self.filter.check_size(size)?;

        let reservation = self
            .quota
            .reserve(
                tenant,
                signed(size) - signed(old_len),
                i64::from(existing.is_none()),
            )
            .await?;
        if existing.is_none() {
            self.ensure_parent(&dst).await?;
        }
        if let Err(e) = self.io(self.backend.write(dst.absolute(), &data)).await {
            return Err(self.abandon(tenant, guard, reservation, e, &dst).await);
        }
        reservation.commit();

        Ok(TransferReceipt {
            from: src.relative().to_string(),
            to: dst.relative().to_string(),
            kind: EntryKind::File,
            bytes_copied: size,
            replaced: existing.is_some(),
        })
    }

    /// Create a directory
    ///
    /// # Errors
    ///
    /// `PathEscape`, `InvalidPath`, `AlreadyExists`, `NotFound` (missing
    /// parent without `parents`), `NotADirectory`, `LockTimeout`,
    /// `RateLimited`, `StorageError`
    pub async fn create_dir(
        &self,
        tenant: &TenantId,
        path: &str,
        parents: bool,
    ) -> WardenResult<DirReceipt> {
        let result = self.create_dir_inner(tenant, path, parents).await;
        self.finish(tenant, "create_dir", result)
    }

    async fn create_dir_inner(
        &self,
        tenant: &TenantId,
        path: &str,
        parents: bool,
    ) -> WardenResult<DirReceipt> {
        let resolved = self.enter(tenant, path).await?;
        let already = || WardenError::AlreadyExists {
            path: resolved.relative().to_string(),
        };
        if resolved.is_root() {
            return Err(already());
        }

        let _guard = self
            .coordinator
            .acquire(tenant, resolved.absolute())
            .await
            .map_err(lock_error(&resolved))?;
        let target = self.recheck(&resolved).await?;
        match self.io(self.backend.metadata(target.absolute())).await {
            Ok(_) => return Err(already()),
            Err(StorageError::NotFound) => {}
            Err(e) => return Err(e.into_warden(&target.relative().to_string())),
        }

        let created = if parents {
            self.io(self.backend.create_dir_all(target.absolute())).await
        } else {
            self.io(self.backend.create_dir(target.absolute())).await
        };
        created.at(&target)?;
        let meta = self
            .io(self.backend.metadata(target.absolute()))
            .await
            .at(&target)?;

        Ok(DirReceipt {
            path: target.relative().to_string(),
            permissions: meta.permissions.map(|mode| format!("{mode:o}")),
        })
    }
}
