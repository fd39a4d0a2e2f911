//! Mutation Coordinator.
//!
//! Serializes mutations per `(tenant, canonical path)`. Lock entries are
//! created on demand and removed as soon as no holder or waiter refers to
//! them, so the table only ever holds paths that are being mutated.
//!
//! Each tenant also has a subtree lock. Single-path mutations take it
//! shared, so disjoint paths never contend; operations that touch a whole
//! directory (recursive delete, directory move) take it exclusively.
//!
//! Acquisition is bounded by a timeout. Guards release on drop, which
//! covers success, failure and cancellation alike.

use crate::monitor::{LockMetrics, LockStats};
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{
    Mutex as AsyncMutex, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard,
    RwLock as AsyncRwLock,
};
use warden_core::{TenantId, WardenError};

/// Path lock key
type LockKey = (TenantId, PathBuf);

type Table<K, L> = Arc<Mutex<HashMap<K, Arc<L>>>>;

fn lock_table<K, L>(table: &Mutex<HashMap<K, Arc<L>>>) -> MutexGuard<'_, HashMap<K, Arc<L>>> {
    // The map is never left half-updated
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Reference to one table entry; removes the entry when it is the last
struct Slot<K: Eq + Hash, L> {
    key: K,
    lock: Arc<L>,
    table: Table<K, L>,
}

impl<K: Eq + Hash + Clone, L: Default> Slot<K, L> {
    fn checkout(table: &Table<K, L>, key: K) -> Self {
        let lock = lock_table(table).entry(key.clone()).or_default().clone();
        Self {
            key,
            lock,
            table: table.clone(),
        }
    }
}

impl<K: Eq + Hash, L> Drop for Slot<K, L> {
    fn drop(&mut self) {
        let mut table = lock_table(&self.table);
        // Other slots only appear via checkout, under the table lock. The
        // guard-held clones drop before their slot, so 2 means table + self
        // and no waiter can appear while we hold the table lock
        if Arc::strong_count(&self.lock) == 2
            && table
                .get(&self.key)
                .is_some_and(|current| Arc::ptr_eq(current, &self.lock))
        {
            table.remove(&self.key);
        }
    }
}

/// How a tenant's subtree lock is held
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubtreeMode {
    /// Alongside other single-path mutations
    Shared,
    /// Excluding every other mutation of the tenant
    Exclusive,
}

enum SubtreeHold {
    Shared(#[allow(dead_code)] OwnedRwLockReadGuard<()>),
    Exclusive(#[allow(dead_code)] OwnedRwLockWriteGuard<()>),
}

/// Held locks; released on drop
#[must_use = "locks are released when the guard is dropped"]
pub struct PathLockGuard {
    // Field order is drop order: path locks go before the subtree lock,
    // and each guard before its slot so the slot sees the final count
    paths: Vec<(OwnedMutexGuard<()>, Slot<LockKey, AsyncMutex<()>>)>,
    subtree: Option<(SubtreeHold, Slot<TenantId, AsyncRwLock<()>>)>,
}

impl PathLockGuard {
    /// Number of path locks held
    #[must_use]
    pub fn path_count(&self) -> usize {
        self.paths.len()
    }

    /// Whether the tenant's subtree lock is held exclusively
    #[must_use]
    pub fn is_exclusive(&self) -> bool {
        matches!(self.subtree, Some((SubtreeHold::Exclusive(_), _)))
    }
}

impl std::fmt::Debug for PathLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathLockGuard")
            .field("paths", &self.paths.iter().map(|(_, s)| &s.key.1).collect::<Vec<_>>())
            .field("exclusive", &self.is_exclusive())
            .finish()
    }
}

/// Lock acquisition gave up
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("lock not acquired within {waited_ms}ms")]
pub struct LockTimeout {
    /// How long the caller waited
    pub waited_ms: u64,
}

impl LockTimeout {
    /// Convert into the gateway taxonomy, naming the tenant-relative path
    #[must_use]
    pub fn into_warden(self, path: &str) -> WardenError {
        WardenError::LockTimeout {
            path: path.to_string(),
            waited_ms: self.waited_ms,
        }
    }
}

impl From<LockTimeout> for WardenError {
    fn from(err: LockTimeout) -> Self {
        err.into_warden("")
    }
}

/// Keyed path locks with bounded waits
pub struct MutationCoordinator {
    timeout: Duration,
    paths: Table<LockKey, AsyncMutex<()>>,
    subtrees: Table<TenantId, AsyncRwLock<()>>,
    metrics: LockMetrics,
}

impl MutationCoordinator {
    /// Create a coordinator with the given acquisition bound
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            paths: Arc::new(Mutex::new(HashMap::new())),
            subtrees: Arc::new(Mutex::new(HashMap::new())),
            metrics: LockMetrics::default(),
        }
    }

    /// Acquisition bound
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Lock one canonical path
    ///
    /// # Errors
    ///
    /// Returns [`LockTimeout`] if the lock is not acquired in time
    pub async fn acquire(
        &self,
        tenant: &TenantId,
        path: &Path,
    ) -> Result<PathLockGuard, LockTimeout> {
        self.acquire_inner(tenant, vec![path.to_path_buf()], SubtreeMode::Shared)
            .await
    }

    /// Lock two canonical paths in a fixed global order.
    ///
    /// Locks are taken in lexicographic order of the canonical paths, so two
    /// callers naming the same pair in opposite order cannot deadlock. A
    /// pair naming the same path twice takes one lock.
    ///
    /// # Errors
    ///
    /// Returns [`LockTimeout`] if the locks are not all acquired in time;
    /// none are held in that case
    pub async fn acquire_pair(
        &self,
        tenant: &TenantId,
        first: &Path,
        second: &Path,
    ) -> Result<PathLockGuard, LockTimeout> {
        self.acquire_inner(
            tenant,
            vec![first.to_path_buf(), second.to_path_buf()],
            SubtreeMode::Shared,
        )
        .await
    }

    /// Lock the tenant's whole tree exclusively
    ///
    /// # Errors
    ///
    /// Returns [`LockTimeout`] if in-flight mutations do not finish in time
    pub async fn acquire_subtree(&self, tenant: &TenantId) -> Result<PathLockGuard, LockTimeout> {
        self.acquire_inner(tenant, Vec::new(), SubtreeMode::Exclusive)
            .await
    }

    /// Run `f` while holding the lock for one path
    ///
    /// # Errors
    ///
    /// Returns the lock timeout or whatever `f` returns
    pub async fn with_lock<F, Fut, T, E>(&self, tenant: &TenantId, path: &Path, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockTimeout>,
    {
        let _guard = self.acquire(tenant, path).await?;
        f().await
    }

    async fn acquire_inner(
        &self,
        tenant: &TenantId,
        mut paths: Vec<PathBuf>,
        mode: SubtreeMode,
    ) -> Result<PathLockGuard, LockTimeout> {
        paths.sort();
        paths.dedup();

        let started = Instant::now();
        let attempt = async {
            let slot = Slot::checkout(&self.subtrees, tenant.clone());
            let hold = match mode {
                SubtreeMode::Shared => SubtreeHold::Shared(slot.lock.clone().read_owned().await),
                SubtreeMode::Exclusive => {
                    SubtreeHold::Exclusive(slot.lock.clone().write_owned().await)
                }
            };
            let subtree = Some((hold, slot));

            let mut held = Vec::with_capacity(paths.len());
            for path in paths {
                let slot = Slot::checkout(&self.paths, (tenant.clone(), path));
                let guard = slot.lock.clone().lock_owned().await;
                held.push((guard, slot));
            }
            PathLockGuard {
                paths: held,
                subtree,
            }
        };

        match tokio::time::timeout(self.timeout, attempt).await {
            Ok(guard) => {
                self.metrics.record_acquired(started.elapsed());
                Ok(guard)
            }
            Err(_) => {
                self.metrics.record_timeout();
                let waited_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                tracing::debug!(%tenant, waited_ms, ?mode, "lock acquisition timed out");
                Err(LockTimeout { waited_ms })
            }
        }
    }

    /// Current metrics and table sizes
    #[must_use]
    pub fn stats(&self) -> LockStats {
        let tracked_paths = lock_table(&self.paths).len();
        let tracked_tenants = lock_table(&self.subtrees).len();
        self.metrics.snapshot(tracked_paths, tracked_tenants)
    }
}

impl std::fmt::Debug for MutationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationCoordinator")
            .field("timeout", &self.timeout)
            .field("stats", &self.stats())
            .finish()
    }
}
