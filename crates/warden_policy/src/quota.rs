//! Quota Tracker.
//!
//! Per-tenant byte and file ceilings enforced with reserve/commit/release.
//! Positive deltas are claimed at reservation time, so two concurrent
//! writes cannot both pass against stale usage. Negative deltas (space
//! freed by a shrink, delete or replace) only take effect on commit.
//!
//! A [`Reservation`] that is dropped without being committed releases its
//! claim, which covers both error paths and cancelled futures.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::RwLock;
use warden_core::{QuotaLimits, QuotaResource, TenantId, WardenError, WardenResult};

/// Snapshot of a tenant's quota state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaUsage {
    /// Committed bytes
    pub bytes_used: u64,
    /// Committed regular files
    pub file_count: u64,
    /// Bytes claimed by in-flight operations
    pub reserved_bytes: u64,
    /// Files claimed by in-flight operations
    pub reserved_files: u64,
    /// Effective ceilings
    pub limits: QuotaLimits,
}

#[derive(Debug, Default)]
struct Counters {
    used_bytes: u64,
    used_files: u64,
    reserved_bytes: u64,
    reserved_files: u64,
}

#[derive(Debug)]
struct TenantQuota {
    limits: QuotaLimits,
    counters: Mutex<Counters>,
}

impl TenantQuota {
    fn new(limits: QuotaLimits) -> Self {
        Self {
            limits,
            counters: Mutex::new(Counters::default()),
        }
    }

    // Counters are plain integers, always consistent between statements
    fn counters(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn usage(&self) -> QuotaUsage {
        let c = self.counters();
        QuotaUsage {
            bytes_used: c.used_bytes,
            file_count: c.used_files,
            reserved_bytes: c.reserved_bytes,
            reserved_files: c.reserved_files,
            limits: self.limits,
        }
    }
}

/// Claimed quota for one in-flight operation
#[derive(Debug)]
#[must_use = "dropping a reservation releases it"]
pub struct Reservation {
    quota: Arc<TenantQuota>,
    claim_bytes: u64,
    claim_files: u64,
    free_bytes: u64,
    free_files: u64,
    settled: bool,
}

impl Reservation {
    /// Net byte delta this reservation will apply
    #[must_use]
    pub fn delta_bytes(&self) -> i64 {
        to_signed(self.claim_bytes) - to_signed(self.free_bytes)
    }

    /// Net file delta this reservation will apply
    #[must_use]
    pub fn delta_files(&self) -> i64 {
        to_signed(self.claim_files) - to_signed(self.free_files)
    }

    /// Apply the delta to committed usage
    pub fn commit(mut self) {
        let mut c = self.quota.counters();
        c.reserved_bytes = c.reserved_bytes.saturating_sub(self.claim_bytes);
        c.reserved_files = c.reserved_files.saturating_sub(self.claim_files);
        c.used_bytes = (c.used_bytes + self.claim_bytes).saturating_sub(self.free_bytes);
        c.used_files = (c.used_files + self.claim_files).saturating_sub(self.free_files);
        drop(c);
        self.settled = true;
    }

    /// Give the claim back without changing committed usage
    pub fn release(mut self) {
        self.release_claim();
    }

    fn release_claim(&mut self) {
        if self.settled {
            return;
        }
        let mut c = self.quota.counters();
        c.reserved_bytes = c.reserved_bytes.saturating_sub(self.claim_bytes);
        c.reserved_files = c.reserved_files.saturating_sub(self.claim_files);
        self.settled = true;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.release_claim();
    }
}

fn to_signed(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

/// Per-tenant usage accounting
#[derive(Debug)]
pub struct QuotaTracker {
    defaults: QuotaLimits,
    overrides: BTreeMap<String, QuotaLimits>,
    tenants: RwLock<HashMap<TenantId, Arc<TenantQuota>>>,
}

impl QuotaTracker {
    /// Create a tracker with default ceilings
    #[must_use]
    pub fn new(defaults: QuotaLimits) -> Self {
        Self {
            defaults,
            overrides: BTreeMap::new(),
            tenants: RwLock::new(HashMap::new()),
        }
    }

    /// Use different ceilings for one tenant
    #[must_use]
    pub fn with_tenant(mut self, tenant: impl Into<String>, limits: QuotaLimits) -> Self {
        self.overrides.insert(tenant.into(), limits);
        self
    }

    /// Ceilings that apply to a tenant
    #[must_use]
    pub fn limits_for(&self, tenant: &TenantId) -> QuotaLimits {
        self.overrides
            .get(tenant.as_str())
            .copied()
            .unwrap_or(self.defaults)
    }

    async fn entry(&self, tenant: &TenantId) -> Arc<TenantQuota> {
        if let Some(quota) = self.tenants.read().await.get(tenant) {
            return quota.clone();
        }
        let mut tenants = self.tenants.write().await;
        tenants
            .entry(tenant.clone())
            .or_insert_with(|| Arc::new(TenantQuota::new(self.limits_for(tenant))))
            .clone()
    }

    /// Set committed usage from an on-disk scan.
    ///
    /// Only meaningful before the tenant's first reservation; outstanding
    /// reservations are kept.
    pub async fn seed(&self, tenant: &TenantId, bytes_used: u64, file_count: u64) {
        let quota = self.entry(tenant).await;
        let mut c = quota.counters();
        c.used_bytes = bytes_used;
        c.used_files = file_count;
        tracing::debug!(%tenant, bytes_used, file_count, "seeded quota");
    }

    /// Claim capacity for an operation.
    ///
    /// Both ceilings are checked under one lock; on failure nothing is
    /// claimed.
    ///
    /// # Errors
    ///
    /// Returns `QuotaExceeded` naming the first ceiling that would be passed
    pub async fn reserve(
        &self,
        tenant: &TenantId,
        delta_bytes: i64,
        delta_files: i64,
    ) -> WardenResult<Reservation> {
        let quota = self.entry(tenant).await;
        let claim_bytes = delta_bytes.max(0).unsigned_abs();
        let claim_files = delta_files.max(0).unsigned_abs();
        let free_bytes = delta_bytes.min(0).unsigned_abs();
        let free_files = delta_files.min(0).unsigned_abs();

        {
            let mut c = quota.counters();
            let bytes_claimed = c.used_bytes + c.reserved_bytes;
            if claim_bytes > 0 && bytes_claimed + claim_bytes > quota.limits.max_bytes {
                return Err(WardenError::QuotaExceeded {
                    resource: QuotaResource::Bytes,
                    requested: claim_bytes,
                    used: bytes_claimed,
                    limit: quota.limits.max_bytes,
                });
            }
            let files_claimed = c.used_files + c.reserved_files;
            if claim_files > 0 && files_claimed + claim_files > quota.limits.max_files {
                return Err(WardenError::QuotaExceeded {
                    resource: QuotaResource::Files,
                    requested: claim_files,
                    used: files_claimed,
                    limit: quota.limits.max_files,
                });
            }
            c.reserved_bytes += claim_bytes;
            c.reserved_files += claim_files;
        }

        Ok(Reservation {
            quota,
            claim_bytes,
            claim_files,
            free_bytes,
            free_files,
            settled: false,
        })
    }

    /// Apply a reservation
    pub fn commit(&self, reservation: Reservation) {
        reservation.commit();
    }

    /// Abandon a reservation
    pub fn release(&self, reservation: Reservation) {
        reservation.release();
    }

    /// Current usage; an unseen tenant reports zero
    pub async fn usage(&self, tenant: &TenantId) -> QuotaUsage {
        match self.tenants.read().await.get(tenant) {
            Some(quota) => quota.usage(),
            None => QuotaUsage {
                limits: self.limits_for(tenant),
                ..QuotaUsage::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant(id: &str) -> TenantId {
        TenantId::new(id).unwrap()
    }

    fn tracker(max_bytes: u64, max_files: u64) -> QuotaTracker {
        QuotaTracker::new(QuotaLimits {
            max_bytes,
            max_files,
        })
    }

    #[tokio::test]
    async fn test_over_quota_write_rejected() {
        let quota = tracker(1000, 100);
        let t = tenant("a");
        quota.seed(&t, 950, 1).await;

        let err = quota.reserve(&t, 100, 1).await.unwrap_err();
        assert_eq!(
            err,
            WardenError::QuotaExceeded {
                resource: QuotaResource::Bytes,
                requested: 100,
                used: 950,
                limit: 1000,
            }
        );
        let usage = quota.usage(&t).await;
        assert_eq!(usage.bytes_used, 950);
        assert_eq!(usage.reserved_bytes, 0);
    }

    #[tokio::test]
    async fn test_reserve_commit() {
        let quota = tracker(1000, 10);
        let t = tenant("a");

        let r = quota.reserve(&t, 400, 1).await.unwrap();
        assert_eq!(quota.usage(&t).await.reserved_bytes, 400);
        quota.commit(r);

        let usage = quota.usage(&t).await;
        assert_eq!(usage.bytes_used, 400);
        assert_eq!(usage.file_count, 1);
        assert_eq!(usage.reserved_bytes, 0);
    }

    #[tokio::test]
    async fn test_reservations_count_against_limit() {
        let quota = tracker(1000, 10);
        let t = tenant("a");

        let first = quota.reserve(&t, 600, 1).await.unwrap();
        let second = quota.reserve(&t, 600, 1).await;
        assert!(matches!(second, Err(WardenError::QuotaExceeded { .. })));

        quota.release(first);
        let third = quota.reserve(&t, 600, 1).await.unwrap();
        assert_eq!(third.delta_bytes(), 600);
    }

    #[tokio::test]
    async fn test_drop_releases() {
        let quota = tracker(1000, 10);
        let t = tenant("a");
        {
            let _r = quota.reserve(&t, 1000, 1).await.unwrap();
            assert_eq!(quota.usage(&t).await.reserved_bytes, 1000);
        }
        let usage = quota.usage(&t).await;
        assert_eq!(usage.reserved_bytes, 0);
        assert_eq!(usage.reserved_files, 0);
        assert_eq!(usage.bytes_used, 0);
    }

    #[tokio::test]
    async fn test_file_ceiling_no_partial_claim() {
        let quota = tracker(1000, 1);
        let t = tenant("a");
        quota.seed(&t, 0, 1).await;

        let err = quota.reserve(&t, 10, 1).await.unwrap_err();
        assert!(matches!(
            err,
            WardenError::QuotaExceeded {
                resource: QuotaResource::Files,
                ..
            }
        ));
        assert_eq!(quota.usage(&t).await.reserved_bytes, 0);
    }

    #[tokio::test]
    async fn test_negative_delta_applies_on_commit() {
        let quota = tracker(1000, 10);
        let t = tenant("a");
        quota.seed(&t, 1000, 2).await;

        // Shrinking is admitted even at the ceiling
        let r = quota.reserve(&t, -300, -1).await.unwrap();
        assert_eq!(quota.usage(&t).await.bytes_used, 1000);
        quota.commit(r);

        let usage = quota.usage(&t).await;
        assert_eq!(usage.bytes_used, 700);
        assert_eq!(usage.file_count, 1);
    }

    #[tokio::test]
    async fn test_tenants_independent() {
        let quota = tracker(100, 10).with_tenant(
            "big",
            QuotaLimits {
                max_bytes: 10_000,
                max_files: 10,
            },
        );
        let small = tenant("small");
        let big = tenant("big");

        assert!(quota.reserve(&small, 500, 1).await.is_err());
        let r = quota.reserve(&big, 500, 1).await.unwrap();
        quota.commit(r);

        assert_eq!(quota.usage(&small).await.bytes_used, 0);
        assert_eq!(quota.usage(&big).await.bytes_used, 500);
        assert_eq!(quota.usage(&big).await.limits.max_bytes, 10_000);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reservations_never_overcommit() {
        let quota = Arc::new(tracker(1000, 1000));
        let t = tenant("a");

        let mut handles = Vec::new();
        for _ in 0..50 {
            let quota = quota.clone();
            let t = t.clone();
            handles.push(tokio::spawn(async move {
                match quota.reserve(&t, 100, 1).await {
                    Ok(r) => {
                        quota.commit(r);
                        true
                    }
                    Err(_) => false,
                }
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10);
        assert_eq!(quota.usage(&t).await.bytes_used, 1000);
    }
}
