//! Rate Limiter.
//!
//! One token bucket per tenant. Refill is computed lazily from the elapsed
//! time on each call; there is no background timer. Tokens are kept in
//! thousandths so fractional refill rates accumulate exactly.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::RwLock;
use warden_core::{Clock, RateConfig, TenantId, WardenError, WardenResult};

/// Token scale factor
const SCALE: u64 = 1_000;

/// Snapshot of one bucket
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketState {
    /// Whole tokens currently available
    pub tokens: u64,
    /// Bucket capacity
    pub capacity: u32,
    /// Tokens added per second
    pub refill_per_sec: f64,
}

#[derive(Debug)]
struct Bucket {
    config: RateConfig,
    // Scaled by SCALE
    tokens: u64,
    last_refill: Duration,
}

impl Bucket {
    fn new(config: RateConfig, now: Duration) -> Self {
        Self {
            config,
            tokens: u64::from(config.capacity) * SCALE,
            last_refill: now,
        }
    }

    fn max_tokens(&self) -> u64 {
        u64::from(self.config.capacity) * SCALE
    }

    fn refill(&mut self, now: Duration) {
        let elapsed = now.saturating_sub(self.last_refill);
        let added = (elapsed.as_secs_f64() * self.config.refill_per_sec * SCALE as f64) as u64;
        if self.tokens >= self.max_tokens() {
            self.last_refill = now;
        } else if added > 0 {
            self.tokens = (self.tokens + added).min(self.max_tokens());
            self.last_refill = now;
        }
    }

    /// Take `cost` tokens or report how long until they would be available
    fn take(&mut self, cost: u32, now: Duration) -> Result<(), u64> {
        self.refill(now);
        let needed = u64::from(cost) * SCALE;
        if self.tokens >= needed {
            self.tokens -= needed;
            return Ok(());
        }
        let missing = (needed - self.tokens) as f64 / SCALE as f64;
        let wait_ms = (missing / self.config.refill_per_sec * 1_000.0).ceil();
        Err(if wait_ms.is_finite() {
            wait_ms as u64
        } else {
            u64::MAX
        })
    }
}

/// Per-tenant token buckets
#[derive(Debug)]
pub struct RateLimiter {
    defaults: RateConfig,
    overrides: BTreeMap<String, RateConfig>,
    clock: Arc<dyn Clock>,
    buckets: RwLock<HashMap<TenantId, Arc<Mutex<Bucket>>>>,
}

impl RateLimiter {
    /// Create a limiter with default bucket parameters
    #[must_use]
    pub fn new(defaults: RateConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            defaults,
            overrides: BTreeMap::new(),
            clock,
            buckets: RwLock::new(HashMap::new()),
        }
    }

    /// Use different bucket parameters for one tenant
    #[must_use]
    pub fn with_tenant(mut self, tenant: impl Into<String>, config: RateConfig) -> Self {
        self.overrides.insert(tenant.into(), config);
        self
    }

    async fn bucket(&self, tenant: &TenantId) -> Arc<Mutex<Bucket>> {
        if let Some(bucket) = self.buckets.read().await.get(tenant) {
            return bucket.clone();
        }
        let config = self
            .overrides
            .get(tenant.as_str())
            .copied()
            .unwrap_or(self.defaults);
        let now = self.clock.now();
        self.buckets
            .write()
            .await
            .entry(tenant.clone())
            .or_insert_with(|| Arc::new(Mutex::new(Bucket::new(config, now))))
            .clone()
    }

    /// Admit an operation of the given cost
    ///
    /// # Errors
    ///
    /// Returns `RateLimited` with the time until enough tokens refill;
    /// a rejected call consumes nothing
    pub async fn check(&self, tenant: &TenantId, cost: u32) -> WardenResult<()> {
        let bucket = self.bucket(tenant).await;
        let now = self.clock.now();
        let result = bucket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take(cost, now);
        result.map_err(|retry_after_ms| {
            tracing::debug!(%tenant, cost, retry_after_ms, "rate limited");
            WardenError::RateLimited { retry_after_ms }
        })
    }

    /// Whether an operation of the given cost is admitted
    pub async fn allow(&self, tenant: &TenantId, cost: u32) -> bool {
        self.check(tenant, cost).await.is_ok()
    }

    /// Current bucket state; an unseen tenant reports a full bucket
    pub async fn state(&self, tenant: &TenantId) -> BucketState {
        let bucket = self.bucket(tenant).await;
        let now = self.clock.now();
        let mut bucket = bucket.lock().unwrap_or_else(PoisonError::into_inner);
        bucket.refill(now);
        BucketState {
            tokens: bucket.tokens / SCALE,
            capacity: bucket.config.capacity,
            refill_per_sec: bucket.config.refill_per_sec,
        }
    }
}
