//! Per-tenant usage limiting with token buckets.
//!
//! Each (org, resource) pair gets its own bucket, refilled continuously at
//! a configured rate; an optional global bucket caps aggregate spend across
//! all tenants. Reservation is check-and-reserve in one step: a denied
//! request consumes nothing, including from the global bucket.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use crate::config::LimitsConfig;

/// Billable resource classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    Embedding,
    Generation,
}

impl Resource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resource::Embedding => "embedding",
            Resource::Generation => "generation",
        }
    }
}

/// Admission control for provider calls.
pub trait UsageLimiter: Send + Sync {
    /// Atomically check quota and reserve `cost` units for the org. Returns
    /// false (reserving nothing) when either the org bucket or the global
    /// bucket lacks capacity.
    fn check_and_reserve(&self, org_id: &str, resource: Resource, cost: f64) -> bool;
}

/// Limiter that always admits; used in tests and single-tenant setups.
pub struct AllowAll;

impl UsageLimiter for AllowAll {
    fn check_and_reserve(&self, _org_id: &str, _resource: Resource, _cost: f64) -> bool {
        true
    }
}

struct Bucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            tokens: capacity,
            capacity,
            refill_per_sec,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    fn has(&mut self, cost: f64, now: Instant) -> bool {
        self.refill(now);
        self.tokens >= cost
    }

    fn take(&mut self, cost: f64) {
        self.tokens -= cost;
    }
}

/// Token-bucket limiter with per-(org, resource) buckets plus an optional
/// global bucket shared by every tenant.
pub struct TokenBucketLimiter {
    config: LimitsConfig,
    buckets: Mutex<HashMap<(String, Resource), Bucket>>,
    global: Option<Mutex<Bucket>>,
}

impl TokenBucketLimiter {
    pub fn new(config: LimitsConfig) -> Self {
        let global = if config.global_capacity > 0.0 {
            Some(Mutex::new(Bucket::new(
                config.global_capacity,
                config.global_refill_per_sec,
            )))
        } else {
            None
        };
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
            global,
        }
    }

    fn bucket_params(&self, resource: Resource) -> (f64, f64) {
        match resource {
            Resource::Embedding => (
                self.config.embedding_capacity,
                self.config.embedding_refill_per_sec,
            ),
            Resource::Generation => (
                self.config.generation_capacity,
                self.config.generation_refill_per_sec,
            ),
        }
    }
}

impl UsageLimiter for TokenBucketLimiter {
    fn check_and_reserve(&self, org_id: &str, resource: Resource, cost: f64) -> bool {
        let now = Instant::now();
        let (capacity, refill) = self.bucket_params(resource);

        let mut buckets = match self.buckets.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let bucket = buckets
            .entry((org_id.to_string(), resource))
            .or_insert_with(|| Bucket::new(capacity, refill));

        if !bucket.has(cost, now) {
            return false;
        }

        // Both buckets must admit before either is charged
        if let Some(global) = &self.global {
            let mut global = match global.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            if !global.has(cost, now) {
                return false;
            }
            global.take(cost);
        }

        bucket.take(cost);
        true
    }
}
