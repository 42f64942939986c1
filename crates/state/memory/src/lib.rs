//! In-memory rate-store backend.
//!
//! Single-process only: buckets live in a mutex-guarded map keyed by
//! `scope:identity`. Used in tests and single-node deployments where no
//! shared store is configured. The clock is [`tokio::time::Instant`] so
//! tests can drive refill deterministically with the paused runtime.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use domo_state::{RateDecision, RateKey, RateLimit, RateStore, StateError};

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    refilled_at: Instant,
}

/// Mutex-guarded token buckets.
#[derive(Debug, Default)]
pub struct MemoryRateStore {
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl MemoryRateStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateStore for MemoryRateStore {
    async fn take(&self, key: &RateKey, limit: RateLimit) -> Result<RateDecision, StateError> {
        let now = Instant::now();
        let map_key = format!("{}:{}", key.scope, key.identity);
        let mut buckets = self
            .buckets
            .lock()
            .map_err(|e| StateError::Backend(e.to_string()))?;

        let bucket = buckets.entry(map_key).or_insert(Bucket {
            tokens: f64::from(limit.burst),
            refilled_at: now,
        });

        let elapsed = now.duration_since(bucket.refilled_at).as_secs_f64();
        bucket.tokens =
            (bucket.tokens + elapsed * f64::from(limit.rps)).min(f64::from(limit.burst));
        bucket.refilled_at = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(RateDecision::Allowed)
        } else {
            let deficit = 1.0 - bucket.tokens;
            let retry_after = Duration::from_secs_f64(deficit / f64::from(limit.rps).max(f64::MIN_POSITIVE));
            Ok(RateDecision::Denied { retry_after })
        }
    }
}
