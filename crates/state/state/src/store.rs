use std::time::Duration;

use async_trait::async_trait;

use crate::error::StateError;
use crate::key::RateKey;

/// Token-bucket parameters for one scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    /// Refill rate, tokens per second.
    pub rps: u32,
    /// Bucket capacity.
    pub burst: u32,
}

impl RateLimit {
    /// Create a new limit. `rps` and `burst` must both be non-zero to be
    /// meaningful; callers validate at config load.
    #[must_use]
    pub fn new(rps: u32, burst: u32) -> Self {
        Self { rps, burst }
    }
}

/// Outcome of one bucket take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// A token was consumed.
    Allowed,
    /// The bucket is empty.
    Denied {
        /// Time until at least one token refills.
        retry_after: Duration,
    },
}

impl RateDecision {
    /// Whether the request may proceed.
    #[must_use]
    pub fn is_allowed(self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Trait for the shared token-bucket store.
///
/// The single operation folds refill and decrement together; backends must
/// execute it atomically per key using the store's clock, so that gateway
/// instances sharing a store are jointly bounded by `burst + rps * window`.
#[async_trait]
pub trait RateStore: Send + Sync {
    /// Refill the bucket for `key` according to `limit`, then take one
    /// token if available.
    async fn take(&self, key: &RateKey, limit: RateLimit) -> Result<RateDecision, StateError>;
}
