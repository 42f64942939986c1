use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Config, Pool, Runtime};
use redis::Script;

use domo_state::{RateDecision, RateKey, RateLimit, RateStore, StateError};

use crate::config::RedisConfig;
use crate::key_render::render_key;
use crate::scripts;

/// Redis-backed implementation of [`RateStore`].
///
/// Uses a `deadpool-redis` connection pool and a Lua script for the atomic
/// refill-and-decrement. Buckets are Redis hashes with fields `tokens` and
/// `ts`; expiry reaps buckets idle long enough to have fully refilled.
pub struct RedisRateStore {
    pool: Pool,
    prefix: String,
}

impl RedisRateStore {
    /// Create a new `RedisRateStore` from the provided configuration.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Connection`] if the pool cannot be created.
    pub fn new(config: &RedisConfig) -> Result<Self, StateError> {
        let cfg = Config::from_url(&config.url);
        let pool = cfg
            .builder()
            .map(|b| {
                b.max_size(config.pool_size)
                    .wait_timeout(Some(config.connection_timeout))
                    .runtime(Runtime::Tokio1)
                    .build()
            })
            .map_err(|e| StateError::Connection(e.to_string()))?
            .map_err(|e| StateError::Connection(e.to_string()))?;

        Ok(Self {
            pool,
            prefix: config.prefix.clone(),
        })
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection, StateError> {
        self.pool
            .get()
            .await
            .map_err(|e| StateError::Connection(e.to_string()))
    }
}

#[async_trait]
impl RateStore for RedisRateStore {
    async fn take(&self, key: &RateKey, limit: RateLimit) -> Result<RateDecision, StateError> {
        let redis_key = render_key(&self.prefix, key);
        let mut conn = self.conn().await?;

        let script = Script::new(scripts::TOKEN_BUCKET);
        let (allowed, retry_ms): (i64, i64) = script
            .key(&redis_key)
            .arg(limit.rps)
            .arg(limit.burst)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StateError::Backend(e.to_string()))?;

        if allowed == 1 {
            Ok(RateDecision::Allowed)
        } else {
            Ok(RateDecision::Denied {
                retry_after: Duration::from_millis(retry_ms.max(1).unsigned_abs()),
            })
        }
    }
}
