//! Rate-limit enforcement in front of the proxy handlers.
//!
//! Key derivation: authenticated callers are limited per subject
//! (`user:<sub>`), anonymous callers per remote address (`ip:<addr>`). The
//! scope is the route's declared path when the route carries its own limit,
//! or `"global"` when only the process-wide default applies.
//!
//! On a store failure the guard fails open: an infrastructure outage must
//! never take user traffic down with it. The failure is counted and logged.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::warn;

use domo_core::Claims;
use domo_state::{RateKey, RateLimit, RateStore};

use crate::error::GatewayError;
use crate::metrics::GatewayMetrics;
use crate::route::Route;

/// Shared rate-limit guard consulted by every proxy handler.
pub struct RateGuard {
    store: Arc<dyn RateStore>,
    default_limit: Option<RateLimit>,
    metrics: Arc<GatewayMetrics>,
}

impl RateGuard {
    /// Create a guard over the shared store.
    pub fn new(
        store: Arc<dyn RateStore>,
        default_limit: Option<RateLimit>,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            store,
            default_limit,
            metrics,
        }
    }

    /// Enforce the limit for one request. Returns `Ok(())` when the request
    /// may proceed.
    pub async fn check(
        &self,
        route: &Route,
        claims: Option<&Claims>,
        remote: SocketAddr,
    ) -> Result<(), GatewayError> {
        let (scope, limit) = match (route.rate_limit, self.default_limit) {
            (Some(spec), _) => (route.path.as_str(), RateLimit::from(spec)),
            (None, Some(default)) => (RateKey::GLOBAL_SCOPE, default),
            (None, None) => return Ok(()),
        };

        let identity = claims.map_or_else(|| format!("ip:{}", remote.ip()), Claims::rate_key);
        let key = RateKey::new(scope, identity);

        match self.store.take(&key, limit).await {
            Ok(domo_state::RateDecision::Allowed) => Ok(()),
            Ok(domo_state::RateDecision::Denied { retry_after }) => {
                self.metrics.increment_rate_limited();
                Err(GatewayError::RateLimited {
                    retry_after: retry_after.as_secs().max(1),
                })
            }
            Err(e) => {
                // Fail open: the store being down must not block traffic.
                self.metrics.increment_rate_store_errors();
                warn!(scope = %key.scope, error = %e, "rate store unavailable, admitting request");
                Ok(())
            }
        }
    }
}
