use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters tracking gateway traffic.
///
/// All counters use relaxed ordering for maximum throughput. For a
/// consistent point-in-time view, call [`snapshot`](Self::snapshot).
#[derive(Debug, Default)]
pub struct GatewayMetrics {
    /// Total proxied HTTP requests.
    pub requests: AtomicU64,
    /// Requests rejected with 401.
    pub auth_failures: AtomicU64,
    /// Requests rejected with 403.
    pub role_denials: AtomicU64,
    /// Requests rejected with 429.
    pub rate_limited: AtomicU64,
    /// Rate-store failures that caused a fail-open admit.
    pub rate_store_errors: AtomicU64,
    /// Upstream transport failures rendered as 502.
    pub upstream_errors: AtomicU64,
    /// WebSocket bridge sessions opened.
    pub ws_sessions: AtomicU64,
    /// WebSocket backend dials that failed.
    pub ws_dial_failures: AtomicU64,
}

/// A point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub auth_failures: u64,
    pub role_denials: u64,
    pub rate_limited: u64,
    pub rate_store_errors: u64,
    pub upstream_errors: u64,
    pub ws_sessions: u64,
    pub ws_dial_failures: u64,
}

impl GatewayMetrics {
    pub fn increment_requests(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_auth_failures(&self) {
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_role_denials(&self) {
        self.role_denials.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_rate_store_errors(&self) {
        self.rate_store_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_upstream_errors(&self) {
        self.upstream_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_ws_sessions(&self) {
        self.ws_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_ws_dial_failures(&self) {
        self.ws_dial_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a consistent snapshot of all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            role_denials: self.role_denials.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            rate_store_errors: self.rate_store_errors.load(Ordering::Relaxed),
            upstream_errors: self.upstream_errors.load(Ordering::Relaxed),
            ws_sessions: self.ws_sessions.load(Ordering::Relaxed),
            ws_dial_failures: self.ws_dial_failures.load(Ordering::Relaxed),
        }
    }
}

impl MetricsSnapshot {
    /// Render the snapshot in Prometheus text exposition format.
    #[must_use]
    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();
        for (name, value) in [
            ("domo_gateway_requests_total", self.requests),
            ("domo_gateway_auth_failures_total", self.auth_failures),
            ("domo_gateway_role_denials_total", self.role_denials),
            ("domo_gateway_rate_limited_total", self.rate_limited),
            ("domo_gateway_rate_store_errors_total", self.rate_store_errors),
            ("domo_gateway_upstream_errors_total", self.upstream_errors),
            ("domo_gateway_ws_sessions_total", self.ws_sessions),
            ("domo_gateway_ws_dial_failures_total", self.ws_dial_failures),
        ] {
            out.push_str(&format!("# TYPE {name} counter\n{name} {value}\n"));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_increments() {
        let metrics = GatewayMetrics::default();
        metrics.increment_requests();
        metrics.increment_requests();
        metrics.increment_rate_limited();
        let snap = metrics.snapshot();
        assert_eq!(snap.requests, 2);
        assert_eq!(snap.rate_limited, 1);
        assert_eq!(snap.upstream_errors, 0);
    }

    #[test]
    fn prometheus_rendering() {
        let metrics = GatewayMetrics::default();
        metrics.increment_ws_sessions();
        let text = metrics.snapshot().render_prometheus();
        assert!(text.contains("domo_gateway_ws_sessions_total 1\n"));
        assert!(text.contains("# TYPE domo_gateway_requests_total counter\n"));
    }
}
