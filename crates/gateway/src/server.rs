//! Router assembly and shared application state.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::{ConnectInfo, RawPathParams};
use axum::http::Request;
use axum::response::{IntoResponse, Response};
use axum::routing::{MethodFilter, get, on};
use tower_http::trace::TraceLayer;
use tracing::info;

use domo_state::RateStore;
use domo_state_memory::MemoryRateStore;
use domo_state_redis::{RedisConfig, RedisRateStore};

use crate::auth::{TokenVerifier, authorize};
use crate::bridge;
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::metrics::GatewayMetrics;
use crate::proxy;
use crate::ratelimit::RateGuard;
use crate::route::{Route, RouteKind, RouteTable};

/// Shared state behind every handler.
pub struct AppState {
    pub routes: Arc<RouteTable>,
    pub verifier: Option<Arc<TokenVerifier>>,
    pub rate: RateGuard,
    pub http: reqwest::Client,
    pub metrics: Arc<GatewayMetrics>,
}

impl AppState {
    /// Wire the state from loaded configuration. `config_dir` anchors
    /// relative paths in the file.
    pub fn from_config(config: &GatewayConfig, config_dir: &Path) -> Result<Arc<Self>, GatewayError> {
        let routes_dir = config
            .routes_dir
            .as_ref()
            .map(|d| if d.is_absolute() { d.clone() } else { config_dir.join(d) });
        let routes = RouteTable::load(
            config.routes.clone(),
            routes_dir.as_deref().filter(|d| d.exists()),
            &config.upstreams,
        )?;

        let verifier = config
            .jwt_public_key_path
            .as_ref()
            .map(|p| {
                let path = if p.is_absolute() { p.clone() } else { config_dir.join(p) };
                TokenVerifier::from_pem_file(&path).map(Arc::new)
            })
            .transpose()?;

        if verifier.is_none() {
            if let Some(route) = routes.routes().iter().find(|r| r.access.requires_token()) {
                return Err(GatewayError::Config(format!(
                    "route '{}' requires authentication but no jwt_public_key_path is configured",
                    route.path
                )));
            }
        }

        let metrics = Arc::new(GatewayMetrics::default());
        let store: Arc<dyn RateStore> = match &config.rate_limit.store_addr {
            Some(addr) => {
                let redis = RedisRateStore::new(&RedisConfig {
                    url: addr.clone(),
                    ..RedisConfig::default()
                })
                .map_err(|e| GatewayError::Config(format!("connecting to rate-limit store: {e}")))?;
                info!(addr = %addr, "rate limiting against shared store");
                Arc::new(redis)
            }
            None => {
                info!("no rate-limit store configured, using process-local buckets");
                Arc::new(MemoryRateStore::new())
            }
        };
        let rate = RateGuard::new(store, config.default_rate_limit(), Arc::clone(&metrics));

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| GatewayError::Config(format!("building http client: {e}")))?;

        Ok(Arc::new(Self {
            routes: Arc::new(routes),
            verifier,
            rate,
            http,
            metrics,
        }))
    }
}

/// Build the gateway router: operational endpoints plus one handler per
/// configured route, each registered with and without a trailing slash
/// where that variant is not itself declared.
pub fn router(state: Arc<AppState>) -> Router {
    let mut app = Router::new().route("/healthz", get(|| async { "ok" }));

    let metrics_state = Arc::clone(&state);
    app = app.route(
        "/metrics",
        get(move || {
            let state = Arc::clone(&metrics_state);
            async move { state.metrics.snapshot().render_prometheus() }
        }),
    );

    let dump_state = Arc::clone(&state);
    app = app.route(
        "/api/gateway/routes",
        get(move || {
            let state = Arc::clone(&dump_state);
            async move { axum::Json(state.routes.routes().to_vec()) }
        }),
    );

    let declared: HashSet<String> = state
        .routes
        .routes()
        .iter()
        .map(|r| r.path.clone())
        .collect();

    for route in state.routes.routes().iter().cloned() {
        let route = Arc::new(route);

        let mut filter: Option<MethodFilter> = None;
        for method in &route.methods {
            let f = MethodFilter::try_from(method.clone())
                .unwrap_or(MethodFilter::GET);
            filter = Some(filter.map_or(f, |acc| acc.or(f)));
        }
        let Some(filter) = filter else { continue };

        for pattern in registration_patterns(&route, &declared) {
            let handler_state = Arc::clone(&state);
            let handler_route = Arc::clone(&route);
            app = app.route(
                &pattern,
                on(filter, move |params: RawPathParams, req: Request<Body>| {
                    let state = Arc::clone(&handler_state);
                    let route = Arc::clone(&handler_route);
                    async move { dispatch(state, route, &params, req).await }
                }),
            );
        }
    }

    app.fallback(|| async { GatewayError::NotFound.into_response() })
        .layer(TraceLayer::new_for_http())
}

/// Axum patterns a route registers under: its own path, plus the
/// trailing-slash twin unless another route already declares it.
fn registration_patterns(route: &Route, declared: &HashSet<String>) -> Vec<String> {
    let mut patterns = vec![route.axum_path()];
    if !route.is_wildcard() && route.path != "/" {
        let twin = if let Some(stripped) = route.path.strip_suffix('/') {
            stripped.to_owned()
        } else {
            format!("{}/", route.path)
        };
        if !declared.contains(&twin) {
            patterns.push(twin);
        }
    }
    patterns
}

/// The full middleware chain for one matched route, run in order:
/// authentication, role check, rate limit, then proxy or bridge.
async fn dispatch(
    state: Arc<AppState>,
    route: Arc<Route>,
    params: &RawPathParams,
    mut req: Request<Body>,
) -> Response {
    state.metrics.increment_requests();

    let remote = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)), |c| c.0);

    let claims = if route.access.requires_token() {
        let Some(verifier) = state.verifier.as_deref() else {
            return GatewayError::Internal("protected route without verifier".into())
                .into_response();
        };
        match authorize(verifier, route.access, req.headers()) {
            Ok(claims) => claims,
            Err(e) => {
                match &e {
                    GatewayError::Unauthorized(_) => state.metrics.increment_auth_failures(),
                    GatewayError::Forbidden => state.metrics.increment_role_denials(),
                    _ => {}
                }
                return e.into_response();
            }
        }
    } else {
        None
    };

    if let Err(e) = state.rate.check(&route, claims.as_ref(), remote).await {
        return e.into_response();
    }

    let params: HashMap<String, String> = params
        .iter()
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .collect();

    if let Some(claims) = claims {
        req.extensions_mut().insert(claims);
    }

    let result = match route.kind {
        RouteKind::Rest => proxy::handle(state, route, params, req).await,
        RouteKind::Websocket => bridge::handle(state, route, params, req).await,
    };
    result.unwrap_or_else(IntoResponse::into_response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::Access;
    use axum::http::Method;

    fn route(path: &str) -> Route {
        Route {
            path: path.into(),
            upstream: "http://u/x".into(),
            methods: vec![Method::GET],
            access: Access::Public,
            rate_limit: None,
            kind: RouteKind::Rest,
        }
    }

    #[test]
    fn slash_twin_is_registered() {
        let declared = HashSet::new();
        assert_eq!(
            registration_patterns(&route("/api/x"), &declared),
            vec!["/api/x".to_owned(), "/api/x/".to_owned()]
        );
    }

    #[test]
    fn declared_twin_is_not_duplicated() {
        let declared = HashSet::from(["/api/x/".to_owned()]);
        assert_eq!(
            registration_patterns(&route("/api/x"), &declared),
            vec!["/api/x".to_owned()]
        );
    }

    #[test]
    fn wildcard_registers_once() {
        let declared = HashSet::new();
        assert_eq!(
            registration_patterns(&route("/ws/*"), &declared),
            vec!["/ws/{*rest}".to_owned()]
        );
    }
}
