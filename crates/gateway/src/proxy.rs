//! HTTP reverse proxy.
//!
//! Upstream URL construction follows the route declaration: wildcard routes
//! append the request's suffix to the upstream prefix verbatim (no
//! percent-encoding, so identifiers containing `/` survive), and `{param}`
//! placeholders in the upstream path are substituted with the matched
//! captures. The original query string is always forwarded unchanged.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::{debug, warn};

use crate::error::GatewayError;
use crate::route::Route;
use crate::server::AppState;

/// Request body cap. Larger uploads belong on a dedicated route, not the
/// generic proxy path.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Headers that are connection-scoped and must not be forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
];

/// Build the upstream URL for a matched request.
///
/// `req_path` is the decoded request path, `params` the captures from the
/// route pattern, `query` the raw query string (without `?`).
pub fn build_upstream_url(
    route: &Route,
    req_path: &str,
    params: &HashMap<String, String>,
    query: Option<&str>,
) -> Result<String, GatewayError> {
    let mut url = if route.is_wildcard() && route.upstream.ends_with("/*") {
        let suffix = req_path
            .strip_prefix(route.wildcard_prefix())
            .unwrap_or_default();
        let prefix = route.upstream.strip_suffix('*').unwrap_or(&route.upstream);
        format!("{prefix}{suffix}")
    } else {
        let mut rewritten = route.upstream.clone();
        for (name, value) in params {
            rewritten = rewritten.replace(&format!("{{{name}}}"), value);
        }
        rewritten
    };

    if let Some(q) = query {
        if !q.is_empty() {
            url.push('?');
            url.push_str(q);
        }
    }
    Ok(url)
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Forwardable copy of a header map.
fn forwardable_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        if !is_hop_by_hop(name) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

/// Proxy one REST request to its upstream.
pub async fn handle(
    state: Arc<AppState>,
    route: Arc<Route>,
    params: HashMap<String, String>,
    req: Request<Body>,
) -> Result<Response, GatewayError> {
    let (parts, body) = req.into_parts();
    let url = build_upstream_url(
        &route,
        parts.uri.path(),
        &params,
        parts.uri.query(),
    )?;

    let body = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| GatewayError::Internal(format!("reading request body: {e}")))?;

    let method = reqwest::Method::from_bytes(parts.method.as_str().as_bytes())
        .map_err(|e| GatewayError::Internal(format!("bad method: {e}")))?;

    debug!(method = %method, url = %url, route = %route.path, "proxying request");

    let mut upstream_req = state.http.request(method, url.as_str()).body(body.to_vec());
    for (name, value) in forwardable_headers(&parts.headers) {
        if let Some(name) = name {
            upstream_req = upstream_req.header(name.as_str(), value.as_bytes());
        }
    }

    let upstream_resp = upstream_req.send().await.map_err(|e| {
        state.metrics.increment_upstream_errors();
        warn!(url = %url, error = %e, "upstream request failed");
        if e.is_timeout() {
            GatewayError::UpstreamTimeout(e.to_string())
        } else {
            GatewayError::Upstream(e.to_string())
        }
    })?;

    let status = StatusCode::from_u16(upstream_resp.status().as_u16())
        .map_err(|e| GatewayError::Internal(format!("bad upstream status: {e}")))?;

    let mut response_headers = HeaderMap::new();
    for (name, value) in upstream_resp.headers() {
        let Ok(name) = HeaderName::from_bytes(name.as_str().as_bytes()) else {
            continue;
        };
        if is_hop_by_hop(&name) {
            continue;
        }
        if let Ok(value) = axum::http::HeaderValue::from_bytes(value.as_bytes()) {
            response_headers.append(name, value);
        }
    }

    let body = Body::from_stream(upstream_resp.bytes_stream());
    let mut response = (status, body).into_response();
    *response.headers_mut() = response_headers;
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::{Access, RouteKind};
    use axum::http::Method;

    fn wildcard_route() -> Route {
        Route {
            path: "/api/devices/*".into(),
            upstream: "http://registry:7001/devices/*".into(),
            methods: vec![Method::GET],
            access: Access::Auth,
            rate_limit: None,
            kind: RouteKind::Rest,
        }
    }

    fn param_route() -> Route {
        Route {
            path: "/api/workflows/{id}/runs".into(),
            upstream: "http://engine:8081/workflows/{id}/runs".into(),
            methods: vec![Method::GET],
            access: Access::Resident,
            rate_limit: None,
            kind: RouteKind::Rest,
        }
    }

    #[test]
    fn wildcard_suffix_is_preserved_verbatim() {
        let url = build_upstream_url(
            &wildcard_route(),
            "/api/devices/zigbee/0x00124b002a5f3c11",
            &HashMap::new(),
            None,
        )
        .unwrap();
        // The embedded '/' must survive unencoded.
        assert_eq!(url, "http://registry:7001/devices/zigbee/0x00124b002a5f3c11");
    }

    #[test]
    fn param_substitution() {
        let params = HashMap::from([("id".to_owned(), "wf-1".to_owned())]);
        let url = build_upstream_url(&param_route(), "/api/workflows/wf-1/runs", &params, None)
            .unwrap();
        assert_eq!(url, "http://engine:8081/workflows/wf-1/runs");
    }

    #[test]
    fn query_string_is_forwarded_unchanged() {
        let url = build_upstream_url(
            &wildcard_route(),
            "/api/devices/d1",
            &HashMap::new(),
            Some("limit=10&order=desc%20nulls"),
        )
        .unwrap();
        assert_eq!(
            url,
            "http://registry:7001/devices/d1?limit=10&order=desc%20nulls"
        );
    }

    #[test]
    fn hop_by_hop_headers_are_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", "keep-alive".parse().unwrap());
        headers.insert("transfer-encoding", "chunked".parse().unwrap());
        headers.insert("host", "gateway.local".parse().unwrap());
        headers.insert("x-request-id", "abc".parse().unwrap());
        headers.insert("accept", "application/json".parse().unwrap());

        let forwarded = forwardable_headers(&headers);
        assert!(forwarded.get("connection").is_none());
        assert!(forwarded.get("transfer-encoding").is_none());
        assert!(forwarded.get("host").is_none());
        assert_eq!(forwarded.get("x-request-id").unwrap(), "abc");
        assert_eq!(forwarded.get("accept").unwrap(), "application/json");
    }
}
