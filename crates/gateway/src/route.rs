//! Declarative route table.
//!
//! Routes are loaded once at startup from the root configuration plus a
//! directory of YAML fragments, merged additively in lexicographic file
//! order with declaration order preserved within each file. The table is
//! immutable afterwards.
//!
//! Path syntax: literal segments, `{param}` captures, and an optional
//! trailing `/*` wildcard. A wildcard route forwards the request's suffix
//! to the upstream verbatim, so device ids containing `/` survive the
//! rewrite unencoded.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use axum::http::Method;
use serde::{Deserialize, Serialize};

use domo_core::Role;
use domo_state::RateLimit;

use crate::error::GatewayError;

/// Auth requirement attached to a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    /// No token required.
    Public,
    /// Any authenticated principal.
    Auth,
    /// Role `resident` or above.
    Resident,
    /// Role `admin`.
    Admin,
}

impl Access {
    /// The minimum role satisfying this access class.
    #[must_use]
    pub fn required_role(self) -> Role {
        match self {
            Self::Public => Role::Public,
            Self::Auth => Role::User,
            Self::Resident => Role::Resident,
            Self::Admin => Role::Admin,
        }
    }

    /// Whether a token must be presented at all.
    #[must_use]
    pub fn requires_token(self) -> bool {
        !matches!(self, Self::Public)
    }
}

/// Whether a route proxies plain HTTP or WebSocket upgrades.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteKind {
    #[default]
    Rest,
    Websocket,
}

/// Per-route rate limit as written in configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitSpec {
    pub rps: u32,
    pub burst: u32,
}

impl From<RateLimitSpec> for RateLimit {
    fn from(spec: RateLimitSpec) -> Self {
        Self::new(spec.rps, spec.burst)
    }
}

/// One route as declared in a configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct RouteSpec {
    pub path: String,
    pub upstream: String,
    #[serde(default)]
    pub methods: Vec<String>,
    pub access: Access,
    #[serde(default)]
    pub rate_limit: Option<RateLimitSpec>,
    #[serde(default)]
    pub kind: RouteKind,
}

/// A route fragment file: a list of route declarations.
#[derive(Debug, Deserialize)]
pub struct RouteFile {
    #[serde(default)]
    pub routes: Vec<RouteSpec>,
}

/// A validated, immutable route.
#[derive(Debug, Clone, Serialize)]
pub struct Route {
    /// Declared path pattern (`{param}` captures, optional trailing `/*`).
    pub path: String,
    /// Upstream URL pattern after collaborator expansion.
    pub upstream: String,
    /// Allowed methods. Always `[GET]` for websocket routes.
    #[serde(serialize_with = "serialize_methods")]
    pub methods: Vec<Method>,
    pub access: Access,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitSpec>,
    pub kind: RouteKind,
}

fn serialize_methods<S: serde::Serializer>(
    methods: &[Method],
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(methods.iter().map(Method::as_str))
}

impl Route {
    /// Whether the path ends in a `/*` wildcard.
    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        self.path.ends_with("/*")
    }

    /// The literal prefix before a trailing wildcard (includes the
    /// trailing slash).
    #[must_use]
    pub fn wildcard_prefix(&self) -> &str {
        self.path.strip_suffix('*').unwrap_or(&self.path)
    }

    /// The axum router pattern for this route.
    #[must_use]
    pub fn axum_path(&self) -> String {
        if self.is_wildcard() {
            format!("{}{{*rest}}", self.wildcard_prefix())
        } else {
            self.path.clone()
        }
    }

    /// `{param}` names appearing in the declared path.
    #[must_use]
    pub fn param_names(&self) -> Vec<&str> {
        param_names(&self.path)
    }
}

fn param_names(pattern: &str) -> Vec<&str> {
    pattern
        .split('/')
        .filter_map(|seg| seg.strip_prefix('{').and_then(|s| s.strip_suffix('}')))
        .collect()
}

/// The loaded route table.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    /// Build the table from the root config's routes plus fragment files
    /// under `fragments_dir`, expanding `${name}` collaborator references
    /// against `upstreams`.
    pub fn load(
        root_routes: Vec<RouteSpec>,
        fragments_dir: Option<&Path>,
        upstreams: &HashMap<String, String>,
    ) -> Result<Self, GatewayError> {
        let mut specs = root_routes;

        if let Some(dir) = fragments_dir {
            for path in fragment_files(dir)? {
                let contents = fs::read_to_string(&path).map_err(|e| {
                    GatewayError::Config(format!("reading {}: {e}", path.display()))
                })?;
                let file: RouteFile = serde_yaml_ng::from_str(&contents).map_err(|e| {
                    GatewayError::Config(format!("parsing {}: {e}", path.display()))
                })?;
                specs.extend(file.routes);
            }
        }

        Self::from_specs(specs, upstreams)
    }

    /// Validate a flat list of specs into a table.
    pub fn from_specs(
        specs: Vec<RouteSpec>,
        upstreams: &HashMap<String, String>,
    ) -> Result<Self, GatewayError> {
        let mut routes = Vec::with_capacity(specs.len());
        let mut seen: HashSet<(String, String)> = HashSet::new();

        for spec in specs {
            let route = validate_spec(spec, upstreams)?;
            for method in &route.methods {
                if !seen.insert((route.path.clone(), method.to_string())) {
                    return Err(GatewayError::Config(format!(
                        "duplicate route {} {}",
                        method, route.path
                    )));
                }
            }
            routes.push(route);
        }

        Ok(Self { routes })
    }

    /// All routes in declaration order.
    #[must_use]
    pub fn routes(&self) -> &[Route] {
        &self.routes
    }
}

/// Fragment files under `dir`, lexicographically ordered.
fn fragment_files(dir: &Path) -> Result<Vec<std::path::PathBuf>, GatewayError> {
    let entries = fs::read_dir(dir)
        .map_err(|e| GatewayError::Config(format!("reading {}: {e}", dir.display())))?;

    let mut files: Vec<_> = entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| {
            matches!(
                p.extension().and_then(|e| e.to_str()),
                Some("yml" | "yaml")
            )
        })
        .collect();
    files.sort();
    Ok(files)
}

fn validate_spec(
    spec: RouteSpec,
    upstreams: &HashMap<String, String>,
) -> Result<Route, GatewayError> {
    let path = spec.path.trim().to_owned();
    if !path.starts_with('/') {
        return Err(GatewayError::Config(format!(
            "route path '{path}' must start with '/'"
        )));
    }
    if let Some(pos) = path.find('*') {
        if pos != path.len() - 1 || !path.ends_with("/*") {
            return Err(GatewayError::Config(format!(
                "route path '{path}': wildcard is only supported as a trailing '/*'"
            )));
        }
    }

    let upstream = expand_upstream(&spec.upstream, upstreams)?;
    let upstream_scheme_ok = match spec.kind {
        RouteKind::Rest => upstream.starts_with("http://") || upstream.starts_with("https://"),
        RouteKind::Websocket => {
            upstream.starts_with("http://")
                || upstream.starts_with("https://")
                || upstream.starts_with("ws://")
                || upstream.starts_with("wss://")
        }
    };
    if !upstream_scheme_ok {
        return Err(GatewayError::Config(format!(
            "route '{path}': upstream '{upstream}' has an unsupported scheme"
        )));
    }

    // Every {param} referenced by the upstream must be captured by the path.
    let path_params: HashSet<&str> = param_names(&path).into_iter().collect();
    for param in param_names(&upstream) {
        if !path_params.contains(param) {
            return Err(GatewayError::Config(format!(
                "route '{path}': upstream references unknown parameter '{{{param}}}'"
            )));
        }
    }
    if path.ends_with("/*") != upstream.ends_with("/*") {
        return Err(GatewayError::Config(format!(
            "route '{path}': wildcard must appear on both the path and the upstream"
        )));
    }

    let methods = match spec.kind {
        RouteKind::Websocket => vec![Method::GET],
        RouteKind::Rest => {
            if spec.methods.is_empty() {
                return Err(GatewayError::Config(format!(
                    "route '{path}' declares no methods"
                )));
            }
            spec.methods
                .iter()
                .map(|m| {
                    m.to_uppercase().parse::<Method>().map_err(|_| {
                        GatewayError::Config(format!("route '{path}': bad method '{m}'"))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?
        }
    };

    if let Some(limit) = spec.rate_limit {
        if limit.rps == 0 || limit.burst == 0 {
            return Err(GatewayError::Config(format!(
                "route '{path}': rate limit rps and burst must be non-zero"
            )));
        }
    }

    Ok(Route {
        path,
        upstream,
        methods,
        access: spec.access,
        rate_limit: spec.rate_limit,
        kind: spec.kind,
    })
}

/// Expand a leading `${name}` collaborator reference.
fn expand_upstream(
    upstream: &str,
    upstreams: &HashMap<String, String>,
) -> Result<String, GatewayError> {
    let Some(rest) = upstream.strip_prefix("${") else {
        return Ok(upstream.to_owned());
    };
    let Some((name, tail)) = rest.split_once('}') else {
        return Err(GatewayError::Config(format!(
            "upstream '{upstream}': unterminated collaborator reference"
        )));
    };
    let base = upstreams.get(name).ok_or_else(|| {
        GatewayError::Config(format!("upstream '{upstream}': unknown collaborator '{name}'"))
    })?;
    Ok(format!("{}{}", base.trim_end_matches('/'), tail))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upstreams() -> HashMap<String, String> {
        HashMap::from([("engine".to_owned(), "http://engine:8081".to_owned())])
    }

    fn spec(path: &str, upstream: &str, methods: &[&str]) -> RouteSpec {
        RouteSpec {
            path: path.into(),
            upstream: upstream.into(),
            methods: methods.iter().map(|m| (*m).to_owned()).collect(),
            access: Access::Public,
            rate_limit: None,
            kind: RouteKind::Rest,
        }
    }

    #[test]
    fn collaborator_expansion() {
        let table = RouteTable::from_specs(
            vec![spec("/api/automation/*", "${engine}/api/automation/*", &["GET"])],
            &upstreams(),
        )
        .unwrap();
        assert_eq!(
            table.routes()[0].upstream,
            "http://engine:8081/api/automation/*"
        );
    }

    #[test]
    fn unknown_collaborator_rejected() {
        let err = RouteTable::from_specs(
            vec![spec("/x", "${nope}/x", &["GET"])],
            &upstreams(),
        )
        .unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
    }

    #[test]
    fn duplicate_path_method_rejected() {
        let err = RouteTable::from_specs(
            vec![
                spec("/x", "http://a/x", &["GET", "POST"]),
                spec("/x", "http://b/x", &["POST"]),
            ],
            &HashMap::new(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate route"));
    }

    #[test]
    fn wildcard_must_be_trailing() {
        let err = RouteTable::from_specs(
            vec![spec("/a/*/b", "http://u/a/*", &["GET"])],
            &HashMap::new(),
        )
        .unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
    }

    #[test]
    fn upstream_params_must_resolve() {
        let err = RouteTable::from_specs(
            vec![spec("/w/{id}", "http://u/w/{other}", &["GET"])],
            &HashMap::new(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown parameter"));
    }

    #[test]
    fn axum_pattern_for_wildcard() {
        let table = RouteTable::from_specs(
            vec![spec("/ws/*", "http://u/ws/*", &["GET"])],
            &HashMap::new(),
        )
        .unwrap();
        let route = &table.routes()[0];
        assert!(route.is_wildcard());
        assert_eq!(route.axum_path(), "/ws/{*rest}");
        assert_eq!(route.wildcard_prefix(), "/ws/");
    }

    #[test]
    fn websocket_routes_are_get_only() {
        let mut s = spec("/ws/live", "ws://backend/live", &[]);
        s.kind = RouteKind::Websocket;
        let table = RouteTable::from_specs(vec![s], &HashMap::new()).unwrap();
        assert_eq!(table.routes()[0].methods, vec![Method::GET]);
    }

    #[test]
    fn fragments_merge_lexicographically() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("20-second.yaml"),
            "routes:\n  - path: /b\n    upstream: http://u/b\n    methods: [GET]\n    access: public\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("10-first.yaml"),
            "routes:\n  - path: /a\n    upstream: http://u/a\n    methods: [GET]\n    access: public\n",
        )
        .unwrap();
        fs::write(dir.path().join("ignored.txt"), "not routes").unwrap();

        let table = RouteTable::load(Vec::new(), Some(dir.path()), &HashMap::new()).unwrap();
        let paths: Vec<_> = table.routes().iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, vec!["/a", "/b"]);
    }
}
