//! Gateway configuration.
//!
//! Loaded once at startup from a YAML file, then overridden by environment
//! variables (`LISTEN_ADDR`, `JWT_PUBLIC_KEY_PATH`, `RATE_LIMIT_STORE_ADDR`,
//! `RATE_LIMIT_DEFAULT_RPS`, `RATE_LIMIT_DEFAULT_BURST`, `LOG_LEVEL`,
//! `LOG_FORMAT`, and `UPSTREAM_URL_<NAME>` per collaborator). Route
//! fragments live in YAML files under `routes_dir` and are merged into the
//! root `routes` list in lexicographic order.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::GatewayError;
use crate::route::RouteSpec;

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration shared by both binaries.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `tracing` filter directive (e.g. `info`, `domo_gateway=debug`).
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: LogFormat::default(),
        }
    }
}

/// Rate limiter wiring.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Shared KV store endpoint. When absent the gateway falls back to a
    /// process-local store (single-node deployments and tests).
    pub store_addr: Option<String>,
    /// Optional global default cap applied to routes without their own
    /// limit. Both fields must be set for the default to take effect.
    pub default_rps: Option<u32>,
    pub default_burst: Option<u32>,
}

/// Top-level gateway configuration schema.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Bind address, e.g. `0.0.0.0:8080`.
    pub listen_addr: Option<String>,
    /// Path to the PEM-encoded RS256 public key.
    pub jwt_public_key_path: Option<PathBuf>,
    pub log: LogConfig,
    pub rate_limit: RateLimitConfig,
    /// Directory of route fragment files, relative to the config file.
    pub routes_dir: Option<PathBuf>,
    /// Collaborator base URLs referenced from routes as `${name}`.
    pub upstreams: HashMap<String, String>,
    /// Routes declared directly in the root file.
    pub routes: Vec<RouteSpec>,
}

impl GatewayConfig {
    /// Default bind address when neither file nor environment specifies one.
    pub const DEFAULT_LISTEN_ADDR: &'static str = "0.0.0.0:8080";

    /// Load the configuration file, or defaults when it does not exist,
    /// then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, GatewayError> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path).map_err(|e| {
                GatewayError::Config(format!("reading {}: {e}", path.display()))
            })?;
            serde_yaml_ng::from_str(&contents).map_err(|e| {
                GatewayError::Config(format!("parsing {}: {e}", path.display()))
            })?
        } else {
            tracing::info!(path = %path.display(), "config file not found, using defaults");
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    /// Apply environment-variable overrides on top of the file values.
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("LISTEN_ADDR") {
            self.listen_addr = Some(v);
        }
        if let Ok(v) = std::env::var("JWT_PUBLIC_KEY_PATH") {
            self.jwt_public_key_path = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("RATE_LIMIT_STORE_ADDR") {
            self.rate_limit.store_addr = Some(v);
        }
        if let Ok(v) = std::env::var("RATE_LIMIT_DEFAULT_RPS") {
            self.rate_limit.default_rps = v.parse().ok();
        }
        if let Ok(v) = std::env::var("RATE_LIMIT_DEFAULT_BURST") {
            self.rate_limit.default_burst = v.parse().ok();
        }
        if let Ok(v) = std::env::var("LOG_LEVEL") {
            self.log.level = v;
        }
        if let Ok(v) = std::env::var("LOG_FORMAT") {
            if v.eq_ignore_ascii_case("json") {
                self.log.format = LogFormat::Json;
            } else if v.eq_ignore_ascii_case("text") {
                self.log.format = LogFormat::Text;
            }
        }
        for (key, value) in std::env::vars() {
            if let Some(name) = key.strip_prefix("UPSTREAM_URL_") {
                self.upstreams.insert(name.to_lowercase(), value);
            }
        }
    }

    /// Effective bind address.
    #[must_use]
    pub fn listen_addr(&self) -> &str {
        self.listen_addr
            .as_deref()
            .unwrap_or(Self::DEFAULT_LISTEN_ADDR)
    }

    /// Effective global default rate limit, when fully specified.
    #[must_use]
    pub fn default_rate_limit(&self) -> Option<domo_state::RateLimit> {
        match (self.rate_limit.default_rps, self.rate_limit.default_burst) {
            (Some(rps), Some(burst)) if rps > 0 && burst > 0 => {
                Some(domo_state::RateLimit::new(rps, burst))
            }
            _ => None,
        }
    }
}
