//! domo API gateway.
//!
//! A configuration-driven reverse proxy in front of the platform: it
//! terminates REST and WebSocket traffic, verifies RS256 bearer tokens,
//! enforces the role hierarchy per route, applies distributed token-bucket
//! rate limits, and forwards requests to collaborator services declared in
//! the route table.

pub mod auth;
pub mod bridge;
pub mod config;
pub mod error;
pub mod metrics;
pub mod proxy;
pub mod ratelimit;
pub mod route;
pub mod server;
pub mod telemetry;

pub use config::GatewayConfig;
pub use error::GatewayError;
pub use route::{Access, Route, RouteKind, RouteTable};
pub use server::{AppState, router};
