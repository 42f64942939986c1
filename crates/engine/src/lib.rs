//! domo automation engine.
//!
//! Persists workflows as validated node/edge graphs, evaluates their
//! triggers (manual, cron schedule, device state), executes runs as a
//! depth-first walk over the DAG with typed node semantics, and streams
//! live run events to WebSocket subscribers with bounded replay.

pub mod api;
pub mod collab;
pub mod config;
pub mod error;
pub mod executor;
pub mod hub;
pub mod ir;
pub mod metrics;
pub mod store;
pub mod telemetry;
pub mod trigger;

pub use config::EngineConfig;
pub use error::EngineError;
pub use executor::{Executor, ExecutorConfig};
pub use hub::EventHub;
pub use ir::{Definition, normalize_and_validate};
pub use trigger::TriggerManager;
