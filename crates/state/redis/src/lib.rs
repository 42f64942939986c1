//! Redis-backed rate store.
//!
//! One Lua script performs refill-and-decrement atomically per bucket, with
//! the Redis `TIME` command as the clock. All gateway instances sharing the
//! store therefore observe one linearizable token bucket per `(scope,
//! identity)` pair, regardless of their own clock drift.

mod config;
mod key_render;
mod scripts;
mod store;

pub use config::RedisConfig;
pub use store::RedisRateStore;
