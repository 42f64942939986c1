//! Trait abstractions for the shared rate-limit state store.
//!
//! The gateway runs as a fleet; every instance enforces the same token
//! buckets against one shared store. The [`RateStore`] contract is a single
//! atomic refill-and-decrement: backends must guarantee that concurrent
//! callers on different instances never jointly over-grant, and that the
//! store's own clock (not the caller's) drives refill so instances cannot
//! drift apart.

pub mod error;
pub mod key;
pub mod store;
pub mod testing;

pub use error::StateError;
pub use key::RateKey;
pub use store::{RateDecision, RateLimit, RateStore};
