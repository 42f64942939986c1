use thiserror::Error;

/// Errors surfaced by rate-store backends.
#[derive(Debug, Error)]
pub enum StateError {
    /// The backend could not be reached or a connection could not be
    /// obtained from the pool.
    #[error("state store connection error: {0}")]
    Connection(String),

    /// The backend reached the store but the operation failed.
    #[error("state store backend error: {0}")]
    Backend(String),
}
