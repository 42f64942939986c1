use serde::{Deserialize, Serialize};

/// Identifies one token bucket: a scope crossed with a caller identity.
///
/// The scope is the route path the limit is declared on, or `"global"` for
/// the process-wide default limit. The identity is `user:<sub>` for
/// authenticated callers and `ip:<remote>` otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RateKey {
    pub scope: String,
    pub identity: String,
}

impl RateKey {
    /// Create a new rate key.
    pub fn new(scope: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            identity: identity.into(),
        }
    }

    /// Scope used when only the global default limit applies.
    pub const GLOBAL_SCOPE: &'static str = "global";
}
