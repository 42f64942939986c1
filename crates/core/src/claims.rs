use serde::{Deserialize, Serialize};

use crate::role::Role;

/// Claims carried by a verified bearer token.
///
/// Tokens are minted by the credential service; the gateway only verifies
/// them against the service's public key. After verification the claims are
/// attached to the request so downstream components (role checks, rate-limit
/// key derivation, proxied upstreams) can read them without re-parsing the
/// token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Stable user identifier.
    pub sub: String,
    /// Role granted to this principal.
    pub role: Role,
    /// Token issuer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    /// Expiration time (Unix timestamp, seconds).
    pub exp: i64,
    /// Issued at (Unix timestamp, seconds).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
}

impl Claims {
    /// Rate-limit identity key for this principal: `user:<sub>`.
    #[must_use]
    pub fn rate_key(&self) -> String {
        format!("user:{}", self.sub)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_with_optional_fields_absent() {
        let claims: Claims =
            serde_json::from_str(r#"{"sub":"u-1","role":"resident","exp":4102444800}"#).unwrap();
        assert_eq!(claims.sub, "u-1");
        assert_eq!(claims.role, Role::Resident);
        assert!(claims.iss.is_none());
    }

    #[test]
    fn rate_key_uses_subject() {
        let claims = Claims {
            sub: "abc".into(),
            role: Role::User,
            iss: None,
            exp: 0,
            iat: None,
        };
        assert_eq!(claims.rate_key(), "user:abc");
    }
}
