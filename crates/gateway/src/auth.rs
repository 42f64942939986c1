//! Bearer-token verification and role checks.
//!
//! The credential service signs tokens with RS256; the gateway only holds
//! the public key, loaded once at startup. Tokens arrive in the
//! `Authorization: Bearer` header or, for WebSocket upgrades whose header
//! set the client cannot control, in the `auth_token` cookie. The header
//! wins when both are present.

use std::fs;
use std::path::Path;

use axum::http::HeaderMap;
use axum::http::header::{AUTHORIZATION, COOKIE};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};

use domo_core::{Claims, Role};

use crate::error::GatewayError;
use crate::route::Access;

/// Name of the cookie carrying a bearer token.
pub const AUTH_COOKIE: &str = "auth_token";

/// Verifies RS256 bearer tokens against the credential service's public key.
pub struct TokenVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    /// Load the PEM-encoded public key from `path`.
    pub fn from_pem_file(path: &Path) -> Result<Self, GatewayError> {
        let pem = fs::read(path).map_err(|e| {
            GatewayError::Config(format!("reading public key {}: {e}", path.display()))
        })?;
        Self::from_pem(&pem)
    }

    /// Build a verifier from PEM bytes.
    pub fn from_pem(pem: &[u8]) -> Result<Self, GatewayError> {
        let decoding_key = DecodingKey::from_rsa_pem(pem)
            .map_err(|e| GatewayError::Config(format!("parsing public key: {e}")))?;
        // Restricting the algorithm set rejects tokens signed with anything
        // other than RS256, including symmetric downgrade attempts.
        let validation = Validation::new(Algorithm::RS256);
        Ok(Self {
            decoding_key,
            validation,
        })
    }

    /// Verify a token and return its claims.
    pub fn verify(&self, token: &str) -> Result<Claims, GatewayError> {
        decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| GatewayError::Unauthorized(classify_error(&e)))
    }
}

fn classify_error(err: &jsonwebtoken::errors::Error) -> String {
    use jsonwebtoken::errors::ErrorKind;
    match err.kind() {
        ErrorKind::ExpiredSignature => "token expired".to_owned(),
        ErrorKind::InvalidAlgorithm => "wrong signing algorithm".to_owned(),
        ErrorKind::InvalidSignature => "invalid signature".to_owned(),
        _ => "invalid token".to_owned(),
    }
}

/// Pull a bearer token from the request headers.
///
/// The `Authorization` header takes precedence; the `auth_token` cookie is
/// consulted only when the header is absent.
#[must_use]
pub fn extract_token(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(AUTHORIZATION) {
        return value
            .to_str()
            .ok()
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(|t| t.trim().to_owned());
    }
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            (name == AUTH_COOKIE).then(|| value.to_owned())
        })
        .next()
}

/// Authenticate and authorize a request against a route's access class.
///
/// Public routes never consult the token. For protected routes a missing
/// or invalid token is 401 and an insufficient role is 403.
pub fn authorize(
    verifier: &TokenVerifier,
    access: Access,
    headers: &HeaderMap,
) -> Result<Option<Claims>, GatewayError> {
    if !access.requires_token() {
        return Ok(None);
    }

    let token = extract_token(headers)
        .ok_or_else(|| GatewayError::Unauthorized("missing token".to_owned()))?;
    let claims = verifier.verify(&token)?;

    if !claims.role.satisfies(access.required_role()) {
        return Err(GatewayError::Forbidden);
    }
    Ok(Some(claims))
}

/// The role required for an access class, re-exported for route dumps.
#[must_use]
pub fn required_role(access: Access) -> Role {
    access.required_role()
}
