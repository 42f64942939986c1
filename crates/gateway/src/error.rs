use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Errors that can occur while the gateway handles a request.
///
/// Every variant maps to exactly one HTTP status and a stable `code` string;
/// all renderings use the `{error, code}` JSON body. Upstream error text is
/// never included in a response.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// A configuration error (startup only).
    #[error("configuration error: {0}")]
    Config(String),

    /// Authentication failed (missing, malformed, or expired token).
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Caller's role is below the route's requirement.
    #[error("forbidden")]
    Forbidden,

    /// No route matched, or a route collaborator is unknown.
    #[error("not found")]
    NotFound,

    /// Rate limit exceeded.
    #[error("rate limit exceeded")]
    RateLimited {
        /// Seconds until the caller can retry.
        retry_after: u64,
    },

    /// The upstream could not be reached or returned a transport error.
    /// The inner message is logged, never rendered.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// The upstream accepted the connection but did not answer in time.
    #[error("upstream timeout: {0}")]
    UpstreamTimeout(String),

    /// An invariant broke. Logged with detail, rendered opaquely.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// The stable machine-readable code for this error.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) | Self::Internal(_) => "internal",
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not_found",
            Self::RateLimited { .. } => "rate_limited",
            Self::Upstream(_) => "upstream_error",
            Self::UpstreamTimeout(_) => "upstream_timeout",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::Config(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// The message rendered to the client. Internal and upstream detail is
    /// replaced with a fixed phrase.
    fn public_message(&self) -> String {
        match self {
            Self::Config(_) | Self::Internal(_) => "internal error".to_owned(),
            Self::Upstream(_) => "upstream unavailable".to_owned(),
            Self::UpstreamTimeout(_) => "upstream timeout".to_owned(),
            Self::Unauthorized(msg) => format!("unauthorized: {msg}"),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = serde_json::json!({
            "error": self.public_message(),
            "code": self.code(),
        });

        let mut response = (status, axum::Json(body)).into_response();
        if let Self::RateLimited { retry_after } = self {
            response
                .headers_mut()
                .insert(axum::http::header::RETRY_AFTER, retry_after.into());
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_detail_never_leaks() {
        let err = GatewayError::Upstream("connect ECONNREFUSED 10.0.0.5:9000".into());
        assert_eq!(err.public_message(), "upstream unavailable");
        assert_eq!(err.code(), "upstream_error");
    }

    #[test]
    fn statuses_follow_the_taxonomy() {
        assert_eq!(
            GatewayError::Unauthorized("missing token".into()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(GatewayError::Forbidden.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            GatewayError::RateLimited { retry_after: 1 }.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            GatewayError::Upstream("x".into()).status(),
            StatusCode::BAD_GATEWAY
        );
    }
}
