use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::ir::IrError;

/// Errors surfaced by the engine's HTTP boundary.
///
/// All renderings use the `{error, code}` JSON body. Node failures inside a
/// run never surface here: they are recorded as step failures and observable
/// through the event stream and the run record.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed input or a failed definition validation.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Workflow or run id does not exist.
    #[error("not found")]
    NotFound,

    /// Run admission rejected: one is already in flight for the workflow.
    #[error("workflow already has a run in flight")]
    Conflict,

    /// A configuration error (startup only).
    #[error("configuration error: {0}")]
    Config(String),

    /// A collaborator could not be reached.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Store failure or broken invariant. Logged with detail, rendered
    /// opaquely.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<IrError> for EngineError {
    fn from(err: IrError) -> Self {
        Self::BadRequest(err.to_string())
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound,
            other => Self::Internal(format!("store error: {other}")),
        }
    }
}

impl EngineError {
    /// The stable machine-readable code for this error.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Upstream(_) => "upstream_error",
            Self::Config(_) | Self::Internal(_) => "internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Conflict => StatusCode::CONFLICT,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Config(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn public_message(&self) -> String {
        match self {
            Self::Config(_) | Self::Internal(_) => "internal error".to_owned(),
            Self::Upstream(_) => "upstream unavailable".to_owned(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        if matches!(self, Self::Internal(_) | Self::Config(_)) {
            tracing::error!(error = %self, "internal error");
        }
        let body = serde_json::json!({
            "error": self.public_message(),
            "code": self.code(),
        });
        (self.status(), axum::Json(body)).into_response()
    }
}
