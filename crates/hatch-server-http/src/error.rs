//! Relay error taxonomy and its HTTP mapping

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use hatch_proto::ErrorResponse;
use hatch_router::RegistryError;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("{0}")]
    NotFound(&'static str),

    #[error("exchange was already pulled")]
    AlreadyPulled,

    #[error("upstream forwarding failed: {0}")]
    UpstreamForwardingFailure(String),

    #[error("tunnel did not respond in time")]
    Timeout,

    #[error("internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Public callers whose tunnel has no live owner connection
    pub fn client_disconnected() -> Self {
        RelayError::NotFound("client disconnected")
    }

    pub fn unknown_exchange() -> Self {
        RelayError::NotFound("unknown exchange")
    }

    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            RelayError::NotFound(_) => StatusCode::NOT_FOUND,
            RelayError::AlreadyPulled => StatusCode::CONFLICT,
            RelayError::UpstreamForwardingFailure(_) => StatusCode::BAD_GATEWAY,
            RelayError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            RelayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            RelayError::InvalidRequest(_) => "invalid_request",
            RelayError::NotFound(_) => "not_found",
            RelayError::AlreadyPulled => "already_pulled",
            RelayError::UpstreamForwardingFailure(_) => "upstream_failure",
            RelayError::Timeout => "timeout",
            RelayError::Internal(_) => "internal_error",
        }
    }
}

impl From<RegistryError> for RelayError {
    fn from(e: RegistryError) -> Self {
        RelayError::InvalidRequest(e.to_string())
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        if let RelayError::Internal(reason) = &self {
            error!("Relay error: {}", reason);
        }
        let body = ErrorResponse {
            error: self.code().to_string(),
            message: self.to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}
