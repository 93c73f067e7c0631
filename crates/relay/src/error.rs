//! Error taxonomy for the relay.

use axum::http::StatusCode;
use telemetry::ErrorCategory;
use thiserror::Error;

/// Errors surfaced anywhere in the relay's request or deployment paths.
///
/// Request-path errors are recovered at the endpoint boundary and always
/// produce a structured JSON response; deployment errors are surfaced only
/// through notifications, alerts, and the action log.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Bad or missing signature; always a 401.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Body is not a JSON object or misses required fields; always a 400.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// Unexpected failure during handling; always a 500.
    #[error("processing error: {0}")]
    Processing(String),

    /// Failure calling an external collaborator.
    #[error("network error: {0}")]
    Network(String),

    /// External collaborator call timed out.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Orchestrator step failed; triggers rollback, not an HTTP error.
    #[error("deployment failed: {0}")]
    Deployment(String),
}

impl RelayError {
    /// Metrics category for this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Authentication(_) => ErrorCategory::Authentication,
            Self::MalformedPayload(_) => ErrorCategory::MalformedPayload,
            Self::Processing(_) | Self::Deployment(_) => ErrorCategory::Processing,
            Self::Network(_) => ErrorCategory::Network,
            Self::Timeout(_) => ErrorCategory::Timeout,
        }
    }

    /// HTTP status for request-path errors.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Authentication(_) => StatusCode::UNAUTHORIZED,
            Self::MalformedPayload(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(e.to_string())
        } else {
            Self::Network(e.to_string())
        }
    }
}
