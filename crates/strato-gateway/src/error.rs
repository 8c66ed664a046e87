//! Error types for the gateway

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Result type for gateway handlers
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for gateway handlers
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The request names no model (no body field, header, or path segment)
    #[error("unable to determine model from request")]
    MissingModel,

    /// No Model resource with this name exists
    #[error("model not found: {0}")]
    ModelNotFound(String),

    /// Malformed or oversized request
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The per-request timeout expired before a replica became ready
    #[error("timed out waiting for a ready model replica")]
    Timeout,

    /// The request was cancelled while waiting for a replica (client gone
    /// or control plane shutting down); counters released, no retry
    #[error("request cancelled while waiting for a model replica")]
    ClientCancelled,

    /// The backend failed after exhausting retries
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Internal server error
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<strato_common::Error> for Error {
    fn from(e: strato_common::Error) -> Self {
        match e {
            strato_common::Error::Kube { source } => Error::Kube(source),
            other => Error::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        // Nginx-style "client closed request"; no standard constant exists.
        let client_closed_request =
            StatusCode::from_u16(499).unwrap_or(StatusCode::REQUEST_TIMEOUT);

        let (status, error_type) = match &self {
            Error::MissingModel => (StatusCode::BAD_REQUEST, "invalid_request_error"),
            Error::ModelNotFound(_) => (StatusCode::NOT_FOUND, "invalid_request_error"),
            Error::BadRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request_error"),
            Error::Timeout => (StatusCode::GATEWAY_TIMEOUT, "timeout_error"),
            Error::ClientCancelled => (client_closed_request, "cancelled_error"),
            Error::Upstream(_) => (StatusCode::BAD_GATEWAY, "upstream_error"),
            Error::Kube(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
            Error::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        // OpenAI-style error body
        let body = serde_json::json!({
            "error": {
                "message": self.to_string(),
                "type": error_type,
            }
        });

        (status, axum::Json(body)).into_response()
    }
}
