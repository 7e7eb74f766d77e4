//! HTTP error type and status mapping.

use axum::http::StatusCode;
use axum::http::header::CONTENT_RANGE;
use axum::response::{IntoResponse, Response};
use strata_engine::{EngineError, ErrorClass};

/// Errors returned by object server handlers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// A path segment or header could not be parsed.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// No live object at this path.
    #[error("not found")]
    NotFound,

    /// The body did not match the `ETag` the client sent.
    #[error("etag mismatch: expected {expected}, got {actual}")]
    EtagMismatch { expected: String, actual: String },

    /// The `Range` lies outside the object.
    #[error("range not satisfiable for {length} bytes")]
    RangeNotSatisfiable { length: u64 },

    /// The body is larger than the server accepts.
    #[error("request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: u64 },

    /// An error from the storage engine.
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl ApiError {
    /// Map to an HTTP status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::EtagMismatch { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Engine(EngineError::UnknownDevice(_)) => StatusCode::INSUFFICIENT_STORAGE,
            Self::Engine(e) => match e.class() {
                ErrorClass::Validation => StatusCode::BAD_REQUEST,
                ErrorClass::Conflict => StatusCode::CONFLICT,
                ErrorClass::NotFound => StatusCode::NOT_FOUND,
                ErrorClass::Database => StatusCode::SERVICE_UNAVAILABLE,
                ErrorClass::Integrity | ErrorClass::TransientPeer => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self, "request failed");
        } else {
            tracing::debug!(status = status.as_u16(), error = %self, "request rejected");
        }
        match self {
            Self::RangeNotSatisfiable { length } => {
                (status, [(CONTENT_RANGE, format!("bytes */{length}"))]).into_response()
            }
            other => (status, other.to_string()).into_response(),
        }
    }
}
