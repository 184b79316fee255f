//! Crate-wide error taxonomy. Handlers are thin translators from
//! these kinds to HTTP status codes; background loops log and continue.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum TinyObsError {
    #[error("invalid sample: {0}")]
    InvalidSample(String),

    #[error("batch exceeds max metrics per request: {0}")]
    TooManyMetrics(String),

    #[error("cardinality exceeded: {0}")]
    CardinalityExceeded(String),

    #[error("storage full: {0}")]
    StorageFull(String),

    #[error("query resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("parse error: {0}")]
    ParseError(String),
}

impl TinyObsError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            TinyObsError::InvalidSample(_) => StatusCode::BAD_REQUEST,
            TinyObsError::TooManyMetrics(_) => StatusCode::BAD_REQUEST,
            TinyObsError::CardinalityExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            TinyObsError::StorageFull(_) => StatusCode::INSUFFICIENT_STORAGE,
            TinyObsError::ResourceExhausted(_) => StatusCode::INTERNAL_SERVER_ERROR,
            TinyObsError::Cancelled => StatusCode::INTERNAL_SERVER_ERROR,
            TinyObsError::StorageUnavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
            TinyObsError::ParseError(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for TinyObsError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({ "status": "error", "error": self.to_string() }));
        (status, body).into_response()
    }
}

/// Outcome of a `RunGC` call. `NoReclaim` is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcOutcome {
    Reclaimed,
    NoReclaim,
}

pub type Result<T> = std::result::Result<T, TinyObsError>;
