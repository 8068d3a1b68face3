//! Unified server error type.
//!
//! Every handler returns `Result<T, ServerError>`, which implements
//! [`axum::response::IntoResponse`] so errors are automatically converted to
//! a JSON-body HTTP response with an appropriate status code (§7, §10.3).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use seqforge_core::{SchedulerError, ValidationError};

#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed structural validation, reported synchronously before any
    /// engine work is done.
    #[error("invalid program: {0}")]
    InvalidProgram(#[from] ValidationError),

    /// Everything the scheduler itself can fail with once a program has
    /// passed validation.
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    /// The admission-control permit pool was exhausted at submission time.
    #[error("server is at capacity, no admission-control permit available")]
    Busy,

    /// The request body itself was malformed in a way validation doesn't
    /// cover (e.g. an empty `text` field).
    #[error("bad request: {0}")]
    BadRequest(String),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        // Cancellation closes the connection without a body (§7, §10.3):
        // there is no client left to read a JSON envelope.
        if let ServerError::Scheduler(SchedulerError::Cancelled) = &self {
            let status = StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST);
            return (status, ()).into_response();
        }

        let (status, message) = match &self {
            ServerError::InvalidProgram(e) => (StatusCode::BAD_REQUEST, e.to_string()),
            ServerError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
            ServerError::Busy => (
                StatusCode::SERVICE_UNAVAILABLE,
                self.to_string(),
            ),
            ServerError::Scheduler(e) => (scheduler_status(e), e.to_string()),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

fn scheduler_status(err: &SchedulerError) -> StatusCode {
    match err {
        SchedulerError::InvalidProgram(_) => StatusCode::BAD_REQUEST,
        SchedulerError::CapacityExceeded { .. } => StatusCode::SERVICE_UNAVAILABLE,
        SchedulerError::Busy => StatusCode::SERVICE_UNAVAILABLE,
        SchedulerError::OutOfSequenceNumbers => StatusCode::SERVICE_UNAVAILABLE,
        SchedulerError::SequenceFailuresExhausted { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        SchedulerError::Engine(_) => StatusCode::INTERNAL_SERVER_ERROR,
        SchedulerError::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
    }
}
