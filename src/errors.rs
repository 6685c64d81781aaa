use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::{fmt, io};
use thiserror::Error;

/// Failure kinds produced by the ingestion/delivery pipeline.
///
/// `Transport` and `NotFound` are expected at steady state and feed the
/// retry queue. `Validation` marks input the pipeline refuses to act on;
/// it is logged and skipped, never retried.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("ledger error: {0}")]
    Ledger(#[from] sqlx::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type RelayResult<T> = Result<T, RelayError>;

impl RelayError {
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Whether a failure of this kind should land in the retry queue.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Validation(_) | Self::Configuration(_))
    }
}

/// A lightweight wrapper for errors surfaced over HTTP.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<RelayError> for AppError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::NotFound(msg) => AppError::new(StatusCode::NOT_FOUND, msg),
            RelayError::Validation(msg) => AppError::new(StatusCode::BAD_REQUEST, msg),
            other => AppError::internal(other.to_string()),
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::internal(err.to_string())
    }
}
