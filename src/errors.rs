use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::{fmt, io, time::Duration};
use thiserror::Error;

/// Failures of the vault and its backing stores.
///
/// Absent records and blobs are not errors: lookups return `Option` and
/// deletes are idempotent.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
    #[error("invalid blob reference `{namespace}/{id}`")]
    InvalidBlobReference { namespace: String, id: String },
    #[error("corrupted metadata record: {0}")]
    CorruptedRecord(String),
    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl VaultError {
    /// Storage I/O failures the caller may simply retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            VaultError::Sqlx(_) | VaultError::Io(_) | VaultError::Timeout { .. }
        )
    }
}

impl From<serde_json::Error> for VaultError {
    fn from(err: serde_json::Error) -> Self {
        VaultError::Serialization(err.to_string())
    }
}

pub type VaultResult<T> = Result<T, VaultError>;

/// A lightweight wrapper for errors returned by the HTTP surface.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
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

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
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

impl From<VaultError> for AppError {
    fn from(err: VaultError) -> Self {
        if err.is_retryable() {
            AppError::new(StatusCode::SERVICE_UNAVAILABLE, err.to_string())
        } else {
            AppError::internal(err.to_string())
        }
    }
}
