use crate::services::DepositError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// A lightweight wrapper for general errors that keeps the message local.
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

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    /// Shortcut for 401 Unauthorized
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, msg)
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

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

impl From<DepositError> for AppError {
    fn from(err: DepositError) -> Self {
        let status = match &err {
            DepositError::CollectionNotFound(_) | DepositError::DepositNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            DepositError::DepositReadOnly(_) => StatusCode::METHOD_NOT_ALLOWED,
            DepositError::HashMismatch { .. } => StatusCode::PRECONDITION_FAILED,
            DepositError::InvalidContentType(_) => StatusCode::NOT_ACCEPTABLE,
            DepositError::UnsupportedPackaging(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            DepositError::InvalidDeposit(_) | DepositError::InvalidPartialFile(_) => {
                StatusCode::BAD_REQUEST
            }
            DepositError::OutOfDiskSpace => StatusCode::SERVICE_UNAVAILABLE,
            DepositError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError::new(status, err.to_string())
    }
}
