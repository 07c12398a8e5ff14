//! Unified application error types and conversion helpers.
//! These errors are intended for internal use; transport-facing serialization
//! happens via `ErrorResponse` for REST handlers and `ClientFacingError` for
//! live-session error frames.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use devicecloud::CloudError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// High-level classification for mapping to client error codes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed JSON / invalid schema
    Parse,
    /// Request was understood but values were invalid or out of range
    Validation,
    /// Missing or bad credentials
    Unauthorized,
    /// Operation not permitted for this principal
    Permission,
    /// The remote cloud rejected the request; its status is relayed
    Upstream,
    /// The remote cloud could not be reached (or timed out)
    Unavailable,
    /// Unexpected internal error / bug
    Internal,
}

/// Core error enum used throughout the application.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("permission denied: {0}")]
    Permission(String),
    #[error("device cloud rejected request with status {status}")]
    CloudStatus { status: u16, body: String },
    #[error("device cloud unavailable: {0}")]
    CloudUnavailable(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Parse(_) => ErrorKind::Parse,
            AppError::Validation(_) => ErrorKind::Validation,
            AppError::Unauthorized(_) => ErrorKind::Unauthorized,
            AppError::Permission(_) => ErrorKind::Permission,
            AppError::CloudStatus { .. } => ErrorKind::Upstream,
            AppError::CloudUnavailable(_) => ErrorKind::Unavailable,
            AppError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Short machine error code string (snake_case) used in client payloads.
    pub fn code(&self) -> &'static str {
        match self.kind() {
            ErrorKind::Parse => "parse_error",
            ErrorKind::Validation => "validation_error",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Permission => "permission_denied",
            ErrorKind::Upstream => "cloud_error",
            ErrorKind::Unavailable => "cloud_unavailable",
            ErrorKind::Internal => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Parse(_) | AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Permission(_) => StatusCode::FORBIDDEN,
            AppError::CloudStatus { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            AppError::CloudUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<CloudError> for AppError {
    fn from(err: CloudError) -> Self {
        match err {
            CloudError::Status { status, body } => AppError::CloudStatus { status, body },
            CloudError::Unavailable(msg) => AppError::CloudUnavailable(msg),
            CloudError::Envelope(e) => AppError::Internal(e.to_string()),
        }
    }
}

/// Simplified client-facing error payload, used inside live-session `error`
/// frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientFacingError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl From<&AppError> for ClientFacingError {
    fn from(err: &AppError) -> Self {
        // Cloud rejections keep the cloud's own body as detail so dashboard
        // users can see what the upstream actually said.
        let detail = match err {
            AppError::CloudStatus { body, .. } if !body.is_empty() => Some(body.clone()),
            _ => None,
        };
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
            detail,
        }
    }
}

/// Simple JSON error response for REST endpoints (distinct from the
/// live-session error frame).
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,   // machine code
    pub message: String, // human readable
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        // Cloud rejections relay the cloud's own body verbatim; everything
        // else gets the structured code/message payload.
        if let AppError::CloudStatus { body, .. } = &self {
            return (self.status(), body.clone()).into_response();
        }
        let status = self.status();
        let payload = ErrorResponse {
            error: self.code().to_string(),
            message: self.to_string(),
        };
        (status, Json(payload)).into_response()
    }
}

/// Shorthand constructors for common errors.
pub mod err {
    use super::AppError;
    pub fn parse(msg: impl Into<String>) -> AppError {
        AppError::Parse(msg.into())
    }
    pub fn validation(msg: impl Into<String>) -> AppError {
        AppError::Validation(msg.into())
    }
    pub fn unauthorized(msg: impl Into<String>) -> AppError {
        AppError::Unauthorized(msg.into())
    }
    pub fn permission(msg: impl Into<String>) -> AppError {
        AppError::Permission(msg.into())
    }
    pub fn internal(msg: impl Into<String>) -> AppError {
        AppError::Internal(msg.into())
    }
}
