use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::inbox::InboxError;
use crate::notification::DirectoryError;

mod notify;

pub use notify::NotifyError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
}

/// Check if running in production mode (based on RUN_MODE env var)
fn is_production() -> bool {
    std::env::var("RUN_MODE")
        .map(|m| m == "production" || m == "prod")
        .unwrap_or(false)
}

impl From<NotifyError> for AppError {
    fn from(err: NotifyError) -> Self {
        match err {
            NotifyError::TransientBroker { .. } | NotifyError::Broker(_) => {
                AppError::Unavailable(err.to_string())
            }
            NotifyError::Envelope(_) | NotifyError::UnknownEventType(_) => {
                AppError::Validation(err.to_string())
            }
            NotifyError::DuplicateNotification(_) => AppError::Conflict(err.to_string()),
            NotifyError::Inbox(inner) => inner.into(),
            NotifyError::Directory(inner) => inner.into(),
            NotifyError::Independence(crate::guardian::IndependenceStoreError::Storage(_)) => {
                AppError::Unavailable(err.to_string())
            }
            NotifyError::ApprovalExpired(_) => AppError::Conflict(err.to_string()),
            NotifyError::Approval(ref inner) => match inner {
                crate::guardian::ApprovalError::NotFound(_) => AppError::NotFound(err.to_string()),
                crate::guardian::ApprovalError::NotGuardian { .. } => {
                    AppError::Forbidden(err.to_string())
                }
                crate::guardian::ApprovalError::AlreadyResolved { .. } => {
                    AppError::Conflict(err.to_string())
                }
                _ => AppError::Internal(err.to_string()),
            },
            _ => AppError::Internal(err.to_string()),
        }
    }
}

impl From<InboxError> for AppError {
    fn from(err: InboxError) -> Self {
        match err {
            InboxError::NotFound(_) => AppError::NotFound(err.to_string()),
            InboxError::Duplicate(_) => AppError::Conflict(err.to_string()),
            InboxError::Storage(_) => AppError::Unavailable(err.to_string()),
            InboxError::Serialization(_) => AppError::Internal(err.to_string()),
        }
    }
}

impl From<DirectoryError> for AppError {
    fn from(err: DirectoryError) -> Self {
        match err {
            DirectoryError::NotFound(_) => AppError::NotFound(err.to_string()),
            DirectoryError::Unavailable(_) => AppError::Unavailable(err.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, client_message, log_message) = match &self {
            AppError::Config(e) => {
                let log_msg = e.to_string();
                let client_msg = if is_production() {
                    "Configuration error".to_string()
                } else {
                    log_msg.clone()
                };
                (StatusCode::INTERNAL_SERVER_ERROR, "CONFIG_ERROR", client_msg, log_msg)
            }
            AppError::Auth(msg) => (
                StatusCode::UNAUTHORIZED,
                "UNAUTHORIZED",
                msg.clone(),
                msg.clone(),
            ),
            AppError::Forbidden(msg) => (
                StatusCode::FORBIDDEN,
                "FORBIDDEN",
                msg.clone(),
                msg.clone(),
            ),
            AppError::Validation(msg) => (
                StatusCode::BAD_REQUEST,
                "VALIDATION_ERROR",
                msg.clone(),
                msg.clone(),
            ),
            AppError::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                msg.clone(),
                msg.clone(),
            ),
            AppError::Conflict(msg) => (
                StatusCode::CONFLICT,
                "CONFLICT",
                msg.clone(),
                msg.clone(),
            ),
            AppError::Unavailable(e) => {
                let log_msg = e.clone();
                let client_msg = if is_production() {
                    "Service temporarily unavailable".to_string()
                } else {
                    log_msg.clone()
                };
                (StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE", client_msg, log_msg)
            }
            AppError::Internal(e) => {
                let log_msg = e.clone();
                let client_msg = if is_production() {
                    "Internal server error".to_string()
                } else {
                    log_msg.clone()
                };
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", client_msg, log_msg)
            }
        };

        // Always log the detailed error server-side
        tracing::error!(
            code = %code,
            status = %status.as_u16(),
            message = %log_message,
            "API error"
        );

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message: client_message,
            },
        };

        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
