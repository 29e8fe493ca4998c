use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::cache::CacheError;
use crate::session::SessionError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),
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

/// Detailed message in development, a generic one in production
fn masked(detail: String, generic: &str) -> String {
    if is_production() {
        generic.to_string()
    } else {
        detail
    }
}

impl AppError {
    fn parts(&self) -> (StatusCode, &'static str, String, String) {
        match self {
            AppError::Config(e) => {
                let log_msg = e.to_string();
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "CONFIG_ERROR",
                    masked(log_msg.clone(), "Configuration error"),
                    log_msg,
                )
            }
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
            AppError::Unavailable(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "UNAVAILABLE",
                msg.clone(),
                msg.clone(),
            ),
            AppError::Internal(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                masked(e.clone(), "Internal server error"),
                e.clone(),
            ),
            AppError::Session(e) => session_parts(e),
            AppError::Cache(e) => {
                let log_msg = e.to_string();
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "CACHE_ERROR",
                    masked(log_msg.clone(), "Service temporarily unavailable"),
                    log_msg,
                )
            }
        }
    }
}

fn session_parts(err: &SessionError) -> (StatusCode, &'static str, String, String) {
    let log_msg = err.to_string();
    match err {
        SessionError::CapacityExceeded { .. } => (
            StatusCode::SERVICE_UNAVAILABLE,
            "TOO_BUSY",
            log_msg.clone(),
            log_msg,
        ),
        SessionError::NotAcceptingRequests => (
            StatusCode::SERVICE_UNAVAILABLE,
            "NOT_ACCEPTING_REQUESTS",
            log_msg.clone(),
            log_msg,
        ),
        SessionError::InvalidSession(_) => (
            StatusCode::GONE,
            "INVALID_SESSION",
            log_msg.clone(),
            log_msg,
        ),
        SessionError::OwnershipAcquisitionFailed { .. } => (
            StatusCode::CONFLICT,
            "OWNERSHIP_UNAVAILABLE",
            masked(log_msg.clone(), "Session is busy on another node"),
            log_msg,
        ),
        SessionError::ReplicationFailed { .. } | SessionError::Cache(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            "CACHE_ERROR",
            masked(log_msg.clone(), "Service temporarily unavailable"),
            log_msg,
        ),
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, client_message, log_message) = self.parts();

        // Always log the detailed error server-side
        if status.is_server_error() {
            tracing::error!(
                code = %code,
                status = %status.as_u16(),
                message = %log_message,
                "API error"
            );
        } else {
            tracing::debug!(
                code = %code,
                status = %status.as_u16(),
                message = %log_message,
                "API error"
            );
        }

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
