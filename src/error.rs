use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::store::StoreError;

/// The application's error type.
///
/// The taxonomy is deliberate: `Store` is the only transient variant (an
/// indeterminate outcome a fail-open caller may tolerate), everything else
/// is a definitive determination and fails closed.
#[derive(Error, Debug)]
pub enum AppError {
    /// A transient persistence failure.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// An authentication error.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// An authorization denial. Always a hard 403, never a redirect.
    #[error("Authorization failed")]
    Forbidden,

    /// A resource not found error.
    #[error("Resource not found")]
    NotFound,

    /// A validation error.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The sliding-window limiter denied the call.
    #[error("Rate limit exceeded")]
    RateLimited {
        reset_time: DateTime<Utc>,
        retry_after: Option<i64>,
    },

    /// A second-factor setup or verification fault.
    #[error("MFA error: {0}")]
    Mfa(String),

    /// An internal server error.
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    /// Whether this error is a transient infrastructure fault rather than a
    /// definitive determination.
    pub fn is_transient(&self) -> bool {
        matches!(self, AppError::Store(_))
    }
}

/// A `Result` type that uses `AppError` as the error type.
pub type Result<T> = std::result::Result<T, AppError>;

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let AppError::RateLimited {
            reset_time,
            retry_after,
        } = &self
        {
            tracing::warn!("Rate limit exceeded, resets at {}", reset_time);
            let body = sonic_rs::to_string(&sonic_rs::json!({
                "error": "Too many requests",
                "resetTime": reset_time.to_rfc3339(),
                "retryAfter": retry_after,
            }))
            .unwrap_or_else(|_| r#"{"error":"Too many requests"}"#.to_string());
            return (StatusCode::TOO_MANY_REQUESTS, body).into_response();
        }

        let (status, message) = match self {
            AppError::Store(ref e) => {
                tracing::error!("Storage error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Storage error".to_string())
            }

            AppError::Authentication(ref msg) => {
                tracing::warn!("Authentication failed: {}", msg);
                (StatusCode::UNAUTHORIZED, msg.clone())
            }

            AppError::Forbidden => {
                tracing::warn!("Authorization failed");
                (StatusCode::FORBIDDEN, "Forbidden".to_string())
            }

            AppError::NotFound => {
                tracing::debug!("Resource not found");
                (StatusCode::NOT_FOUND, "Resource not found".to_string())
            }

            AppError::Validation(ref msg) => {
                tracing::debug!("Validation error: {}", msg);
                (StatusCode::BAD_REQUEST, msg.clone())
            }

            AppError::Mfa(ref msg) => {
                tracing::warn!("MFA error: {}", msg);
                (StatusCode::BAD_REQUEST, msg.clone())
            }

            AppError::Internal(ref msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }

            AppError::RateLimited { .. } => unreachable!("handled above"),
        };

        let body = sonic_rs::to_string(&sonic_rs::json!({
            "error": message
        }))
        .unwrap_or_else(|_| r#"{"error":"Internal server error"}"#.to_string());

        (status, body).into_response()
    }
}
