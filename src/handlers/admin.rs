use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::{Deserialize, Serialize};

use crate::{
    audit::AuditEvent,
    error::{AppError, Result},
    models::rate_limit::RateLimitAction,
    models::session::Session,
    state::AppState,
};

/// The request payload for an administrative rate-limit reset.
#[derive(Deserialize, Debug)]
pub struct ResetRateLimitRequest {
    /// The throttled identity, e.g. `ip:203.0.113.5` or `user:<uuid>`.
    pub identifier: String,
    /// The action bucket to clear, e.g. `login`.
    pub action: String,
}

/// The response payload for a rate-limit reset.
#[derive(Serialize)]
pub struct ResetRateLimitResponse {
    pub success: bool,
    /// How many attempt records were removed.
    pub removed: u64,
}

/// Clears a rate-limit bucket. Admin-only; the route gate has already
/// verified the role before this runs.
#[axum::debug_handler]
pub async fn reset_rate_limit(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Json(payload): Json<ResetRateLimitRequest>,
) -> Result<Response> {
    let Some(action) = RateLimitAction::parse(&payload.action) else {
        return Err(AppError::Validation(format!(
            "Unknown action: {}",
            payload.action
        )));
    };

    let removed = state
        .rate_limiter
        .reset_rate_limit(&payload.identifier, action)
        .await
        .map_err(AppError::Store)?;

    state
        .audit
        .emit(
            AuditEvent::new("rate_limit_reset", session.user_id)
                .with_detail(format!("{}:{}", action, payload.identifier)),
        )
        .await;

    let response = ResetRateLimitResponse {
        success: true,
        removed,
    };
    Ok((StatusCode::OK, Json(response)).into_response())
}
