use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use tower_cookies::Cookies;

use crate::{
    audit::AuditEvent,
    error::{AppError, Result},
    handlers::auth::{create_secure_cookie, expire_cookie, AuthResponse},
    identity,
    middleware_layer::access::{AUTH_TOKEN_COOKIE, MFA_VERIFIED_COOKIE},
    models::rate_limit::RateLimitAction,
    models::session::Session,
    services::sessions::Validation,
    state::AppState,
};

/// The request payload for completing the second-factor step.
#[derive(Deserialize, Debug)]
pub struct VerifyRequest {
    /// A 6-digit TOTP code or an 8-character backup code.
    pub code: String,
}

/// The request payload for enabling MFA.
#[derive(Deserialize, Debug)]
pub struct EnableRequest {
    pub token: String,
    /// The secret issued by the preceding setup call.
    pub secret: String,
}

/// The request payload for disabling MFA.
#[derive(Deserialize, Debug)]
pub struct DisableRequest {
    pub token: String,
}

/// The response payload for backup-code regeneration.
#[derive(Serialize)]
pub struct BackupCodesResponse {
    pub backup_codes: Vec<String>,
}

/// Starts a setup cycle for the caller.
#[axum::debug_handler]
pub async fn setup(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
) -> Result<Response> {
    let account = match state.users.find_by_id(session.user_id).await? {
        Some(user) => user.email,
        None => session.user_id.to_string(),
    };

    let setup = state.mfa.setup_mfa(session.user_id, &account).await?;
    Ok((StatusCode::OK, Json(setup)).into_response())
}

/// Enables MFA after re-verifying the freshly issued secret.
#[axum::debug_handler]
pub async fn enable(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Json(payload): Json<EnableRequest>,
) -> Result<Response> {
    let enabled = state
        .mfa
        .enable_mfa(session.user_id, &payload.token, &payload.secret)
        .await?;

    if !enabled {
        return Err(AppError::Mfa("Invalid verification code".to_string()));
    }

    let response = AuthResponse {
        success: true,
        message: "MFA enabled".to_string(),
    };
    Ok((StatusCode::OK, Json(response)).into_response())
}

/// Completes the second-factor step for the current session.
///
/// This endpoint is reachable without a completed step-up (the caller is
/// mid-login), so the session is resolved here rather than by the route
/// gate. Verification attempts are rate limited per user, not per IP: a
/// distributed guessing attack against one account still exhausts one
/// bucket.
#[axum::debug_handler]
pub async fn verify(
    State(state): State<AppState>,
    cookies: Cookies,
    Json(payload): Json<VerifyRequest>,
) -> Result<Response> {
    let Some(token) = cookies.get(AUTH_TOKEN_COOKIE).map(|c| c.value().to_string()) else {
        return Err(AppError::Authentication(
            "Authentication required".to_string(),
        ));
    };
    let session_id = identity::derive_session_id(&token);

    let session = match state
        .sessions
        .validate_session(&session_id)
        .await
        .map_err(AppError::Store)?
    {
        Validation::Valid(session) => session,
        _ => {
            return Err(AppError::Authentication(
                "Authentication required".to_string(),
            ));
        }
    };

    let identifier = format!("user:{}", session.user_id);
    let decision = state
        .rate_limiter
        .check_rate_limit(&identifier, RateLimitAction::MfaVerification, None)
        .await;
    if !decision.allowed {
        return Err(AppError::RateLimited {
            reset_time: decision.reset_time,
            retry_after: decision.retry_after,
        });
    }

    let code = payload.code.trim();
    let valid = if code.len() == 6 && code.chars().all(|c| c.is_ascii_digit()) {
        state.mfa.verify_mfa(session.user_id, code, None).await?
    } else {
        state.mfa.verify_backup_code(session.user_id, code).await?
    };

    state
        .rate_limiter
        .record_attempt(&identifier, RateLimitAction::MfaVerification, valid, None)
        .await;

    if !valid {
        tracing::warn!("❌ MFA verification failed for user {}", session.user_id);
        return Err(AppError::Mfa("Invalid verification code".to_string()));
    }

    // The step-up cookie is bound to this session id and dies with it.
    cookies.add(create_secure_cookie(
        MFA_VERIFIED_COOKIE.to_string(),
        session.id.clone(),
        state.config.session.max_session_hours * 3600,
    ));

    state
        .audit
        .emit(AuditEvent::new("mfa_verified", session.user_id))
        .await;
    tracing::info!("✅ MFA verified for user {}", session.user_id);

    let response = AuthResponse {
        success: true,
        message: "MFA verified".to_string(),
    };
    Ok((StatusCode::OK, Json(response)).into_response())
}

/// Disables MFA for the caller after verifying a current code.
#[axum::debug_handler]
pub async fn disable(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    cookies: Cookies,
    Json(payload): Json<DisableRequest>,
) -> Result<Response> {
    let valid = state
        .mfa
        .verify_mfa(session.user_id, payload.token.trim(), None)
        .await?;
    if !valid {
        return Err(AppError::Mfa("Invalid verification code".to_string()));
    }

    if !state.mfa.disable_mfa(session.user_id).await? {
        return Err(AppError::NotFound);
    }
    cookies.remove(expire_cookie(MFA_VERIFIED_COOKIE));

    let response = AuthResponse {
        success: true,
        message: "MFA disabled".to_string(),
    };
    Ok((StatusCode::OK, Json(response)).into_response())
}

/// Replaces the caller's backup codes and returns the new plaintext set.
#[axum::debug_handler]
pub async fn regenerate_backup_codes(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
) -> Result<Response> {
    let backup_codes = state.mfa.regenerate_backup_codes(session.user_id).await?;

    let response = BackupCodesResponse { backup_codes };
    Ok((StatusCode::OK, Json(response)).into_response())
}
