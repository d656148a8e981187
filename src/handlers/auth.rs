use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tower_cookies::cookie::time::Duration as CookieDuration;
use tower_cookies::{Cookie, Cookies};

use crate::{
    audit::AuditEvent,
    error::{AppError, Result},
    identity::{self, ClientIp},
    middleware_layer::access::{AUTH_TOKEN_COOKIE, MFA_VERIFIED_COOKIE},
    models::rate_limit::RateLimitAction,
    models::session::{DeviceInfo, Session},
    services::sessions::RequestMeta,
    services::watcher::SessionWatcher,
    state::AppState,
};

/// The request payload for user login.
#[derive(Deserialize, Debug)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

/// The response payload for login.
#[derive(Serialize)]
pub struct LoginResponse {
    pub success: bool,
    pub message: String,
    /// Whether the caller must still complete the second-factor step.
    pub mfa_required: bool,
}

/// The response payload for simple state-changing requests.
#[derive(Serialize)]
pub struct AuthResponse {
    pub success: bool,
    pub message: String,
}

/// One session as shown on the active-sessions page.
#[derive(Serialize)]
pub struct SessionView {
    pub id: String,
    pub device_info: DeviceInfo,
    pub ip_address: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub last_activity: chrono::DateTime<chrono::Utc>,
    /// Whether this row is the session making the request.
    pub current: bool,
}

/// Creates a secure cookie with the given name, value, and max age.
pub fn create_secure_cookie(name: String, value: String, max_age_secs: i64) -> Cookie<'static> {
    let mut cookie = Cookie::new(name, value);

    let is_production =
        std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()) == "production";

    cookie.set_http_only(true);
    if is_production {
        cookie.set_secure(true);
    }
    cookie.set_same_site(tower_cookies::cookie::SameSite::Lax);
    cookie.set_max_age(CookieDuration::seconds(max_age_secs));
    cookie.set_path("/");

    cookie
}

pub fn expire_cookie(name: &'static str) -> Cookie<'static> {
    let mut cookie = Cookie::new(name, "");
    cookie.set_max_age(CookieDuration::seconds(0));
    cookie.set_path("/");
    cookie
}

/// Handles user login.
///
/// Order matters: the limiter is consulted before the credential check so
/// exhausted callers never reach the expensive hash verification, and the
/// attempt is recorded whichever way the check goes.
#[axum::debug_handler]
pub async fn login(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    headers: HeaderMap,
    cookies: Cookies,
    Json(payload): Json<LoginRequest>,
) -> Result<Response> {
    tracing::info!("🔐 Login attempt from {}", ip);

    if payload.email.trim().is_empty() {
        return Err(AppError::Validation("Email cannot be empty".to_string()));
    }
    if payload.password.is_empty() {
        return Err(AppError::Validation("Password cannot be empty".to_string()));
    }

    let identifier = format!("ip:{ip}");
    let decision = state
        .rate_limiter
        .check_rate_limit(&identifier, RateLimitAction::Login, None)
        .await;
    if !decision.allowed {
        return Err(AppError::RateLimited {
            reset_time: decision.reset_time,
            retry_after: decision.retry_after,
        });
    }

    let user = state
        .users
        .verify_credentials(&payload.email, &payload.password)
        .await?;

    let Some(user) = user else {
        state
            .rate_limiter
            .record_attempt(&identifier, RateLimitAction::Login, false, None)
            .await;
        tracing::warn!("❌ Failed login from {}", ip);
        return Err(AppError::Authentication(
            "Invalid email or password".to_string(),
        ));
    };

    state
        .rate_limiter
        .record_attempt(&identifier, RateLimitAction::Login, true, None)
        .await;

    let token = identity::generate_auth_token();
    let meta = RequestMeta {
        user_agent: headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string(),
        ip_address: ip,
    };
    let session_id = state.sessions.create_session(user.id, &token, &meta).await;

    let config = state.config.session;
    let watcher = SessionWatcher::spawn(
        state.sessions.clone(),
        session_id.clone(),
        Duration::from_secs((config.check_interval_minutes * 60) as u64),
        state.sign_outs.clone(),
    );
    state.watchers.insert(&session_id, watcher);

    cookies.add(create_secure_cookie(
        AUTH_TOKEN_COOKIE.to_string(),
        token,
        config.max_session_hours * 3600,
    ));

    let mfa_required = match state.mfa.is_enabled(user.id).await {
        Ok(enabled) => enabled,
        Err(e) => {
            // Indeterminate here is tolerable: the route gate re-checks and
            // fails closed on its own.
            tracing::warn!("⚠️ MFA lookup failed during login for {}: {}", user.id, e);
            false
        }
    };

    state.audit.emit(AuditEvent::new("login", user.id)).await;
    tracing::info!("✅ User logged in: {}", user.id);

    let response = LoginResponse {
        success: true,
        message: "Login successful".to_string(),
        mfa_required,
    };
    Ok((StatusCode::OK, Json(response)).into_response())
}

/// Handles user logout.
#[axum::debug_handler]
pub async fn logout(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    cookies: Cookies,
) -> Result<Response> {
    tracing::info!("👋 Logout for user: {}", session.user_id);

    state.watchers.stop(&session.id);
    state.sessions.end_session(&session.id).await?;

    cookies.remove(expire_cookie(AUTH_TOKEN_COOKIE));
    cookies.remove(expire_cookie(MFA_VERIFIED_COOKIE));

    state
        .audit
        .emit(AuditEvent::new("logout", session.user_id))
        .await;

    let response = AuthResponse {
        success: true,
        message: "Logout successful".to_string(),
    };
    Ok((StatusCode::OK, Json(response)).into_response())
}

/// Lists the caller's active sessions, most recently active first.
#[axum::debug_handler]
pub async fn list_sessions(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
) -> Result<Response> {
    let sessions = state
        .sessions
        .get_user_sessions(session.user_id)
        .await
        .map_err(AppError::Store)?;

    let views: Vec<SessionView> = sessions
        .into_iter()
        .map(|s| SessionView {
            current: s.id == session.id,
            id: s.id,
            device_info: s.device_info,
            ip_address: s.ip_address,
            created_at: s.created_at,
            last_activity: s.last_activity,
        })
        .collect();

    Ok((StatusCode::OK, Json(views)).into_response())
}

/// Ends every other session of the caller ("sign out everywhere else").
#[axum::debug_handler]
pub async fn terminate_other_sessions(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
) -> Result<Response> {
    let terminated = state
        .sessions
        .terminate_other_sessions(session.user_id, &session.id)
        .await
        .map_err(AppError::Store)?;

    tracing::info!(
        "✅ Terminated {} other sessions for user {}",
        terminated,
        session.user_id
    );

    let response = AuthResponse {
        success: true,
        message: format!("{terminated} other sessions terminated"),
    };
    Ok((StatusCode::OK, Json(response)).into_response())
}

/// Extends the caller's session to a full lifetime from now.
#[axum::debug_handler]
pub async fn refresh_session(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
) -> Result<Response> {
    let refreshed = state
        .sessions
        .refresh_session(&session.id)
        .await
        .map_err(AppError::Store)?;

    if !refreshed {
        return Err(AppError::Authentication(
            "Session is no longer active".to_string(),
        ));
    }

    let response = AuthResponse {
        success: true,
        message: "Session refreshed".to_string(),
    };
    Ok((StatusCode::OK, Json(response)).into_response())
}
