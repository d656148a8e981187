use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header::HeaderName, HeaderValue, Request},
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
};
use chrono::Duration;
use std::net::SocketAddr;
use tower_cookies::Cookies;

use crate::error::AppError;
use crate::identity;
use crate::middleware_layer::routes::{self, RouteClass};
use crate::models::rate_limit::{RateLimitAction, RateLimitQuota};
use crate::models::user::Role;
use crate::services::sessions::Validation;
use crate::state::AppState;

/// The cookie carrying the opaque auth token.
pub const AUTH_TOKEN_COOKIE: &str = "auth_token";
/// The cookie marking a completed second-factor step. Its value must equal
/// the current session id, so it cannot be replayed across sessions.
pub const MFA_VERIFIED_COOKIE: &str = "mfa_verified";

/// Outer throttle on the credential-bearing endpoints, looser than the
/// per-action quotas the handlers enforce themselves.
const AUTH_API_MAX_ATTEMPTS: u32 = 10;

/// The access-control gate applied to every request.
///
/// Classifies the path, resolves the session from the auth-token cookie,
/// and enforces the class's requirements. Denials on API paths render as
/// JSON statuses; denials on page paths redirect to the login page with
/// the original destination preserved. Every response leaving the gate,
/// allowed or denied, carries the security headers.
pub async fn access_control(
    State(state): State<AppState>,
    cookies: Cookies,
    request: Request<Body>,
    next: Next,
) -> Response {
    let mut response = gate(&state, &cookies, request, next).await;
    apply_security_headers(response.headers_mut());
    response
}

async fn gate(
    state: &AppState,
    cookies: &Cookies,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    let original = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| path.clone());
    let class = routes::classify(&path);

    if class == RouteClass::Public {
        return next.run(request).await;
    }

    if class == RouteClass::AuthApi {
        let peer = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ci| ci.0);
        let ip = identity::client_ip(request.headers(), peer);
        let identifier = format!("ip:{ip}");
        let action = auth_api_action(&path);
        let quota = RateLimitQuota::new(
            AUTH_API_MAX_ATTEMPTS,
            Duration::minutes(15),
            Duration::minutes(15),
        );

        let decision = state
            .rate_limiter
            .check_rate_limit(&identifier, action, Some(quota))
            .await;
        if !decision.allowed {
            tracing::warn!("❌ Throttled {} for {}", path, identifier);
            return AppError::RateLimited {
                reset_time: decision.reset_time,
                retry_after: decision.retry_after,
            }
            .into_response();
        }
        return next.run(request).await;
    }

    // Everything past this point requires a session.
    let Some(token) = cookies.get(AUTH_TOKEN_COOKIE).map(|c| c.value().to_string()) else {
        tracing::debug!("🔐 No auth token for {}", path);
        return deny_unauthenticated(&path, &original, None);
    };
    let session_id = identity::derive_session_id(&token);

    let session = match state.sessions.validate_session(&session_id).await {
        Ok(Validation::Valid(session)) => session,
        Ok(Validation::Expired) => {
            return deny_unauthenticated(&path, &original, Some("expired"));
        }
        Ok(Validation::Inactive) => {
            return deny_unauthenticated(&path, &original, Some("inactivity"));
        }
        Ok(Validation::NotFound) => {
            return deny_unauthenticated(&path, &original, None);
        }
        Err(e) => {
            tracing::error!("Session validation failed for {}: {}", path, e);
            return failure_response(&path);
        }
    };

    if class == RouteClass::Admin {
        match state.users.find_by_id(session.user_id).await {
            Ok(Some(user)) if user.role == Role::Admin => {}
            Ok(_) => {
                // Non-admins get a hard denial, never a redirect: the page
                // exists and the caller is known, they just may not enter.
                tracing::warn!("❌ Admin denial for user {}", session.user_id);
                return AppError::Forbidden.into_response();
            }
            Err(e) => {
                tracing::error!("Role lookup failed for {}: {}", session.user_id, e);
                return failure_response(&path);
            }
        }
    }

    if class == RouteClass::Mfa {
        match state.mfa.is_enabled(session.user_id).await {
            Ok(true) => {
                let verified = cookies
                    .get(MFA_VERIFIED_COOKIE)
                    .is_some_and(|c| c.value() == session.id);
                if !verified {
                    tracing::debug!("🔐 Step-up required for {}", path);
                    return deny_step_up(&path);
                }
            }
            Ok(false) => {}
            Err(e) => {
                tracing::error!("MFA lookup failed for {}: {}", session.user_id, e);
                return failure_response(&path);
            }
        }
    }

    request.extensions_mut().insert(session);
    next.run(request).await
}

/// The limiter action charged for a credential-bearing endpoint.
fn auth_api_action(path: &str) -> RateLimitAction {
    if path.starts_with("/api/auth/signup") {
        RateLimitAction::Signup
    } else if path.starts_with("/api/auth/password-reset") {
        RateLimitAction::PasswordReset
    } else if path.starts_with("/api/mfa/verify") {
        RateLimitAction::MfaVerification
    } else {
        RateLimitAction::Login
    }
}

/// Renders a missing/invalid-session denial: 401 for API calls, a login
/// redirect preserving the destination (and the sign-out reason) for pages.
fn deny_unauthenticated(path: &str, original: &str, reason: Option<&str>) -> Response {
    if routes::is_api_path(path) {
        return AppError::Authentication("Authentication required".to_string()).into_response();
    }

    let mut query = url::form_urlencoded::Serializer::new(String::new());
    query.append_pair("redirect", original);
    if let Some(reason) = reason {
        query.append_pair("reason", reason);
    }
    Redirect::to(&format!("/auth?{}", query.finish())).into_response()
}

/// Renders a missing-second-factor denial.
fn deny_step_up(path: &str) -> Response {
    if routes::is_api_path(path) {
        return AppError::Authentication("MFA verification required".to_string()).into_response();
    }
    Redirect::to("/auth/mfa").into_response()
}

/// Renders an indeterminate failure. The gate fails closed but never
/// pretends to know: no reason is attached and nothing is signed out.
fn failure_response(path: &str) -> Response {
    if routes::is_api_path(path) {
        return AppError::Internal("Access check failed".to_string()).into_response();
    }
    Redirect::to("/error").into_response()
}

const SECURITY_HEADERS: &[(&str, &str)] = &[
    ("x-frame-options", "DENY"),
    ("x-content-type-options", "nosniff"),
    ("referrer-policy", "strict-origin-when-cross-origin"),
    ("x-xss-protection", "1; mode=block"),
    (
        "content-security-policy",
        "default-src 'self'; script-src 'self' 'unsafe-inline'; style-src 'self' 'unsafe-inline'; \
         img-src 'self' data:; font-src 'self'",
    ),
];

/// Stamps the standard security headers onto a response.
pub fn apply_security_headers(headers: &mut http::HeaderMap) {
    for (name, value) in SECURITY_HEADERS {
        headers.insert(
            HeaderName::from_static(name),
            HeaderValue::from_static(value),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::TracingAuditSink;
    use crate::config::Config;
    use crate::models::rate_limit::RateLimitAttempt;
    use crate::services::directory::MemoryDirectory;
    use crate::services::sessions::RequestMeta;
    use crate::store::memory::MemoryStore;
    use crate::store::RateLimitStore;
    use axum::{http::StatusCode, middleware, Router};
    use chrono::Utc;
    use std::sync::Arc;
    use tower::ServiceExt;
    use tower_cookies::CookieManagerLayer;
    use uuid::Uuid;

    fn test_config() -> Config {
        Config {
            database_url: String::new(),
            allowed_origin: "http://localhost:3000".to_string(),
            mfa_issuer: "Gatehouse".to_string(),
            session: Default::default(),
            rate_limits: Default::default(),
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        directory: Arc<MemoryDirectory>,
        state: AppState,
        app: Router,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let directory = Arc::new(MemoryDirectory::new());
        let (state, _sign_outs) = AppState::assemble(
            store.clone(),
            directory.clone(),
            Arc::new(TracingAuditSink),
            test_config(),
        );

        let app = Router::new()
            .fallback(|| async { "ok" })
            .layer(middleware::from_fn_with_state(
                state.clone(),
                access_control,
            ))
            .layer(CookieManagerLayer::new());

        Harness {
            store,
            directory,
            state,
            app,
        }
    }

    async fn signed_in(harness: &Harness, role: Role) -> (Uuid, String) {
        let user_id = harness
            .directory
            .add_user("user@example.com", "hunter2hunter2", role)
            .unwrap();
        let token = identity::generate_auth_token();
        harness
            .state
            .sessions
            .create_session(
                user_id,
                &token,
                &RequestMeta {
                    user_agent: "curl/8.4.0".to_string(),
                    ip_address: "203.0.113.5".to_string(),
                },
            )
            .await;
        (user_id, token)
    }

    fn request(path: &str, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(path);
        if let Some(token) = token {
            builder = builder.header("cookie", format!("{AUTH_TOKEN_COOKIE}={token}"));
        }
        builder.body(Body::empty()).unwrap()
    }

    fn location(response: &Response) -> &str {
        response
            .headers()
            .get("location")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn public_paths_pass_and_carry_security_headers() {
        let harness = harness();
        let response = harness.app.oneshot(request("/health", None)).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers.get("x-frame-options").unwrap(), "DENY");
        assert_eq!(headers.get("x-content-type-options").unwrap(), "nosniff");
        assert_eq!(
            headers.get("referrer-policy").unwrap(),
            "strict-origin-when-cross-origin"
        );
        assert!(headers.contains_key("content-security-policy"));
    }

    #[tokio::test]
    async fn page_without_session_redirects_with_destination() {
        let harness = harness();
        let response = harness
            .app
            .oneshot(request("/dashboard?tab=traffic", None))
            .await
            .unwrap();

        assert!(response.status().is_redirection());
        assert_eq!(
            location(&response),
            "/auth?redirect=%2Fdashboard%3Ftab%3Dtraffic"
        );
        // Denials are headed too.
        assert_eq!(response.headers().get("x-frame-options").unwrap(), "DENY");
    }

    #[tokio::test]
    async fn api_without_session_gets_401() {
        let harness = harness();
        let response = harness
            .app
            .oneshot(request("/api/sessions", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn valid_session_passes() {
        let harness = harness();
        let (_, token) = signed_in(&harness, Role::Member).await;

        let response = harness
            .app
            .clone()
            .oneshot(request("/dashboard", Some(&token)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn expired_session_redirects_with_reason() {
        let harness = harness();
        let (_, token) = signed_in(&harness, Role::Member).await;

        // Rewind the stored session far past its hard lifetime.
        let session_id = identity::derive_session_id(&token);
        harness.store.age_session(&session_id, 25 * 60);

        let response = harness
            .app
            .oneshot(request("/dashboard", Some(&token)))
            .await
            .unwrap();
        assert!(response.status().is_redirection());
        let location = location(&response).to_string();
        assert!(location.contains("reason=expired"), "was {location}");
    }

    #[tokio::test]
    async fn admin_path_denies_members_hard() {
        let harness = harness();
        let (_, token) = signed_in(&harness, Role::Member).await;

        let response = harness
            .app
            .oneshot(request("/admin/users", Some(&token)))
            .await
            .unwrap();
        // A hard 403, not a redirect: the caller is authenticated.
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn admin_path_admits_admins() {
        let harness = harness();
        let (_, token) = signed_in(&harness, Role::Admin).await;

        let response = harness
            .app
            .oneshot(request("/admin/users", Some(&token)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn auth_api_is_throttled_per_ip() {
        let harness = harness();
        // No forwarding headers and no socket peer in oneshot tests, so the
        // limiter keys on the unknown-client bucket.
        for _ in 0..10 {
            harness
                .store
                .insert_attempt(&RateLimitAttempt {
                    key: "login:ip:unknown".to_string(),
                    identifier: "ip:unknown".to_string(),
                    action: "login".to_string(),
                    success: false,
                    metadata: None,
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }

        let response = harness
            .app
            .oneshot(request("/api/auth/login", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn auth_api_passes_under_quota() {
        let harness = harness();
        let response = harness
            .app
            .oneshot(request("/api/auth/login", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn mfa_route_requires_step_up_cookie() {
        let harness = harness();
        let (user_id, token) = signed_in(&harness, Role::Member).await;
        let setup = harness
            .state
            .mfa
            .setup_mfa(user_id, "user@example.com")
            .await
            .unwrap();
        harness
            .state
            .mfa
            .enable_mfa(user_id, &current_code(&setup.secret), &setup.secret)
            .await
            .unwrap();

        let response = harness
            .app
            .clone()
            .oneshot(request("/billing", Some(&token)))
            .await
            .unwrap();
        assert!(response.status().is_redirection());
        assert_eq!(location(&response), "/auth/mfa");

        // The step-up cookie is bound to the session id.
        let session_id = identity::derive_session_id(&token);
        let req = Request::builder()
            .uri("/billing")
            .header(
                "cookie",
                format!("{AUTH_TOKEN_COOKIE}={token}; {MFA_VERIFIED_COOKIE}={session_id}"),
            )
            .body(Body::empty())
            .unwrap();
        let response = harness.app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn mfa_route_rejects_foreign_step_up_cookie() {
        let harness = harness();
        let (user_id, token) = signed_in(&harness, Role::Member).await;
        let setup = harness
            .state
            .mfa
            .setup_mfa(user_id, "user@example.com")
            .await
            .unwrap();
        harness
            .state
            .mfa
            .enable_mfa(user_id, &current_code(&setup.secret), &setup.secret)
            .await
            .unwrap();

        let req = Request::builder()
            .uri("/billing")
            .header(
                "cookie",
                format!("{AUTH_TOKEN_COOKIE}={token}; {MFA_VERIFIED_COOKIE}=someoneelses"),
            )
            .body(Body::empty())
            .unwrap();
        let response = harness.app.oneshot(req).await.unwrap();
        assert!(response.status().is_redirection());
    }

    #[tokio::test]
    async fn storage_outage_fails_closed_without_a_verdict() {
        let harness = harness();
        let (_, token) = signed_in(&harness, Role::Member).await;
        harness.store.fail_reads(true);

        let response = harness
            .app
            .clone()
            .oneshot(request("/api/sessions", Some(&token)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let response = harness
            .app
            .oneshot(request("/dashboard", Some(&token)))
            .await
            .unwrap();
        assert!(response.status().is_redirection());
        assert_eq!(location(&response), "/error");
    }

    fn current_code(secret: &str) -> String {
        use totp_rs::{Algorithm, Secret, TOTP};
        let seed = Secret::Encoded(secret.to_string()).to_bytes().unwrap();
        TOTP::new(
            Algorithm::SHA1,
            6,
            2,
            30,
            seed,
            Some("Gatehouse".to_string()),
            "test".to_string(),
        )
        .unwrap()
        .generate_current()
        .unwrap()
    }
}
