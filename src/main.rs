use axum::{
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};

use http::{header, Method};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_cookies::CookieManagerLayer;
use tower_governor::governor::GovernorConfigBuilder;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnFailure, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};

use tracing::Level;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod audit;
mod config;
mod db;
mod error;
mod identity;
mod state;
mod store;

mod models {
    pub mod mfa;
    pub mod rate_limit;
    pub mod session;
    pub mod user;
}

mod services {
    pub mod directory;
    pub mod mfa;
    pub mod rate_limit;
    pub mod sessions;
    pub mod watcher;
}

mod handlers {
    pub mod admin;
    pub mod auth;
    pub mod health;
    pub mod mfa;
}

mod middleware_layer {
    pub mod access;
    pub mod routes;
}

use config::Config;
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();

    let config = Config::from_env()?;
    tracing::info!("✅ Configuration loaded successfully");

    let (state, mut sign_outs) = AppState::new(&config)?;
    tracing::info!("✅ AppState initialized");

    let cors = CorsLayer::new()
        .allow_origin([config.allowed_origin.parse::<http::HeaderValue>()?])
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT, header::COOKIE])
        .allow_credentials(true)
        .max_age(Duration::from_secs(86400));

    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(100)
            .burst_size(500)
            .use_headers()
            .finish()
            .expect("governor config is valid"),
    );

    let auth_routes = Router::new()
        .route("/api/auth/login", post(handlers::auth::login))
        .route("/api/mfa/verify", post(handlers::mfa::verify))
        .with_state(state.clone());

    let protected_routes = Router::new()
        .route("/api/auth/logout", post(handlers::auth::logout))
        .route("/api/auth/refresh", post(handlers::auth::refresh_session))
        .route("/api/auth/sessions", get(handlers::auth::list_sessions))
        .route(
            "/api/auth/sessions/terminate-others",
            post(handlers::auth::terminate_other_sessions),
        )
        .route("/api/mfa/setup", post(handlers::mfa::setup))
        .route("/api/mfa/enable", post(handlers::mfa::enable))
        .route("/api/mfa/disable", post(handlers::mfa::disable))
        .route(
            "/api/mfa/backup-codes",
            post(handlers::mfa::regenerate_backup_codes),
        )
        .layer(tower_governor::GovernorLayer::new(governor_conf.clone()))
        .with_state(state.clone());

    let admin_routes = Router::new()
        .route(
            "/api/admin/rate-limits/reset",
            post(handlers::admin::reset_rate_limit),
        )
        .with_state(state.clone());

    let app = Router::new()
        .route("/health", get(handlers::health::health))
        .merge(auth_routes)
        .merge(protected_routes)
        .merge(admin_routes)
        .layer(from_fn_with_state(
            state.clone(),
            middleware_layer::access::access_control,
        ))
        .layer(CookieManagerLayer::new())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::default())
                .on_request(DefaultOnRequest::default().level(Level::DEBUG))
                .on_response(DefaultOnResponse::default().level(Level::DEBUG))
                .on_failure(DefaultOnFailure::default().level(Level::ERROR)),
        )
        .layer(cors);

    // Drains forced sign-outs from the per-session watchers. The cookie can
    // only be cleared on the user's next request; the record here is what
    // ties the eventual login redirect back to a cause.
    tokio::spawn(async move {
        while let Some(sign_out) = sign_outs.recv().await {
            tracing::info!(
                "👋 Session {} signed out ({})",
                sign_out.session_id,
                sign_out.reason.as_str()
            );
        }
    });

    let cleanup_state = state.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            tracing::info!("🧹 Running scheduled cleanup...");

            match cleanup_state.sessions.cleanup_expired_sessions().await {
                Ok((deactivated, purged)) => {
                    tracing::info!(
                        "✅ Session cleanup: {} deactivated, {} purged",
                        deactivated,
                        purged
                    );
                }
                Err(e) => {
                    tracing::error!("❌ Session cleanup failed: {}", e);
                }
            }

            match cleanup_state.rate_limiter.purge_old_attempts().await {
                Ok(removed) => {
                    tracing::info!("✅ Attempt cleanup: {} rows removed", removed);
                }
                Err(e) => {
                    tracing::error!("❌ Attempt cleanup failed: {}", e);
                }
            }
        }
    });

    let addr = SocketAddr::from(([127, 0, 0, 1], 8080));
    tracing::info!("🚀 Server listening on http://{}", addr);
    tracing::info!("✅ Background cleanup job started (runs every hour)");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
