use anyhow::{Context, Result};
use std::env;

use crate::models::rate_limit::RateLimitDefaults;

/// Session lifecycle tunables.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Idle minutes after which a session is invalid even if unexpired.
    pub max_inactive_minutes: i64,
    /// Hard session lifetime in hours.
    pub max_session_hours: i64,
    /// Concurrency cap per user.
    pub max_concurrent_sessions: usize,
    /// Interval of the periodic re-validation loop, in minutes.
    pub check_interval_minutes: i64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_inactive_minutes: 120,
            max_session_hours: 24,
            max_concurrent_sessions: 10,
            check_interval_minutes: 5,
        }
    }
}

/// The application's configuration.
#[derive(Clone)]
pub struct Config {
    /// The URL of the PostgreSQL database.
    pub database_url: String,
    /// The origin allowed to call the API with credentials.
    pub allowed_origin: String,
    /// The issuer name stamped into TOTP provisioning URIs.
    pub mfa_issuer: String,
    /// Session lifecycle tunables.
    pub session: SessionConfig,
    /// Per-action sliding-window defaults.
    pub rate_limits: RateLimitDefaults,
}

impl Config {
    /// Creates a new `Config` from environment variables.
    ///
    /// # Returns
    ///
    /// A `Result` containing the `Config`.
    pub fn from_env() -> Result<Self> {
        let session = SessionConfig {
            max_inactive_minutes: env_or("SESSION_MAX_INACTIVE_MINUTES", 120)?,
            max_session_hours: env_or("SESSION_MAX_HOURS", 24)?,
            max_concurrent_sessions: env_or("SESSION_MAX_CONCURRENT", 10)?,
            check_interval_minutes: env_or("SESSION_CHECK_INTERVAL_MINUTES", 5)?,
        };

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            allowed_origin: env::var("ALLOWED_ORIGIN")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            mfa_issuer: env::var("MFA_ISSUER").unwrap_or_else(|_| "Gatehouse".to_string()),
            session,
            rate_limits: RateLimitDefaults::default(),
        })
    }
}

/// Reads an optional numeric environment variable with a default.
fn env_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value.parse().with_context(|| format!("Invalid {name}")),
        Err(_) => Ok(default),
    }
}
