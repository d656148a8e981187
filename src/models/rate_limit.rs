use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// The actions the sliding-window limiter tracks independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RateLimitAction {
    Login,
    Signup,
    PasswordReset,
    MfaVerification,
}

impl RateLimitAction {
    /// The textual form used in attempt keys and the `action` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitAction::Login => "login",
            RateLimitAction::Signup => "signup",
            RateLimitAction::PasswordReset => "passwordReset",
            RateLimitAction::MfaVerification => "mfaVerification",
        }
    }

    /// Parses the textual form, e.g. from an admin reset request.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "login" => Some(RateLimitAction::Login),
            "signup" => Some(RateLimitAction::Signup),
            "passwordReset" => Some(RateLimitAction::PasswordReset),
            "mfaVerification" => Some(RateLimitAction::MfaVerification),
            _ => None,
        }
    }
}

impl std::fmt::Display for RateLimitAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable attempt record. Written once, never updated; the window
/// count is always computed at read time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitAttempt {
    /// `action:identifier`, the lookup key.
    pub key: String,
    /// The caller identity (e.g. `ip:203.0.113.5` or `user:<uuid>`).
    pub identifier: String,
    /// The action that was attempted.
    pub action: String,
    /// Whether the attempted action succeeded.
    pub success: bool,
    /// Optional free-form context for audit review.
    pub metadata: Option<String>,
    /// The instant the attempt happened.
    pub created_at: DateTime<Utc>,
}

/// Per-action limiter tunables. Defaults are process-wide; callers may
/// override per invocation.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitQuota {
    /// Attempts permitted inside one window.
    pub max_attempts: u32,
    /// Length of the trailing window.
    pub window: Duration,
    /// How long the caller stays blocked after exhausting the window.
    pub block_duration: Duration,
}

impl RateLimitQuota {
    pub const fn new(max_attempts: u32, window: Duration, block_duration: Duration) -> Self {
        Self {
            max_attempts,
            window,
            block_duration,
        }
    }
}

/// The process-wide default quota table, one entry per action.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitDefaults {
    pub login: RateLimitQuota,
    pub signup: RateLimitQuota,
    pub password_reset: RateLimitQuota,
    pub mfa_verification: RateLimitQuota,
}

impl Default for RateLimitDefaults {
    fn default() -> Self {
        Self {
            login: RateLimitQuota::new(5, Duration::minutes(15), Duration::minutes(30)),
            signup: RateLimitQuota::new(3, Duration::hours(1), Duration::hours(1)),
            password_reset: RateLimitQuota::new(3, Duration::hours(1), Duration::hours(2)),
            mfa_verification: RateLimitQuota::new(5, Duration::minutes(15), Duration::hours(1)),
        }
    }
}

impl RateLimitDefaults {
    /// The default quota for an action.
    pub fn quota_for(&self, action: RateLimitAction) -> RateLimitQuota {
        match action {
            RateLimitAction::Login => self.login,
            RateLimitAction::Signup => self.signup,
            RateLimitAction::PasswordReset => self.password_reset,
            RateLimitAction::MfaVerification => self.mfa_verification,
        }
    }
}

/// The outcome of a limiter check.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitDecision {
    /// Whether the current call may proceed.
    pub allowed: bool,
    /// Attempts left after reserving the slot for the current call.
    pub remaining: u32,
    /// When the window resets (or the block lifts, when blocked).
    pub reset_time: DateTime<Utc>,
    /// Seconds until retry is worthwhile, present only when blocked.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<i64>,
}
