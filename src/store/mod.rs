pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::mfa::MfaCredential;
use crate::models::rate_limit::RateLimitAttempt;
use crate::models::session::Session;

/// A transient persistence failure.
///
/// This type is the boundary of the error taxonomy: everything that maps to
/// `StoreError` is "could not determine" and eligible for the fail-open
/// paths, while explicit invalidity (expired, exhausted, wrong code) is
/// expressed through return values, never through this error.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The connection pool could not hand out a connection.
    #[error("connection pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    /// The database rejected or failed the statement.
    #[error("database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    /// A row came back without an expected column.
    #[error("corrupt row: missing column {0}")]
    MissingColumn(&'static str),

    /// The backing store is unreachable.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Persistence for the `sessions` table.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Inserts a freshly created session row.
    async fn insert_session(&self, session: &Session) -> Result<(), StoreError>;

    /// Loads a session by id, active or not.
    async fn get_session(&self, id: &str) -> Result<Option<Session>, StoreError>;

    /// Bumps `last_activity` on an active session.
    async fn touch_session(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Marks a session inactive and stamps `ended_at`. Idempotent; a session
    /// is never revived afterwards.
    async fn deactivate_session(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Extends `expires_at` and touches `last_activity` on an active
    /// session. Returns false when no active row matched.
    async fn extend_session(
        &self,
        id: &str,
        expires_at: DateTime<Utc>,
        last_activity: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// All active sessions for a user, most-recently-active first.
    async fn active_sessions_for_user(&self, user_id: Uuid) -> Result<Vec<Session>, StoreError>;

    /// Deactivates every active session for the user except `keep_id`.
    /// Returns the number of sessions deactivated.
    async fn deactivate_all_except(
        &self,
        user_id: Uuid,
        keep_id: &str,
        at: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Deactivates every active session past its `expires_at`. Returns the
    /// number of sessions deactivated.
    async fn deactivate_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Hard-deletes session rows created before `cutoff`. Returns the number
    /// of rows removed.
    async fn purge_sessions_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Persistence for the append-only `rate_limit_attempts` table.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Appends one attempt row. Rows are write-once.
    async fn insert_attempt(&self, attempt: &RateLimitAttempt) -> Result<(), StoreError>;

    /// All attempts under `key` with `created_at >= since`, newest first.
    async fn attempts_since(
        &self,
        key: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<RateLimitAttempt>, StoreError>;

    /// Deletes every attempt under `key`. Returns the number removed.
    async fn delete_attempts(&self, key: &str) -> Result<u64, StoreError>;

    /// Deletes attempts older than `cutoff` across all keys. Returns the
    /// number removed.
    async fn purge_attempts_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Persistence for the `mfa_credentials` table.
#[async_trait]
pub trait MfaStore: Send + Sync {
    /// Creates or replaces the credential for a user (re-setup invalidates
    /// the previous secret and codes).
    async fn upsert_credential(&self, credential: &MfaCredential) -> Result<(), StoreError>;

    /// Loads the credential for a user.
    async fn get_credential(&self, user_id: Uuid) -> Result<Option<MfaCredential>, StoreError>;

    /// Flips `is_enabled`. Returns false when the user has no credential.
    async fn set_enabled(&self, user_id: Uuid, enabled: bool) -> Result<bool, StoreError>;

    /// Removes `code_hash` from the user's backup-code set if present, as a
    /// single atomic operation. Returns true when the code was present (and
    /// is now gone) - the success determination and the removal are one
    /// step so a code can never validate twice under concurrent requests.
    async fn consume_backup_code(&self, user_id: Uuid, code_hash: &str)
        -> Result<bool, StoreError>;

    /// Replaces the whole backup-code set. Returns false when the user has
    /// no credential.
    async fn replace_backup_codes(
        &self,
        user_id: Uuid,
        code_hashes: &[String],
    ) -> Result<bool, StoreError>;
}

/// A store that backs all three tables. Blanket-implemented so any concrete
/// store automatically qualifies.
pub trait Store: SessionStore + RateLimitStore + MfaStore {}

impl<T: SessionStore + RateLimitStore + MfaStore> Store for T {}
