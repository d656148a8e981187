use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use tokio_postgres::Row;
use uuid::Uuid;

use crate::models::mfa::MfaCredential;
use crate::models::rate_limit::RateLimitAttempt;
use crate::models::session::{DeviceClass, DeviceInfo, Session};
use crate::store::{MfaStore, RateLimitStore, SessionStore, StoreError};

/// The PostgreSQL-backed store. See `schema.sql` for the table layout.
#[derive(Clone)]
pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

/// A helper function to map a `tokio_postgres::Row` to a `Session`.
fn row_to_session(row: &Row) -> Result<Session, StoreError> {
    let device_class: String = row
        .try_get("device_class")
        .map_err(|_| StoreError::MissingColumn("device_class"))?;
    Ok(Session {
        id: row.try_get("id").map_err(|_| StoreError::MissingColumn("id"))?,
        user_id: row
            .try_get("user_id")
            .map_err(|_| StoreError::MissingColumn("user_id"))?,
        device_info: DeviceInfo {
            browser: row
                .try_get("browser")
                .map_err(|_| StoreError::MissingColumn("browser"))?,
            os: row.try_get("os").map_err(|_| StoreError::MissingColumn("os"))?,
            device_class: DeviceClass::parse(&device_class),
            user_agent: row
                .try_get("user_agent")
                .map_err(|_| StoreError::MissingColumn("user_agent"))?,
        },
        ip_address: row
            .try_get("ip_address")
            .map_err(|_| StoreError::MissingColumn("ip_address"))?,
        created_at: row
            .try_get("created_at")
            .map_err(|_| StoreError::MissingColumn("created_at"))?,
        last_activity: row
            .try_get("last_activity")
            .map_err(|_| StoreError::MissingColumn("last_activity"))?,
        expires_at: row
            .try_get("expires_at")
            .map_err(|_| StoreError::MissingColumn("expires_at"))?,
        ended_at: row
            .try_get("ended_at")
            .map_err(|_| StoreError::MissingColumn("ended_at"))?,
        is_active: row
            .try_get("is_active")
            .map_err(|_| StoreError::MissingColumn("is_active"))?,
    })
}

/// A helper function to map a `tokio_postgres::Row` to a `RateLimitAttempt`.
fn row_to_attempt(row: &Row) -> Result<RateLimitAttempt, StoreError> {
    Ok(RateLimitAttempt {
        key: row.try_get("key").map_err(|_| StoreError::MissingColumn("key"))?,
        identifier: row
            .try_get("identifier")
            .map_err(|_| StoreError::MissingColumn("identifier"))?,
        action: row
            .try_get("action")
            .map_err(|_| StoreError::MissingColumn("action"))?,
        success: row
            .try_get("success")
            .map_err(|_| StoreError::MissingColumn("success"))?,
        metadata: row
            .try_get("metadata")
            .map_err(|_| StoreError::MissingColumn("metadata"))?,
        created_at: row
            .try_get("created_at")
            .map_err(|_| StoreError::MissingColumn("created_at"))?,
    })
}

/// A helper function to map a `tokio_postgres::Row` to an `MfaCredential`.
fn row_to_credential(row: &Row) -> Result<MfaCredential, StoreError> {
    Ok(MfaCredential {
        user_id: row
            .try_get("user_id")
            .map_err(|_| StoreError::MissingColumn("user_id"))?,
        secret: row
            .try_get("secret")
            .map_err(|_| StoreError::MissingColumn("secret"))?,
        backup_codes: row
            .try_get("backup_codes")
            .map_err(|_| StoreError::MissingColumn("backup_codes"))?,
        is_enabled: row
            .try_get("is_enabled")
            .map_err(|_| StoreError::MissingColumn("is_enabled"))?,
        created_at: row
            .try_get("created_at")
            .map_err(|_| StoreError::MissingColumn("created_at"))?,
    })
}

#[async_trait]
impl SessionStore for PgStore {
    async fn insert_session(&self, session: &Session) -> Result<(), StoreError> {
        let client = self.pool.get().await?;
        client
            .execute(
                r#"
                INSERT INTO sessions
                    (id, user_id, browser, os, device_class, user_agent, ip_address,
                     created_at, last_activity, expires_at, is_active)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, true)
                "#,
                &[
                    &session.id,
                    &session.user_id,
                    &session.device_info.browser,
                    &session.device_info.os,
                    &session.device_info.device_class.as_str(),
                    &session.device_info.user_agent,
                    &session.ip_address,
                    &session.created_at,
                    &session.last_activity,
                    &session.expires_at,
                ],
            )
            .await?;
        Ok(())
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>, StoreError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                r#"
                SELECT *
                FROM sessions
                WHERE id = $1
                "#,
                &[&id],
            )
            .await?;
        row.map(|r| row_to_session(&r)).transpose()
    }

    async fn touch_session(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let client = self.pool.get().await?;
        client
            .execute(
                r#"
                UPDATE sessions
                SET last_activity = $2
                WHERE id = $1 AND is_active = true
                "#,
                &[&id, &at],
            )
            .await?;
        Ok(())
    }

    async fn deactivate_session(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let client = self.pool.get().await?;
        client
            .execute(
                r#"
                UPDATE sessions
                SET is_active = false, ended_at = $2
                WHERE id = $1 AND is_active = true
                "#,
                &[&id, &at],
            )
            .await?;
        Ok(())
    }

    async fn extend_session(
        &self,
        id: &str,
        expires_at: DateTime<Utc>,
        last_activity: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let client = self.pool.get().await?;
        let updated = client
            .execute(
                r#"
                UPDATE sessions
                SET expires_at = $2, last_activity = $3
                WHERE id = $1 AND is_active = true
                "#,
                &[&id, &expires_at, &last_activity],
            )
            .await?;
        Ok(updated > 0)
    }

    async fn active_sessions_for_user(&self, user_id: Uuid) -> Result<Vec<Session>, StoreError> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                r#"
                SELECT *
                FROM sessions
                WHERE user_id = $1 AND is_active = true
                ORDER BY last_activity DESC
                "#,
                &[&user_id],
            )
            .await?;
        rows.iter().map(row_to_session).collect()
    }

    async fn deactivate_all_except(
        &self,
        user_id: Uuid,
        keep_id: &str,
        at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let client = self.pool.get().await?;
        let updated = client
            .execute(
                r#"
                UPDATE sessions
                SET is_active = false, ended_at = $3
                WHERE user_id = $1 AND id <> $2 AND is_active = true
                "#,
                &[&user_id, &keep_id, &at],
            )
            .await?;
        Ok(updated)
    }

    async fn deactivate_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let client = self.pool.get().await?;
        let updated = client
            .execute(
                r#"
                UPDATE sessions
                SET is_active = false, ended_at = $1
                WHERE is_active = true AND expires_at < $1
                "#,
                &[&now],
            )
            .await?;
        Ok(updated)
    }

    async fn purge_sessions_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let client = self.pool.get().await?;
        let deleted = client
            .execute(
                r#"
                DELETE FROM sessions
                WHERE created_at < $1
                "#,
                &[&cutoff],
            )
            .await?;
        Ok(deleted)
    }
}

#[async_trait]
impl RateLimitStore for PgStore {
    async fn insert_attempt(&self, attempt: &RateLimitAttempt) -> Result<(), StoreError> {
        let client = self.pool.get().await?;
        client
            .execute(
                r#"
                INSERT INTO rate_limit_attempts
                    (key, identifier, action, success, metadata, created_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
                &[
                    &attempt.key,
                    &attempt.identifier,
                    &attempt.action,
                    &attempt.success,
                    &attempt.metadata,
                    &attempt.created_at,
                ],
            )
            .await?;
        Ok(())
    }

    async fn attempts_since(
        &self,
        key: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<RateLimitAttempt>, StoreError> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                r#"
                SELECT key, identifier, action, success, metadata, created_at
                FROM rate_limit_attempts
                WHERE key = $1 AND created_at >= $2
                ORDER BY created_at DESC
                "#,
                &[&key, &since],
            )
            .await?;
        rows.iter().map(row_to_attempt).collect()
    }

    async fn delete_attempts(&self, key: &str) -> Result<u64, StoreError> {
        let client = self.pool.get().await?;
        let deleted = client
            .execute(
                r#"
                DELETE FROM rate_limit_attempts
                WHERE key = $1
                "#,
                &[&key],
            )
            .await?;
        Ok(deleted)
    }

    async fn purge_attempts_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let client = self.pool.get().await?;
        let deleted = client
            .execute(
                r#"
                DELETE FROM rate_limit_attempts
                WHERE created_at < $1
                "#,
                &[&cutoff],
            )
            .await?;
        Ok(deleted)
    }
}

#[async_trait]
impl MfaStore for PgStore {
    async fn upsert_credential(&self, credential: &MfaCredential) -> Result<(), StoreError> {
        let client = self.pool.get().await?;
        client
            .execute(
                r#"
                INSERT INTO mfa_credentials (user_id, secret, backup_codes, is_enabled, created_at)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (user_id) DO UPDATE
                SET secret = EXCLUDED.secret,
                    backup_codes = EXCLUDED.backup_codes,
                    is_enabled = EXCLUDED.is_enabled,
                    created_at = EXCLUDED.created_at
                "#,
                &[
                    &credential.user_id,
                    &credential.secret,
                    &credential.backup_codes,
                    &credential.is_enabled,
                    &credential.created_at,
                ],
            )
            .await?;
        Ok(())
    }

    async fn get_credential(&self, user_id: Uuid) -> Result<Option<MfaCredential>, StoreError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                r#"
                SELECT user_id, secret, backup_codes, is_enabled, created_at
                FROM mfa_credentials
                WHERE user_id = $1
                "#,
                &[&user_id],
            )
            .await?;
        row.map(|r| row_to_credential(&r)).transpose()
    }

    async fn set_enabled(&self, user_id: Uuid, enabled: bool) -> Result<bool, StoreError> {
        let client = self.pool.get().await?;
        let updated = client
            .execute(
                r#"
                UPDATE mfa_credentials
                SET is_enabled = $2
                WHERE user_id = $1
                "#,
                &[&user_id, &enabled],
            )
            .await?;
        Ok(updated > 0)
    }

    async fn consume_backup_code(
        &self,
        user_id: Uuid,
        code_hash: &str,
    ) -> Result<bool, StoreError> {
        let client = self.pool.get().await?;
        // Single statement so the membership check and the removal cannot
        // race: two concurrent consumers of the same code see exactly one
        // row update between them.
        let updated = client
            .execute(
                r#"
                UPDATE mfa_credentials
                SET backup_codes = array_remove(backup_codes, $2)
                WHERE user_id = $1 AND $2 = ANY(backup_codes)
                "#,
                &[&user_id, &code_hash],
            )
            .await?;
        Ok(updated > 0)
    }

    async fn replace_backup_codes(
        &self,
        user_id: Uuid,
        code_hashes: &[String],
    ) -> Result<bool, StoreError> {
        let client = self.pool.get().await?;
        let hashes: Vec<&str> = code_hashes.iter().map(String::as_str).collect();
        let updated = client
            .execute(
                r#"
                UPDATE mfa_credentials
                SET backup_codes = $2
                WHERE user_id = $1
                "#,
                &[&user_id, &hashes],
            )
            .await?;
        Ok(updated > 0)
    }
}
