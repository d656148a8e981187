use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditSink};
use crate::config::SessionConfig;
use crate::identity;
use crate::models::session::Session;
use crate::store::{SessionStore, StoreError};

/// How long ended/expired session rows are retained before purge.
const SESSION_RETENTION_DAYS: i64 = 30;
/// Minimum staleness before a validated request rewrites `last_activity`.
const ACTIVITY_WRITE_THROTTLE_SECS: i64 = 60;

/// Request-scoped facts captured at session creation.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub user_agent: String,
    pub ip_address: String,
}

/// The outcome of validating a session.
///
/// `Expired`, `Inactive` and `NotFound` are definitive invalidity; a
/// storage fault during validation surfaces as `Err(StoreError)` and must
/// never be conflated with them.
#[derive(Debug, Clone)]
pub enum Validation {
    Valid(Session),
    Expired,
    Inactive,
    NotFound,
}

impl Validation {
    pub fn is_valid(&self) -> bool {
        matches!(self, Validation::Valid(_))
    }
}

/// Session lifecycle manager: creation, validation, activity tracking,
/// concurrency enforcement and expiry sweeping.
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    audit: Arc<dyn AuditSink>,
    config: SessionConfig,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn SessionStore>,
        audit: Arc<dyn AuditSink>,
        config: SessionConfig,
    ) -> Self {
        Self {
            store,
            audit,
            config,
        }
    }

    pub fn config(&self) -> SessionConfig {
        self.config
    }

    /// Creates a session for a freshly authenticated user.
    ///
    /// Derives the session id from the auth token, captures device info and
    /// client IP, and enforces the concurrency cap before the insert. Both
    /// the enforcement and the write are best-effort: session bookkeeping is
    /// secondary to the authentication that already succeeded, so a storage
    /// outage is logged, never raised.
    ///
    /// # Returns
    ///
    /// The derived session id.
    pub async fn create_session(
        &self,
        user_id: Uuid,
        auth_token: &str,
        meta: &RequestMeta,
    ) -> String {
        let session_id = identity::derive_session_id(auth_token);
        let now = Utc::now();

        if let Err(e) = self.enforce_session_limit(user_id).await {
            tracing::warn!("⚠️ Session limit enforcement skipped for {}: {}", user_id, e);
        }

        let session = Session {
            id: session_id.clone(),
            user_id,
            device_info: identity::parse_user_agent(&meta.user_agent),
            ip_address: meta.ip_address.clone(),
            created_at: now,
            last_activity: now,
            expires_at: now + Duration::hours(self.config.max_session_hours),
            ended_at: None,
            is_active: true,
        };

        match self.store.insert_session(&session).await {
            Ok(()) => {
                tracing::info!("✅ Session created for user {}", user_id);
            }
            Err(e) => {
                tracing::warn!("⚠️ Session bookkeeping failed for {}: {}", user_id, e);
            }
        }

        session_id
    }

    /// Bumps `last_activity` to now for an active session. Silent on
    /// failure.
    pub async fn update_session_activity(&self, session_id: &str) {
        if let Err(e) = self.store.touch_session(session_id, Utc::now()).await {
            tracing::debug!("Activity update skipped for {}: {}", session_id, e);
        }
    }

    /// Marks the session inactive and stamps `ended_at`.
    pub async fn end_session(&self, session_id: &str) -> Result<(), StoreError> {
        self.store.deactivate_session(session_id, Utc::now()).await?;
        tracing::info!("✅ Session {} ended", session_id);
        Ok(())
    }

    /// All active sessions for the user, most-recently-active first.
    pub async fn get_user_sessions(&self, user_id: Uuid) -> Result<Vec<Session>, StoreError> {
        self.store.active_sessions_for_user(user_id).await
    }

    /// Bulk-deactivates every active session for the user except the
    /// current one. Returns the number terminated.
    pub async fn terminate_other_sessions(
        &self,
        user_id: Uuid,
        current_session_id: &str,
    ) -> Result<u64, StoreError> {
        let terminated = self
            .store
            .deactivate_all_except(user_id, current_session_id, Utc::now())
            .await?;
        if terminated > 0 {
            self.audit
                .emit(
                    AuditEvent::new("sessions_terminated", user_id)
                        .with_detail(format!("{terminated} other sessions ended")),
                )
                .await;
        }
        Ok(terminated)
    }

    /// Loads and validates a session, deactivating it on definitive
    /// invalidity and touching activity (throttled) when valid.
    ///
    /// A storage fault is an `Err`, never invalidity: the caller must be
    /// able to distinguish "definitely invalid" from "could not determine".
    pub async fn validate_session(&self, session_id: &str) -> Result<Validation, StoreError> {
        let Some(session) = self.store.get_session(session_id).await? else {
            return Ok(Validation::NotFound);
        };

        if !session.is_active {
            return Ok(Validation::NotFound);
        }

        let now = Utc::now();

        if now > session.expires_at {
            self.deactivate_best_effort(session_id, now).await;
            self.audit
                .emit(AuditEvent::new("session_expired", session.user_id))
                .await;
            return Ok(Validation::Expired);
        }

        let idle = now - session.last_activity;
        if idle > Duration::minutes(self.config.max_inactive_minutes) {
            self.deactivate_best_effort(session_id, now).await;
            self.audit
                .emit(AuditEvent::new("session_idle_timeout", session.user_id))
                .await;
            return Ok(Validation::Inactive);
        }

        // Throttled activity write: validated requests arrive far more
        // often than the timestamp needs refreshing.
        if idle >= Duration::seconds(ACTIVITY_WRITE_THROTTLE_SECS) {
            if let Err(e) = self.store.touch_session(session_id, now).await {
                tracing::debug!("Activity touch skipped for {}: {}", session_id, e);
            }
        }

        Ok(Validation::Valid(session))
    }

    /// Boolean form of [`validate_session`](Self::validate_session).
    pub async fn is_session_valid(&self, session_id: &str) -> Result<bool, StoreError> {
        Ok(self.validate_session(session_id).await?.is_valid())
    }

    /// Extends `expires_at` to `now + max_session_hours` and touches
    /// `last_activity`. Returns false when the session is gone or inactive.
    pub async fn refresh_session(&self, session_id: &str) -> Result<bool, StoreError> {
        let now = Utc::now();
        let refreshed = self
            .store
            .extend_session(
                session_id,
                now + Duration::hours(self.config.max_session_hours),
                now,
            )
            .await?;
        if refreshed {
            tracing::debug!("Session {} refreshed", session_id);
        }
        Ok(refreshed)
    }

    /// Bulk-deactivates all sessions past `expires_at`, then hard-deletes
    /// rows past retention. Run periodically, not on the request hot path.
    ///
    /// # Returns
    ///
    /// `(deactivated, purged)` counts.
    pub async fn cleanup_expired_sessions(&self) -> Result<(u64, u64), StoreError> {
        let now = Utc::now();
        let deactivated = self.store.deactivate_expired(now).await?;
        let purged = self
            .store
            .purge_sessions_before(now - Duration::days(SESSION_RETENTION_DAYS))
            .await?;
        Ok((deactivated, purged))
    }

    /// Evicts least-recently-active sessions so the user stays at the cap
    /// after one more session is added.
    ///
    /// Eviction order is strictly oldest-by-`last_activity` first. Eventual
    /// consistency is accepted: concurrent creations may transiently
    /// overshoot the cap until the next pass.
    async fn enforce_session_limit(&self, user_id: Uuid) -> Result<(), StoreError> {
        let sessions = self.store.active_sessions_for_user(user_id).await?;
        let cap = self.config.max_concurrent_sessions;
        if sessions.len() < cap {
            return Ok(());
        }

        // sessions are most-recent-first; evict from the tail until the new
        // session will fit.
        let evict = sessions.len() + 1 - cap;
        let now = Utc::now();
        for session in sessions.iter().rev().take(evict) {
            self.store.deactivate_session(&session.id, now).await?;
            self.audit
                .emit(
                    AuditEvent::new("session_evicted", user_id)
                        .with_detail(format!("concurrency cap {cap} reached")),
                )
                .await;
            tracing::info!("🧹 Evicted session {} for user {}", session.id, user_id);
        }
        Ok(())
    }

    async fn deactivate_best_effort(&self, session_id: &str, at: DateTime<Utc>) {
        if let Err(e) = self.store.deactivate_session(session_id, at).await {
            tracing::warn!("⚠️ Could not deactivate session {}: {}", session_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::TracingAuditSink;
    use crate::store::memory::MemoryStore;
    use crate::store::SessionStore;

    const UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) Chrome/120.0.0.0 Safari/537.36";

    fn manager_with(config: SessionConfig) -> (Arc<MemoryStore>, SessionManager) {
        let store = Arc::new(MemoryStore::new());
        let manager =
            SessionManager::new(store.clone(), Arc::new(TracingAuditSink), config);
        (store, manager)
    }

    fn meta() -> RequestMeta {
        RequestMeta {
            user_agent: UA.to_string(),
            ip_address: "203.0.113.5".to_string(),
        }
    }

    /// Inserts a session directly with crafted timestamps.
    async fn seed_session(
        store: &MemoryStore,
        id: &str,
        user_id: Uuid,
        last_activity: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) {
        store
            .insert_session(&Session {
                id: id.to_string(),
                user_id,
                device_info: crate::identity::parse_user_agent(UA),
                ip_address: "203.0.113.5".to_string(),
                created_at: last_activity,
                last_activity,
                expires_at,
                ended_at: None,
                is_active: true,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn create_captures_device_and_expiry() {
        let (store, manager) = manager_with(SessionConfig::default());
        let user = Uuid::new_v4();

        let id = manager.create_session(user, "token-abc", &meta()).await;
        let session = store.get_session(&id).await.unwrap().unwrap();

        assert_eq!(session.user_id, user);
        assert_eq!(session.device_info.browser, "Chrome");
        assert_eq!(session.ip_address, "203.0.113.5");
        assert!(session.is_active);
        let lifetime = session.expires_at - session.created_at;
        assert_eq!(lifetime.num_hours(), 24);
    }

    #[tokio::test]
    async fn create_survives_storage_outage() {
        let (store, manager) = manager_with(SessionConfig::default());
        store.fail_writes(true);
        store.fail_reads(true);

        // Must not panic: bookkeeping is secondary to the login itself.
        let id = manager.create_session(Uuid::new_v4(), "token-abc", &meta()).await;
        assert!(!id.is_empty());
    }

    #[tokio::test]
    async fn expired_session_is_invalid_and_deactivated() {
        let (store, manager) = manager_with(SessionConfig::default());
        let user = Uuid::new_v4();
        let now = Utc::now();
        seed_session(&store, "s1", user, now, now - Duration::minutes(1)).await;

        let validation = manager.validate_session("s1").await.unwrap();
        assert!(matches!(validation, Validation::Expired));

        let row = store.get_session("s1").await.unwrap().unwrap();
        assert!(!row.is_active, "expiry flips is_active as a side effect");
    }

    #[tokio::test]
    async fn idle_session_is_invalid_even_before_expiry() {
        // 24h lifetime, 120min idle limit, idle 121 minutes.
        let (store, manager) = manager_with(SessionConfig::default());
        let user = Uuid::new_v4();
        let now = Utc::now();
        seed_session(
            &store,
            "s1",
            user,
            now - Duration::minutes(121),
            now + Duration::hours(22),
        )
        .await;

        let validation = manager.validate_session("s1").await.unwrap();
        assert!(matches!(validation, Validation::Inactive));
        assert!(!store.get_session("s1").await.unwrap().unwrap().is_active);
    }

    #[tokio::test]
    async fn fresh_session_is_valid_and_touched() {
        let (store, manager) = manager_with(SessionConfig::default());
        let user = Uuid::new_v4();
        let now = Utc::now();
        seed_session(
            &store,
            "s1",
            user,
            now - Duration::minutes(5),
            now + Duration::hours(23),
        )
        .await;

        let validation = manager.validate_session("s1").await.unwrap();
        assert!(validation.is_valid());

        // Idle > 60s, so the activity timestamp was rewritten.
        let row = store.get_session("s1").await.unwrap().unwrap();
        assert!(now - row.last_activity < Duration::seconds(5));
    }

    #[tokio::test]
    async fn storage_fault_is_an_error_not_invalidity() {
        let (store, manager) = manager_with(SessionConfig::default());
        store.fail_reads(true);

        let result = manager.validate_session("s1").await;
        assert!(result.is_err(), "could-not-determine must not read as invalid");
    }

    #[tokio::test]
    async fn missing_session_is_not_found() {
        let (_store, manager) = manager_with(SessionConfig::default());
        let validation = manager.validate_session("nope").await.unwrap();
        assert!(matches!(validation, Validation::NotFound));
    }

    #[tokio::test]
    async fn ended_session_is_never_revived() {
        let (store, manager) = manager_with(SessionConfig::default());
        let user = Uuid::new_v4();
        let id = manager.create_session(user, "token-abc", &meta()).await;
        manager.end_session(&id).await.unwrap();

        let validation = manager.validate_session(&id).await.unwrap();
        assert!(matches!(validation, Validation::NotFound));

        // A refresh attempt must not resurrect it either.
        assert!(!manager.refresh_session(&id).await.unwrap());
        assert!(!store.get_session(&id).await.unwrap().unwrap().is_active);
    }

    #[tokio::test]
    async fn concurrency_cap_evicts_least_recently_active() {
        let config = SessionConfig {
            max_concurrent_sessions: 3,
            ..SessionConfig::default()
        };
        let (store, manager) = manager_with(config);
        let user = Uuid::new_v4();
        let now = Utc::now();
        let expiry = now + Duration::hours(23);

        // s-old is the least recently active, then s-mid, then s-new.
        seed_session(&store, "s-old", user, now - Duration::minutes(50), expiry).await;
        seed_session(&store, "s-mid", user, now - Duration::minutes(30), expiry).await;
        seed_session(&store, "s-new", user, now - Duration::minutes(10), expiry).await;

        let id = manager.create_session(user, "token-fourth", &meta()).await;

        let active = manager.get_user_sessions(user).await.unwrap();
        assert_eq!(active.len(), 3, "cap holds after the new session is added");
        let ids: Vec<&str> = active.iter().map(|s| s.id.as_str()).collect();
        assert!(ids.contains(&id.as_str()));
        assert!(ids.contains(&"s-new"));
        assert!(ids.contains(&"s-mid"));
        assert!(!ids.contains(&"s-old"), "oldest-by-activity goes first");
    }

    #[tokio::test]
    async fn cap_evicts_multiple_when_over() {
        let config = SessionConfig {
            max_concurrent_sessions: 2,
            ..SessionConfig::default()
        };
        let (store, manager) = manager_with(config);
        let user = Uuid::new_v4();
        let now = Utc::now();
        let expiry = now + Duration::hours(23);

        seed_session(&store, "s1", user, now - Duration::minutes(40), expiry).await;
        seed_session(&store, "s2", user, now - Duration::minutes(30), expiry).await;
        seed_session(&store, "s3", user, now - Duration::minutes(20), expiry).await;

        let id = manager.create_session(user, "token-fourth", &meta()).await;

        let active = manager.get_user_sessions(user).await.unwrap();
        assert_eq!(active.len(), 2);
        let ids: Vec<&str> = active.iter().map(|s| s.id.as_str()).collect();
        assert!(ids.contains(&id.as_str()));
        assert!(ids.contains(&"s3"));
    }

    #[tokio::test]
    async fn terminate_other_sessions_keeps_current() {
        let (store, manager) = manager_with(SessionConfig::default());
        let user = Uuid::new_v4();
        let now = Utc::now();
        let expiry = now + Duration::hours(23);
        seed_session(&store, "current", user, now, expiry).await;
        seed_session(&store, "other-1", user, now, expiry).await;
        seed_session(&store, "other-2", user, now, expiry).await;

        let terminated = manager.terminate_other_sessions(user, "current").await.unwrap();
        assert_eq!(terminated, 2);

        let active = manager.get_user_sessions(user).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "current");
    }

    #[tokio::test]
    async fn refresh_extends_expiry() {
        let (store, manager) = manager_with(SessionConfig::default());
        let user = Uuid::new_v4();
        let now = Utc::now();
        seed_session(&store, "s1", user, now, now + Duration::hours(1)).await;

        assert!(manager.refresh_session("s1").await.unwrap());

        let row = store.get_session("s1").await.unwrap().unwrap();
        assert!(row.expires_at > now + Duration::hours(23));
    }

    #[tokio::test]
    async fn cleanup_sweeps_expired_and_purges_old() {
        let (store, manager) = manager_with(SessionConfig::default());
        let user = Uuid::new_v4();
        let now = Utc::now();

        // One expired-but-active, one healthy, one ancient.
        seed_session(&store, "expired", user, now, now - Duration::minutes(5)).await;
        seed_session(&store, "healthy", user, now, now + Duration::hours(23)).await;
        store
            .insert_session(&Session {
                id: "ancient".to_string(),
                user_id: user,
                device_info: crate::identity::parse_user_agent(UA),
                ip_address: "203.0.113.5".to_string(),
                created_at: now - Duration::days(31),
                last_activity: now - Duration::days(31),
                expires_at: now - Duration::days(30),
                ended_at: None,
                is_active: false,
            })
            .await
            .unwrap();

        let (deactivated, purged) = manager.cleanup_expired_sessions().await.unwrap();
        assert_eq!(deactivated, 1);
        assert_eq!(purged, 1);
        assert!(store.get_session("ancient").await.unwrap().is_none());
        assert!(store.get_session("healthy").await.unwrap().unwrap().is_active);
    }
}
