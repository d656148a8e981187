use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

use crate::models::mfa::MfaCredential;
use crate::models::rate_limit::RateLimitAttempt;
use crate::models::session::Session;
use crate::store::{MfaStore, RateLimitStore, SessionStore, StoreError};

/// An in-memory store for tests and local development.
///
/// The fault-injection toggles make every read or write fail with
/// `StoreError::Unavailable`, which is how the fail-open and
/// swallow-and-log paths get exercised without a database.
#[derive(Default)]
pub struct MemoryStore {
    sessions: Mutex<HashMap<String, Session>>,
    attempts: Mutex<Vec<RateLimitAttempt>>,
    credentials: Mutex<HashMap<Uuid, MfaCredential>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent read fail. Fault injection for tests.
    pub fn fail_reads(&self, on: bool) {
        self.fail_reads.store(on, Ordering::SeqCst);
    }

    /// Makes every subsequent write fail. Fault injection for tests.
    pub fn fail_writes(&self, on: bool) {
        self.fail_writes.store(on, Ordering::SeqCst);
    }

    /// Shifts every timestamp on a stored session into the past. Lets tests
    /// manufacture expired or idle sessions without mocking the clock.
    pub fn age_session(&self, id: &str, minutes: i64) {
        if let Some(session) = self.sessions.lock().unwrap().get_mut(id) {
            let delta = chrono::Duration::minutes(minutes);
            session.created_at -= delta;
            session.last_activity -= delta;
            session.expires_at -= delta;
        }
    }

    fn check_read(&self) -> Result<(), StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected read failure".to_string()));
        }
        Ok(())
    }

    fn check_write(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected write failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn insert_session(&self, session: &Session) -> Result<(), StoreError> {
        self.check_write()?;
        self.sessions
            .lock()
            .unwrap()
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>, StoreError> {
        self.check_read()?;
        Ok(self.sessions.lock().unwrap().get(id).cloned())
    }

    async fn touch_session(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.check_write()?;
        if let Some(session) = self.sessions.lock().unwrap().get_mut(id) {
            if session.is_active {
                session.last_activity = at;
            }
        }
        Ok(())
    }

    async fn deactivate_session(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.check_write()?;
        if let Some(session) = self.sessions.lock().unwrap().get_mut(id) {
            if session.is_active {
                session.is_active = false;
                session.ended_at = Some(at);
            }
        }
        Ok(())
    }

    async fn extend_session(
        &self,
        id: &str,
        expires_at: DateTime<Utc>,
        last_activity: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.check_write()?;
        if let Some(session) = self.sessions.lock().unwrap().get_mut(id) {
            if session.is_active {
                session.expires_at = expires_at;
                session.last_activity = last_activity;
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn active_sessions_for_user(&self, user_id: Uuid) -> Result<Vec<Session>, StoreError> {
        self.check_read()?;
        let mut sessions: Vec<Session> = self
            .sessions
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.user_id == user_id && s.is_active)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        Ok(sessions)
    }

    async fn deactivate_all_except(
        &self,
        user_id: Uuid,
        keep_id: &str,
        at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        self.check_write()?;
        let mut count = 0;
        for session in self.sessions.lock().unwrap().values_mut() {
            if session.user_id == user_id && session.id != keep_id && session.is_active {
                session.is_active = false;
                session.ended_at = Some(at);
                count += 1;
            }
        }
        Ok(count)
    }

    async fn deactivate_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        self.check_write()?;
        let mut count = 0;
        for session in self.sessions.lock().unwrap().values_mut() {
            if session.is_active && session.expires_at < now {
                session.is_active = false;
                session.ended_at = Some(now);
                count += 1;
            }
        }
        Ok(count)
    }

    async fn purge_sessions_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        self.check_write()?;
        let mut sessions = self.sessions.lock().unwrap();
        let before = sessions.len();
        sessions.retain(|_, s| s.created_at >= cutoff);
        Ok((before - sessions.len()) as u64)
    }
}

#[async_trait]
impl RateLimitStore for MemoryStore {
    async fn insert_attempt(&self, attempt: &RateLimitAttempt) -> Result<(), StoreError> {
        self.check_write()?;
        self.attempts.lock().unwrap().push(attempt.clone());
        Ok(())
    }

    async fn attempts_since(
        &self,
        key: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<RateLimitAttempt>, StoreError> {
        self.check_read()?;
        let mut attempts: Vec<RateLimitAttempt> = self
            .attempts
            .lock()
            .unwrap()
            .iter()
            .filter(|a| a.key == key && a.created_at >= since)
            .cloned()
            .collect();
        attempts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(attempts)
    }

    async fn delete_attempts(&self, key: &str) -> Result<u64, StoreError> {
        self.check_write()?;
        let mut attempts = self.attempts.lock().unwrap();
        let before = attempts.len();
        attempts.retain(|a| a.key != key);
        Ok((before - attempts.len()) as u64)
    }

    async fn purge_attempts_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        self.check_write()?;
        let mut attempts = self.attempts.lock().unwrap();
        let before = attempts.len();
        attempts.retain(|a| a.created_at >= cutoff);
        Ok((before - attempts.len()) as u64)
    }
}

#[async_trait]
impl MfaStore for MemoryStore {
    async fn upsert_credential(&self, credential: &MfaCredential) -> Result<(), StoreError> {
        self.check_write()?;
        self.credentials
            .lock()
            .unwrap()
            .insert(credential.user_id, credential.clone());
        Ok(())
    }

    async fn get_credential(&self, user_id: Uuid) -> Result<Option<MfaCredential>, StoreError> {
        self.check_read()?;
        Ok(self.credentials.lock().unwrap().get(&user_id).cloned())
    }

    async fn set_enabled(&self, user_id: Uuid, enabled: bool) -> Result<bool, StoreError> {
        self.check_write()?;
        match self.credentials.lock().unwrap().get_mut(&user_id) {
            Some(credential) => {
                credential.is_enabled = enabled;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn consume_backup_code(
        &self,
        user_id: Uuid,
        code_hash: &str,
    ) -> Result<bool, StoreError> {
        self.check_write()?;
        // The membership check and the removal happen under one lock hold,
        // mirroring the single-statement guarantee of the SQL store.
        match self.credentials.lock().unwrap().get_mut(&user_id) {
            Some(credential) => {
                let before = credential.backup_codes.len();
                credential.backup_codes.retain(|h| h != code_hash);
                Ok(credential.backup_codes.len() < before)
            }
            None => Ok(false),
        }
    }

    async fn replace_backup_codes(
        &self,
        user_id: Uuid,
        code_hashes: &[String],
    ) -> Result<bool, StoreError> {
        self.check_write()?;
        match self.credentials.lock().unwrap().get_mut(&user_id) {
            Some(credential) => {
                credential.backup_codes = code_hashes.to_vec();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
