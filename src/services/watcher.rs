use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::services::sessions::{SessionManager, Validation};

/// Why a watcher force-signed a session out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignOutReason {
    Expired,
    Inactivity,
}

impl SignOutReason {
    /// The `?reason=` query value on the login redirect.
    pub fn as_str(&self) -> &'static str {
        match self {
            SignOutReason::Expired => "expired",
            SignOutReason::Inactivity => "inactivity",
        }
    }
}

/// A forced sign-out emitted by a watcher.
#[derive(Debug, Clone)]
pub struct SignOut {
    pub session_id: String,
    pub reason: SignOutReason,
}

/// A recurring re-validation loop for one session.
///
/// The loop signs out only on definitive invalidity. A storage error during
/// a tick is logged and skipped: "could not determine" must never end a
/// session. Stopping the watcher aborts any in-flight validation so a stale
/// result is discarded rather than acted upon.
pub struct SessionWatcher {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl SessionWatcher {
    /// Spawns the loop. Forced sign-outs are delivered on `sign_outs`.
    pub fn spawn(
        manager: Arc<SessionManager>,
        session_id: String,
        interval: Duration,
        sign_outs: mpsc::Sender<SignOut>,
    ) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick of a tokio interval fires immediately; skip it
            // so a session is not re-validated in the same instant it was
            // created.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {}
                }

                let validation = tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    result = manager.validate_session(&session_id) => result,
                };

                match validation {
                    Ok(Validation::Valid(_)) => {}
                    Ok(Validation::Expired) => {
                        sign_out(&manager, &session_id, SignOutReason::Expired, &sign_outs).await;
                        break;
                    }
                    Ok(Validation::Inactive) => {
                        sign_out(&manager, &session_id, SignOutReason::Inactivity, &sign_outs)
                            .await;
                        break;
                    }
                    Ok(Validation::NotFound) => {
                        // Ended elsewhere (logout, eviction); nothing to do.
                        tracing::debug!("Watcher for {} found session gone", session_id);
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(
                            "⚠️ Session check for {} inconclusive, keeping session: {}",
                            session_id,
                            e
                        );
                    }
                }
            }
        });

        Self { shutdown, handle }
    }

    /// Stops the loop and discards any in-flight validation.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
        self.handle.abort();
    }
}

impl Drop for SessionWatcher {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn sign_out(
    manager: &SessionManager,
    session_id: &str,
    reason: SignOutReason,
    sign_outs: &mpsc::Sender<SignOut>,
) {
    tracing::info!("👋 Forcing sign-out of {} ({})", session_id, reason.as_str());
    if let Err(e) = manager.end_session(session_id).await {
        tracing::warn!("⚠️ Could not end session {}: {}", session_id, e);
    }
    let _ = sign_outs
        .send(SignOut {
            session_id: session_id.to_string(),
            reason,
        })
        .await;
}

/// Tracks the live watcher per session so logout and process teardown can
/// stop them without leaking timers.
#[derive(Default)]
pub struct WatcherRegistry {
    watchers: Mutex<HashMap<String, SessionWatcher>>,
}

impl WatcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the watcher for a session, replacing (and stopping) any
    /// previous one.
    pub fn insert(&self, session_id: &str, watcher: SessionWatcher) {
        let mut watchers = self.watchers.lock().unwrap();
        if let Some(previous) = watchers.insert(session_id.to_string(), watcher) {
            previous.stop();
        }
    }

    /// Stops and removes the watcher for a session, if any.
    pub fn stop(&self, session_id: &str) {
        if let Some(watcher) = self.watchers.lock().unwrap().remove(session_id) {
            watcher.stop();
        }
    }

    /// Stops every watcher. Called at teardown.
    pub fn stop_all(&self) {
        let mut watchers = self.watchers.lock().unwrap();
        for (_, watcher) in watchers.drain() {
            watcher.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::TracingAuditSink;
    use crate::config::SessionConfig;
    use crate::models::session::Session;
    use crate::store::memory::MemoryStore;
    use crate::store::SessionStore;
    use chrono::{Duration as ChronoDuration, Utc};
    use uuid::Uuid;

    fn manager(store: Arc<MemoryStore>) -> Arc<SessionManager> {
        Arc::new(SessionManager::new(
            store,
            Arc::new(TracingAuditSink),
            SessionConfig::default(),
        ))
    }

    async fn seed(store: &MemoryStore, id: &str, idle_minutes: i64, expires_in_minutes: i64) {
        let now = Utc::now();
        store
            .insert_session(&Session {
                id: id.to_string(),
                user_id: Uuid::new_v4(),
                device_info: crate::identity::parse_user_agent("curl/8.4.0"),
                ip_address: "203.0.113.5".to_string(),
                created_at: now - ChronoDuration::minutes(idle_minutes),
                last_activity: now - ChronoDuration::minutes(idle_minutes),
                expires_at: now + ChronoDuration::minutes(expires_in_minutes),
                ended_at: None,
                is_active: true,
            })
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn signs_out_expired_session_with_reason() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "s1", 0, -1).await; // already past expiry in wall-clock terms
        let manager = manager(store.clone());

        let (tx, mut rx) = mpsc::channel(4);
        let watcher =
            SessionWatcher::spawn(manager, "s1".to_string(), Duration::from_secs(300), tx);

        tokio::time::advance(Duration::from_secs(301)).await;
        let sign_out = rx.recv().await.expect("a sign-out should be emitted");
        assert_eq!(sign_out.session_id, "s1");
        assert_eq!(sign_out.reason, SignOutReason::Expired);
        assert!(!store.get_session("s1").await.unwrap().unwrap().is_active);
        watcher.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn signs_out_idle_session_with_inactivity_reason() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "s1", 121, 600).await; // idle past the 120min limit
        let manager = manager(store.clone());

        let (tx, mut rx) = mpsc::channel(4);
        let watcher =
            SessionWatcher::spawn(manager, "s1".to_string(), Duration::from_secs(300), tx);

        tokio::time::advance(Duration::from_secs(301)).await;
        let sign_out = rx.recv().await.expect("a sign-out should be emitted");
        assert_eq!(sign_out.reason, SignOutReason::Inactivity);
        watcher.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn storage_error_does_not_sign_out() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "s1", 0, -1).await; // would be expired, if it could be read
        store.fail_reads(true);
        let manager = manager(store.clone());

        let (tx, mut rx) = mpsc::channel(4);
        let watcher =
            SessionWatcher::spawn(manager, "s1".to_string(), Duration::from_secs(300), tx);

        for _ in 0..3 {
            tokio::time::advance(Duration::from_secs(301)).await;
        }
        tokio::task::yield_now().await;
        assert!(
            rx.try_recv().is_err(),
            "inconclusive checks must never force a sign-out"
        );
        watcher.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_the_loop() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "s1", 0, -1).await;
        let manager = manager(store.clone());

        let (tx, mut rx) = mpsc::channel(4);
        let watcher =
            SessionWatcher::spawn(manager, "s1".to_string(), Duration::from_secs(300), tx);
        watcher.stop();

        tokio::time::advance(Duration::from_secs(1000)).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err(), "a stopped watcher must stay silent");
        // The session row is untouched by the cancelled watcher.
        assert!(store.get_session("s1").await.unwrap().unwrap().is_active);
    }

    #[tokio::test(start_paused = true)]
    async fn registry_replaces_and_stops() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "s1", 0, 600).await;
        let manager = manager(store.clone());
        let registry = WatcherRegistry::new();

        let (tx, _rx) = mpsc::channel(4);
        let w1 = SessionWatcher::spawn(
            manager.clone(),
            "s1".to_string(),
            Duration::from_secs(300),
            tx.clone(),
        );
        registry.insert("s1", w1);
        let w2 =
            SessionWatcher::spawn(manager, "s1".to_string(), Duration::from_secs(300), tx);
        registry.insert("s1", w2);

        registry.stop("s1");
        registry.stop_all(); // idempotent on an empty registry
    }
}
