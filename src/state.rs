use std::sync::Arc;
use tokio::sync::mpsc;

use crate::audit::{self, AuditSink};
use crate::config::Config;
use crate::error::Result;
use crate::services::directory::{PgUserDirectory, UserDirectory};
use crate::services::mfa::MfaGate;
use crate::services::rate_limit::RateLimiter;
use crate::services::sessions::SessionManager;
use crate::services::watcher::{SignOut, WatcherRegistry};
use crate::store::postgres::PgStore;
use crate::store::Store;

/// Buffered forced sign-outs awaiting the drain task.
const SIGN_OUT_CHANNEL_CAPACITY: usize = 256;

/// The application's state.
#[derive(Clone)]
pub struct AppState {
    /// The application's configuration.
    pub config: Config,
    /// The session lifecycle manager.
    pub sessions: Arc<SessionManager>,
    /// The sliding-window rate limiter.
    pub rate_limiter: Arc<RateLimiter>,
    /// The second-factor gate.
    pub mfa: Arc<MfaGate>,
    /// The account directory.
    pub users: Arc<dyn UserDirectory>,
    /// The audit event sink.
    pub audit: Arc<dyn AuditSink>,
    /// Live per-session watchers.
    pub watchers: Arc<WatcherRegistry>,
    /// Where watchers deliver forced sign-outs.
    pub sign_outs: mpsc::Sender<SignOut>,
}

impl AppState {
    /// Creates a new `AppState` backed by PostgreSQL.
    ///
    /// # Arguments
    ///
    /// * `config` - The application's configuration.
    ///
    /// # Returns
    ///
    /// A `Result` containing the `AppState` and the receiving end of the
    /// forced sign-out channel.
    pub fn new(config: &Config) -> Result<(Self, mpsc::Receiver<SignOut>)> {
        let pool = crate::db::create_pool(&config.database_url)?;
        tracing::info!("✅ PostgreSQL pool initialized with deadpool-postgres");

        let store = Arc::new(PgStore::new(pool.clone()));
        let users: Arc<dyn UserDirectory> = Arc::new(PgUserDirectory::new(pool));
        let audit = audit::tracing_sink();

        Ok(Self::assemble(store, users, audit, config.clone()))
    }

    /// Wires the services around an arbitrary store. Production goes
    /// through [`AppState::new`]; tests assemble over an in-memory store.
    pub fn assemble<S: Store + 'static>(
        store: Arc<S>,
        users: Arc<dyn UserDirectory>,
        audit: Arc<dyn AuditSink>,
        config: Config,
    ) -> (Self, mpsc::Receiver<SignOut>) {
        let sessions = Arc::new(SessionManager::new(
            store.clone(),
            audit.clone(),
            config.session,
        ));
        let rate_limiter = Arc::new(RateLimiter::new(store.clone(), config.rate_limits));
        let mfa = Arc::new(MfaGate::new(
            store,
            audit.clone(),
            config.mfa_issuer.clone(),
        ));

        let (sign_outs, sign_out_rx) = mpsc::channel(SIGN_OUT_CHANNEL_CAPACITY);

        let state = AppState {
            config,
            sessions,
            rate_limiter,
            mfa,
            users,
            audit,
            watchers: Arc::new(WatcherRegistry::new()),
            sign_outs,
        };
        (state, sign_out_rx)
    }
}
