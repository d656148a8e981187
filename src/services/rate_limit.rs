use chrono::{Duration, Utc};
use std::sync::Arc;

use crate::models::rate_limit::{
    RateLimitAction, RateLimitAttempt, RateLimitDecision, RateLimitDefaults, RateLimitQuota,
};
use crate::store::{RateLimitStore, StoreError};

/// How long attempt rows are retained before the opportunistic prune.
const ATTEMPT_RETENTION_DAYS: i64 = 30;

/// Sliding-window abuse control keyed by `(action, identifier)`.
///
/// The limiter is best-effort throttling, not a hard quota: counts come
/// from a consistent snapshot read per check, and two concurrent callers
/// may both observe a free slot and both proceed.
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    defaults: RateLimitDefaults,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>, defaults: RateLimitDefaults) -> Self {
        Self { store, defaults }
    }

    /// Checks whether `identifier` may perform `action` right now.
    ///
    /// Fail-open: a storage error during the read returns `allowed = true`.
    /// The limiter never blocks legitimate traffic over an infrastructure
    /// fault; definitive exhaustion is the only thing that denies.
    ///
    /// # Arguments
    ///
    /// * `identifier` - The caller identity (e.g. `ip:203.0.113.5`).
    /// * `action` - The action being attempted.
    /// * `quota_override` - Optional per-call quota replacing the default.
    pub async fn check_rate_limit(
        &self,
        identifier: &str,
        action: RateLimitAction,
        quota_override: Option<RateLimitQuota>,
    ) -> RateLimitDecision {
        let quota = quota_override.unwrap_or_else(|| self.defaults.quota_for(action));
        let now = Utc::now();
        let window_start = now - quota.window;
        let key = attempt_key(action, identifier);

        let attempts = match self.store.attempts_since(&key, window_start).await {
            Ok(attempts) => attempts,
            Err(e) => {
                tracing::warn!("⚠️ Rate limit read failed for {}, allowing: {}", key, e);
                return RateLimitDecision {
                    allowed: true,
                    remaining: quota.max_attempts.saturating_sub(1),
                    reset_time: now + quota.window,
                    retry_after: None,
                };
            }
        };

        let count = attempts.len() as u32;

        if count >= quota.max_attempts {
            // attempts are newest-first; the block runs from the last one.
            if let Some(last) = attempts.first() {
                let blocked_until = last.created_at + quota.block_duration;
                if now < blocked_until {
                    return RateLimitDecision {
                        allowed: false,
                        remaining: 0,
                        reset_time: blocked_until,
                        retry_after: Some((blocked_until - now).num_seconds()),
                    };
                }
            }
        }

        // Reserve the slot for the current call.
        let remaining = quota.max_attempts.saturating_sub(count).saturating_sub(1);
        let reset_time = attempts
            .last()
            .map(|oldest| oldest.created_at + quota.window)
            .map_or(now + quota.window, |t| t.max(now + quota.window));

        RateLimitDecision {
            allowed: remaining > 0,
            remaining,
            reset_time,
            retry_after: None,
        }
    }

    /// Appends one immutable attempt row.
    ///
    /// Never fails the caller: a lost audit write must not abort the primary
    /// operation. Also opportunistically prunes rows past retention.
    pub async fn record_attempt(
        &self,
        identifier: &str,
        action: RateLimitAction,
        success: bool,
        metadata: Option<String>,
    ) {
        let attempt = RateLimitAttempt {
            key: attempt_key(action, identifier),
            identifier: identifier.to_string(),
            action: action.as_str().to_string(),
            success,
            metadata,
            created_at: Utc::now(),
        };

        if let Err(e) = self.store.insert_attempt(&attempt).await {
            tracing::warn!("⚠️ Failed to record {} attempt: {}", attempt.key, e);
        }

        let cutoff = Utc::now() - Duration::days(ATTEMPT_RETENTION_DAYS);
        if let Err(e) = self.store.purge_attempts_before(cutoff).await {
            tracing::debug!("Attempt prune skipped: {}", e);
        }
    }

    /// Deletes every attempt for the key - administrative override.
    ///
    /// Unlike the read path this propagates errors: an operator must know
    /// whether the reset actually happened.
    pub async fn reset_rate_limit(
        &self,
        identifier: &str,
        action: RateLimitAction,
    ) -> Result<u64, StoreError> {
        let key = attempt_key(action, identifier);
        let removed = self.store.delete_attempts(&key).await?;
        tracing::info!("✅ Rate limit reset for {} ({} attempts removed)", key, removed);
        Ok(removed)
    }

    /// Deletes attempts past retention across all keys. Run from the
    /// periodic cleanup job, off the request hot path.
    pub async fn purge_old_attempts(&self) -> Result<u64, StoreError> {
        let cutoff = Utc::now() - Duration::days(ATTEMPT_RETENTION_DAYS);
        self.store.purge_attempts_before(cutoff).await
    }
}

/// Builds the `action:identifier` lookup key.
fn attempt_key(action: RateLimitAction, identifier: &str) -> String {
    format!("{}:{}", action.as_str(), identifier)
}
