use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

/// A security-relevant event (`mfa_enabled`, `session_evicted`, ...).
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    /// What happened, in snake_case.
    pub action: String,
    /// The user the event concerns, when known.
    pub user_id: Option<Uuid>,
    /// Optional free-form context.
    pub detail: Option<String>,
    /// When the event was emitted.
    pub created_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(action: &str, user_id: Uuid) -> Self {
        Self {
            action: action.to_string(),
            user_id: Some(user_id),
            detail: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// The narrow fire-and-forget audit interface.
///
/// `emit` is infallible by contract: the sink implementation owns the
/// "never block the primary flow" policy, so callers simply emit and move
/// on instead of repeating try-and-ignore at every call site.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn emit(&self, event: AuditEvent);
}

/// The default sink: structured log lines under the `audit` target.
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn emit(&self, event: AuditEvent) {
        tracing::info!(
            target: "audit",
            action = %event.action,
            user_id = ?event.user_id,
            detail = ?event.detail,
            "🔎 audit event"
        );
    }
}

/// Convenience constructor for the default sink.
pub fn tracing_sink() -> Arc<dyn AuditSink> {
    Arc::new(TracingAuditSink)
}
