use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The device class a session was opened from, bucketed from the user-agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Desktop,
    Mobile,
    Tablet,
}

impl DeviceClass {
    /// The textual form persisted in the `sessions.device_class` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceClass::Desktop => "desktop",
            DeviceClass::Mobile => "mobile",
            DeviceClass::Tablet => "tablet",
        }
    }

    /// Parses the persisted textual form back into the enum.
    ///
    /// Unknown values fall back to `Desktop` rather than failing the row:
    /// device info is descriptive metadata, never an authorization input.
    pub fn parse(value: &str) -> Self {
        match value {
            "mobile" => DeviceClass::Mobile,
            "tablet" => DeviceClass::Tablet,
            _ => DeviceClass::Desktop,
        }
    }
}

/// Device information captured at session creation from the user-agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// The browser family (e.g. "Chrome", "Firefox").
    pub browser: String,
    /// The operating system family (e.g. "Windows", "Android").
    pub os: String,
    /// The coarse device class.
    pub device_class: DeviceClass,
    /// The raw user-agent string the buckets were derived from.
    pub user_agent: String,
}

/// Represents one authenticated device/browser instance.
///
/// A session with `is_active = false` is terminal and must never be revived.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Opaque token fragment, unique per session.
    pub id: String,
    /// The ID of the user this session belongs to.
    pub user_id: Uuid,
    /// Device information captured at creation.
    pub device_info: DeviceInfo,
    /// The client IP address observed at creation.
    pub ip_address: String,
    /// The timestamp when the session was created.
    pub created_at: DateTime<Utc>,
    /// The timestamp of the last validated request.
    pub last_activity: DateTime<Utc>,
    /// The hard expiry instant (`created_at + max_session_hours` at creation).
    pub expires_at: DateTime<Utc>,
    /// The timestamp when the session was ended, if it has been.
    pub ended_at: Option<DateTime<Utc>>,
    /// Whether the session is still live.
    pub is_active: bool,
}
