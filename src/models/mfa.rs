use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Per-user second-factor configuration.
///
/// `backup_codes` holds SHA-256 hex digests of the issued codes, never the
/// codes themselves. A consumed code is removed from the set and can never
/// be reused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MfaCredential {
    /// The user this credential belongs to.
    pub user_id: Uuid,
    /// The base32-encoded TOTP seed.
    pub secret: String,
    /// Hashes of the still-unused backup codes.
    pub backup_codes: Vec<String>,
    /// Only flips to true after a successful verification of a freshly
    /// issued secret.
    pub is_enabled: bool,
    /// When this setup cycle was initiated.
    pub created_at: DateTime<Utc>,
}

/// Everything the user needs to finish enrolling an authenticator.
///
/// The plaintext backup codes appear here exactly once; only their hashes
/// are persisted.
#[derive(Debug, Clone, Serialize)]
pub struct MfaSetup {
    /// The base32 secret, for clients that store it directly.
    pub secret: String,
    /// A scannable `otpauth://` provisioning URI.
    pub qr_code_url: String,
    /// The base32 secret formatted for manual entry.
    pub manual_entry_key: String,
    /// Ten single-use recovery codes.
    pub backup_codes: Vec<String>,
}
