use chrono::Utc;
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use totp_rs::{Algorithm, Secret, TOTP};
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditSink};
use crate::error::{AppError, Result};
use crate::models::mfa::{MfaCredential, MfaSetup};
use crate::store::MfaStore;

/// TOTP seed size. 32 bytes comfortably clears the 160-bit floor.
const SECRET_SIZE: usize = 32;
/// Accepted clock drift, in 30-second steps on either side.
const TOTP_SKEW: u8 = 2;
/// TOTP code length.
const TOTP_DIGITS: usize = 6;
/// TOTP step in seconds.
const TOTP_STEP: u64 = 30;

/// Backup codes issued per setup/regeneration.
const BACKUP_CODE_COUNT: usize = 10;
/// Characters per backup code.
const BACKUP_CODE_LEN: usize = 8;
const BACKUP_CODE_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Second-factor issuance and verification.
pub struct MfaGate {
    store: Arc<dyn MfaStore>,
    audit: Arc<dyn AuditSink>,
    issuer: String,
}

impl MfaGate {
    pub fn new(store: Arc<dyn MfaStore>, audit: Arc<dyn AuditSink>, issuer: String) -> Self {
        Self {
            store,
            audit,
            issuer,
        }
    }

    /// Begins a setup cycle: a fresh secret, a scannable provisioning URI,
    /// and ten single-use backup codes.
    ///
    /// The credential is stored pending (`is_enabled = false`) and any
    /// previous secret or codes are invalidated. Plaintext codes are
    /// returned exactly once; only their hashes persist.
    pub async fn setup_mfa(&self, user_id: Uuid, email: &str) -> Result<MfaSetup> {
        let mut seed = [0u8; SECRET_SIZE];
        OsRng.fill_bytes(&mut seed);

        let totp = build_totp(seed.to_vec(), &self.issuer, email)?;
        let secret = totp.get_secret_base32();

        let backup_codes = generate_backup_codes();
        let code_hashes = backup_codes.iter().map(|c| hash_backup_code(c)).collect();

        self.store
            .upsert_credential(&MfaCredential {
                user_id,
                secret: secret.clone(),
                backup_codes: code_hashes,
                is_enabled: false,
                created_at: Utc::now(),
            })
            .await?;

        tracing::info!("🔐 MFA setup initiated for user {}", user_id);

        Ok(MfaSetup {
            secret: secret.clone(),
            qr_code_url: totp.get_url(),
            manual_entry_key: secret,
            backup_codes,
        })
    }

    /// Verifies a TOTP code for the user.
    ///
    /// Accepts codes within ±2 time steps (±60 s) of now - a deliberate
    /// usability/security tradeoff for client clock drift. `secret`
    /// overrides the stored seed when supplied (used during enablement).
    pub async fn verify_mfa(
        &self,
        user_id: Uuid,
        token: &str,
        secret: Option<&str>,
    ) -> Result<bool> {
        let seed_b32 = match secret {
            Some(s) => s.to_string(),
            None => match self.store.get_credential(user_id).await? {
                Some(credential) => credential.secret,
                None => return Ok(false),
            },
        };

        let seed = Secret::Encoded(seed_b32)
            .to_bytes()
            .map_err(|e| AppError::Mfa(format!("Invalid secret encoding: {e:?}")))?;
        let totp = build_totp(seed, &self.issuer, &user_id.to_string())?;

        let valid = totp
            .check_current(token)
            .map_err(|e| AppError::Internal(format!("System clock error: {e}")))?;
        Ok(valid)
    }

    /// Flips the credential to enabled after re-verifying the token against
    /// the freshly generated secret. Never enables on an unverified secret.
    pub async fn enable_mfa(&self, user_id: Uuid, token: &str, secret: &str) -> Result<bool> {
        let Some(credential) = self.store.get_credential(user_id).await? else {
            return Ok(false);
        };

        // The supplied secret must be the pending one from this setup
        // cycle, compared in constant time.
        let matches: bool = credential
            .secret
            .as_bytes()
            .ct_eq(secret.as_bytes())
            .into();
        if !matches {
            tracing::warn!("❌ MFA enable rejected: stale secret for user {}", user_id);
            return Ok(false);
        }

        if !self.verify_mfa(user_id, token, Some(secret)).await? {
            return Ok(false);
        }

        self.store.set_enabled(user_id, true).await?;
        self.audit.emit(AuditEvent::new("mfa_enabled", user_id)).await;
        tracing::info!("✅ MFA enabled for user {}", user_id);
        Ok(true)
    }

    /// Disables MFA for the user. Returns false when no credential exists.
    pub async fn disable_mfa(&self, user_id: Uuid) -> Result<bool> {
        let disabled = self.store.set_enabled(user_id, false).await?;
        if disabled {
            self.audit.emit(AuditEvent::new("mfa_disabled", user_id)).await;
            tracing::info!("✅ MFA disabled for user {}", user_id);
        }
        Ok(disabled)
    }

    /// Whether the user has an enabled credential.
    pub async fn is_enabled(&self, user_id: Uuid) -> Result<bool> {
        Ok(self
            .store
            .get_credential(user_id)
            .await?
            .map(|c| c.is_enabled)
            .unwrap_or(false))
    }

    /// Verifies a backup code and consumes it in the same logical
    /// operation, so a code can never validate twice.
    pub async fn verify_backup_code(&self, user_id: Uuid, code: &str) -> Result<bool> {
        let hash = hash_backup_code(code.trim());
        let consumed = self.store.consume_backup_code(user_id, &hash).await?;
        if consumed {
            self.audit
                .emit(AuditEvent::new("backup_code_used", user_id))
                .await;
        }
        Ok(consumed)
    }

    /// Replaces the whole backup-code set, invalidating every previous
    /// code.
    pub async fn regenerate_backup_codes(&self, user_id: Uuid) -> Result<Vec<String>> {
        let codes = generate_backup_codes();
        let hashes: Vec<String> = codes.iter().map(|c| hash_backup_code(c)).collect();

        if !self.store.replace_backup_codes(user_id, &hashes).await? {
            return Err(AppError::NotFound);
        }

        self.audit
            .emit(AuditEvent::new("backup_codes_regenerated", user_id))
            .await;
        Ok(codes)
    }
}

/// Builds the TOTP instance used everywhere: SHA-1, 6 digits, 30 s step,
/// ±2 steps of drift.
fn build_totp(seed: Vec<u8>, issuer: &str, account: &str) -> Result<TOTP> {
    TOTP::new(
        Algorithm::SHA1,
        TOTP_DIGITS,
        TOTP_SKEW,
        TOTP_STEP,
        seed,
        Some(issuer.to_string()),
        account.to_string(),
    )
    .map_err(|e| AppError::Mfa(format!("TOTP init error: {e}")))
}

/// Ten random uppercase-alphanumeric codes.
fn generate_backup_codes() -> Vec<String> {
    let mut rng = OsRng;
    (0..BACKUP_CODE_COUNT)
        .map(|_| {
            (0..BACKUP_CODE_LEN)
                .map(|_| BACKUP_CODE_CHARSET[rng.gen_range(0..BACKUP_CODE_CHARSET.len())] as char)
                .collect()
        })
        .collect()
}

/// Codes are stored hashed; comparison happens by hash lookup.
fn hash_backup_code(code: &str) -> String {
    hex::encode(Sha256::digest(code.to_ascii_uppercase().as_bytes()))
}
