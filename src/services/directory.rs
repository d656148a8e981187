use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2, ParamsBuilder,
};
use async_trait::async_trait;
use deadpool_postgres::Pool;
use rand::{rngs::OsRng, RngCore};
use tokio_postgres::Row;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::user::{DirectoryUser, Role};
use crate::store::StoreError;

/// The memory cost for Argon2 in MB.
const ARGON2_MEMORY_MB: u32 = 19;
/// The number of iterations for Argon2.
const ARGON2_ITERATIONS: u32 = 3;
/// The parallelism factor for Argon2.
const ARGON2_PARALLELISM: u32 = 6;

/// Read-mostly lookup of account records for authentication and the
/// access-control layer.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_by_id(&self, user_id: Uuid) -> Result<Option<DirectoryUser>>;

    async fn find_by_email(&self, email: &str) -> Result<Option<DirectoryUser>>;

    /// Checks an email/password pair. `None` means the pair is invalid;
    /// whether the email exists is deliberately not distinguishable.
    async fn verify_credentials(&self, email: &str, password: &str)
        -> Result<Option<DirectoryUser>>;
}

/// Postgres-backed directory.
pub struct PgUserDirectory {
    pool: Pool,
}

impl PgUserDirectory {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

fn row_to_user(row: &Row) -> std::result::Result<DirectoryUser, StoreError> {
    let role: String = row
        .try_get("role")
        .map_err(|_| StoreError::MissingColumn("role"))?;
    Ok(DirectoryUser {
        id: row
            .try_get("id")
            .map_err(|_| StoreError::MissingColumn("id"))?,
        email: row
            .try_get("email")
            .map_err(|_| StoreError::MissingColumn("email"))?,
        role: Role::parse(&role),
        password_hash: row
            .try_get("password_hash")
            .map_err(|_| StoreError::MissingColumn("password_hash"))?,
    })
}

#[async_trait]
impl UserDirectory for PgUserDirectory {
    async fn find_by_id(&self, user_id: Uuid) -> Result<Option<DirectoryUser>> {
        let client = self.pool.get().await.map_err(StoreError::Pool)?;
        let row = client
            .query_opt(
                "SELECT id, email, role, password_hash FROM users WHERE id = $1",
                &[&user_id],
            )
            .await
            .map_err(StoreError::Database)?;
        row.as_ref().map(row_to_user).transpose().map_err(AppError::Store)
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<DirectoryUser>> {
        let client = self.pool.get().await.map_err(StoreError::Pool)?;
        let row = client
            .query_opt(
                "SELECT id, email, role, password_hash FROM users WHERE lower(email) = lower($1)",
                &[&email],
            )
            .await
            .map_err(StoreError::Database)?;
        row.as_ref().map(row_to_user).transpose().map_err(AppError::Store)
    }

    async fn verify_credentials(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Option<DirectoryUser>> {
        let Some(user) = self.find_by_email(email).await? else {
            tracing::debug!("🔐 Login attempt for unknown email");
            return Ok(None);
        };

        if verify_password(password, &user.password_hash)? {
            Ok(Some(user))
        } else {
            Ok(None)
        }
    }
}

/// In-memory directory used by tests.
#[derive(Default)]
pub struct MemoryDirectory {
    users: std::sync::Mutex<Vec<DirectoryUser>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, user: DirectoryUser) {
        self.users.lock().unwrap().push(user);
    }

    /// Adds a user with the password hashed the way production does it.
    pub fn add_user(&self, email: &str, password: &str, role: Role) -> Result<Uuid> {
        let id = Uuid::new_v4();
        self.insert(DirectoryUser {
            id,
            email: email.to_string(),
            role,
            password_hash: hash_password(password)?,
        });
        Ok(id)
    }
}

#[async_trait]
impl UserDirectory for MemoryDirectory {
    async fn find_by_id(&self, user_id: Uuid) -> Result<Option<DirectoryUser>> {
        Ok(self
            .users
            .lock()
            .unwrap()
            .iter()
            .find(|u| u.id == user_id)
            .cloned())
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<DirectoryUser>> {
        Ok(self
            .users
            .lock()
            .unwrap()
            .iter()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn verify_credentials(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Option<DirectoryUser>> {
        let Some(user) = self.find_by_email(email).await? else {
            return Ok(None);
        };
        if verify_password(password, &user.password_hash)? {
            Ok(Some(user))
        } else {
            Ok(None)
        }
    }
}

/// Hashes a password using Argon2id.
///
/// # Arguments
///
/// * `password` - The password to hash.
///
/// # Returns
///
/// A `Result` containing the hashed password.
pub fn hash_password(password: &str) -> Result<String> {
    let mut salt_bytes = [0u8; 16];
    OsRng.fill_bytes(&mut salt_bytes);

    let salt = SaltString::encode_b64(&salt_bytes)
        .map_err(|e| AppError::Internal(format!("Salt encoding error: {}", e)))?;

    let argon2 = Argon2::new(
        argon2::Algorithm::Argon2id,
        argon2::Version::V0x13,
        ParamsBuilder::new()
            .m_cost(ARGON2_MEMORY_MB * 1024)
            .t_cost(ARGON2_ITERATIONS)
            .p_cost(ARGON2_PARALLELISM)
            .build()
            .map_err(|e| AppError::Internal(format!("Argon2 params: {}", e)))?,
    );

    let password_hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| AppError::Internal(format!("Argon2 hash error: {}", e)))?
        .to_string();

    Ok(password_hash)
}

/// Verifies a password against a hash.
///
/// # Arguments
///
/// * `password` - The password to verify.
/// * `hash` - The hash to verify against.
///
/// # Returns
///
/// A `Result` containing `true` if the password is valid, `false` otherwise.
pub fn verify_password(password: &str, hash: &str) -> Result<bool> {
    let parsed_hash = PasswordHash::new(hash)
        .map_err(|e| AppError::Internal(format!("Hash parse error: {}", e)))?;
    let argon2 = Argon2::default();
    Ok(argon2
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_then_verify_round_trips() {
        let hash = hash_password("correct horse battery staple").unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_password("correct horse battery staple", &hash).unwrap());
        assert!(!verify_password("wrong password", &hash).unwrap());
    }

    #[test]
    fn hashes_are_salted() {
        let a = hash_password("same password").unwrap();
        let b = hash_password("same password").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn verify_rejects_malformed_hash() {
        assert!(verify_password("anything", "not-a-phc-string").is_err());
    }
}
