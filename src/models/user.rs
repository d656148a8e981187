use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The role attached to a directory user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Member,
}

impl Role {
    /// The textual form persisted in the `users.role` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Member => "member",
        }
    }

    /// Parses the persisted textual value. Unknown roles are treated as
    /// `Member`: a corrupt row must never grant elevated access.
    pub fn parse(value: &str) -> Self {
        match value {
            "admin" => Role::Admin,
            _ => Role::Member,
        }
    }
}

/// The projection of a user the access-control core needs.
///
/// The full user record (profile, billing, preferences) belongs to the
/// surrounding product; this core only consumes identity, role, and the
/// credential hash.
#[derive(Debug, Clone)]
pub struct DirectoryUser {
    /// The unique identifier for the user.
    pub id: Uuid,
    /// The user's email address.
    pub email: String,
    /// The user's role.
    pub role: Role,
    /// The Argon2id hash of the user's password.
    pub password_hash: String,
}
