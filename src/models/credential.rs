//! User credential model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Account role
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Full administrative access
    Admin,
    /// Regular account
    #[default]
    User,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Admin => write!(f, "admin"),
            Role::User => write!(f, "user"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "user" => Ok(Role::User),
            _ => Err(format!("Invalid role: {}", s)),
        }
    }
}

/// Stored login credential
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// Unique login name
    pub username: String,

    /// Encoded PBKDF2 hash; `None` disables password login
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,

    /// Account role
    pub role: Role,

    /// Inactive accounts cannot log in
    pub is_active: bool,

    /// Creation time
    pub created_at: DateTime<Utc>,

    /// Last modification
    pub updated_at: DateTime<Utc>,
}

impl Credential {
    /// Create a new active credential
    pub fn new(
        username: impl Into<String>,
        password_hash: impl Into<String>,
        role: Role,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            username: username.into(),
            password_hash: Some(password_hash.into()),
            role,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Authenticated caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// Login name
    pub username: String,

    /// Account role
    pub role: Role,
}

impl From<&Credential> for Principal {
    fn from(credential: &Credential) -> Self {
        Self {
            username: credential.username.clone(),
            role: credential.role,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_display_and_parse() {
        assert_eq!(Role::Admin.to_string(), "admin");
        assert_eq!("USER".parse::<Role>().unwrap(), Role::User);
        assert!("root".parse::<Role>().is_err());
    }

    #[test]
    fn test_credential_hash_not_serialized() {
        let credential = Credential::new("alice", "c2VjcmV0", Role::Admin, Utc::now());
        let json = serde_json::to_value(&credential).unwrap();
        assert!(json.get("password_hash").is_none());
        assert_eq!(json["role"], "admin");

        let principal = Principal::from(&credential);
        assert_eq!(principal.username, "alice");
        assert_eq!(principal.role, Role::Admin);
    }
}
