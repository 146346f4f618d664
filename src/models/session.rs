//! Session domain model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A login session
///
/// Keyed by the SHA-256 hex digest of the bearer token; the raw token is
/// never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Database ID (set after insertion)
    pub id: Option<i64>,

    /// SHA-256 hex digest of the bearer token
    pub token_hash: String,

    /// Owner
    pub username: String,

    /// Client address at creation
    pub ip_address: Option<String>,

    /// Client user-agent at creation
    pub user_agent: Option<String>,

    /// Creation time
    pub created_at: DateTime<Utc>,

    /// Last successful validation
    pub last_active: DateTime<Utc>,

    /// Hard expiry
    pub expires_at: DateTime<Utc>,
}

impl Session {
    /// Create a new session starting at `now`
    pub fn new(
        token_hash: impl Into<String>,
        username: impl Into<String>,
        now: DateTime<Utc>,
        max_age: chrono::Duration,
    ) -> Self {
        Self {
            id: None,
            token_hash: token_hash.into(),
            username: username.into(),
            ip_address: None,
            user_agent: None,
            created_at: now,
            last_active: now,
            expires_at: now + max_age,
        }
    }

    /// Set the client address
    pub fn with_ip(mut self, ip: Option<&str>) -> Self {
        self.ip_address = ip.map(str::to_string);
        self
    }

    /// Set the client user-agent
    pub fn with_user_agent(mut self, user_agent: Option<&str>) -> Self {
        self.user_agent = user_agent.map(str::to_string);
        self
    }

    /// Check if the session has expired at `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Remaining lifetime, `None` once expired
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<std::time::Duration> {
        (self.expires_at - now)
            .to_std()
            .ok()
            .filter(|d| !d.is_zero())
    }
}
