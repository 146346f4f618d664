//! Audit and block-record models
//!
//! Events written through the `AuditSink` collaborator: crawler blocks,
//! login attempts and account actions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A durable record of an identity block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    /// Blocked identity (usually an IP address)
    pub ip: String,

    /// Human-readable reason
    pub reason: String,

    /// When the block was placed
    pub blocked_at: DateTime<Utc>,

    /// When the block lapses
    pub blocked_until: DateTime<Utc>,
}

impl BlockRecord {
    /// Check if the block is still in force at `now`
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now < self.blocked_until
    }
}

/// One login attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginLog {
    /// Database ID (set after insertion)
    pub id: Option<i64>,

    /// Attempted username
    pub username: String,

    /// Client address
    pub ip_address: String,

    /// Client user-agent
    pub user_agent: Option<String>,

    /// Whether the attempt succeeded
    pub success: bool,

    /// Failure reason, for failed attempts
    pub failure_reason: Option<String>,

    /// When the attempt happened
    pub timestamp: DateTime<Utc>,
}

impl LoginLog {
    /// Create a successful login entry
    pub fn success(
        username: impl Into<String>,
        ip_address: impl Into<String>,
        user_agent: Option<&str>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: None,
            username: username.into(),
            ip_address: ip_address.into(),
            user_agent: user_agent.map(str::to_string),
            success: true,
            failure_reason: None,
            timestamp,
        }
    }

    /// Create a failed login entry
    pub fn failure(
        username: impl Into<String>,
        ip_address: impl Into<String>,
        user_agent: Option<&str>,
        reason: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            success: false,
            failure_reason: Some(reason.into()),
            ..Self::success(username, ip_address, user_agent, timestamp)
        }
    }
}

/// An account-level action worth keeping (password change, 2FA change, ...)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionLog {
    /// Acting user
    pub username: String,

    /// Action name, e.g. `second_factor_enabled`
    pub action: String,

    /// Affected resource
    pub resource: Option<String>,

    /// Client address, when known
    pub ip_address: Option<String>,

    /// When it happened
    pub timestamp: DateTime<Utc>,
}

/// Event accepted by the audit sink
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    /// An identity was blocked
    IpBlocked(BlockRecord),

    /// A login attempt finished
    LoginAttempt(LoginLog),

    /// An account action happened
    Action(ActionLog),
}

impl AuditEvent {
    /// Short label for logs
    pub fn kind(&self) -> &'static str {
        match self {
            AuditEvent::IpBlocked(_) => "ip_blocked",
            AuditEvent::LoginAttempt(_) => "login_attempt",
            AuditEvent::Action(_) => "action",
        }
    }
}
