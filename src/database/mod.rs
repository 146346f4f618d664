//! Durable storage collaborators for gatekeeper
//!
//! The services depend only on these traits. `SqliteDatabase` implements all
//! of them; any other engine can be injected trait by trait.

pub mod migrations;
pub mod sqlite;

pub use sqlite::SqliteDatabase;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DbError;
use crate::models::{
    ActionLog, AuditEvent, Credential, LoginLog, SecondFactorProfile, SecondFactorState, Session,
};

// =========================================================================
// Sessions
// =========================================================================

/// Durable session storage
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// Insert a session while enforcing the per-user cap
    ///
    /// In one transaction: deletes the owner's sessions expired at `now`,
    /// evicts the least recently active ones until fewer than
    /// `max_per_user` remain, then inserts. Returns the token hashes removed.
    async fn insert_session_capped(
        &self,
        session: &Session,
        max_per_user: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, DbError>;

    /// Get a session by token hash (expired ones included)
    async fn get_session(&self, token_hash: &str) -> Result<Option<Session>, DbError>;

    /// Update `last_active`. Returns false when the session does not exist.
    async fn touch_session(&self, token_hash: &str, at: DateTime<Utc>) -> Result<bool, DbError>;

    /// Delete one session. Returns false when it did not exist.
    async fn delete_session(&self, token_hash: &str) -> Result<bool, DbError>;

    /// Sessions of a user that are live at `now`, most recently active first
    async fn list_user_sessions(
        &self,
        username: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Session>, DbError>;

    /// Delete all sessions of a user except `keep_hash`
    ///
    /// Returns the token hashes removed
    async fn delete_user_sessions(
        &self,
        username: &str,
        keep_hash: Option<String>,
    ) -> Result<Vec<String>, DbError>;

    /// Delete every session expired at `now`. Returns the token hashes removed.
    async fn purge_expired_sessions(&self, now: DateTime<Utc>) -> Result<Vec<String>, DbError>;
}

// =========================================================================
// Second factor
// =========================================================================

/// Durable second-factor profiles
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SecondFactorRepository: Send + Sync {
    /// Load a profile; `None` means never configured
    async fn get_second_factor(
        &self,
        username: &str,
    ) -> Result<Option<SecondFactorProfile>, DbError>;

    /// Insert or replace a profile
    async fn save_second_factor(&self, profile: &SecondFactorProfile) -> Result<(), DbError>;

    /// Write `profile` only if the stored state still equals `expected`
    ///
    /// `Unconfigured` matches a missing row. Returns false when another
    /// writer got there first; nothing is written in that case.
    async fn replace_second_factor(
        &self,
        expected: &SecondFactorState,
        profile: &SecondFactorProfile,
    ) -> Result<bool, DbError>;

    /// Atomically remove `code` from an active profile's backup codes
    ///
    /// Records `at` as last use. Returns false when the profile is not
    /// active or the code is not present.
    async fn consume_backup_code(
        &self,
        username: &str,
        code: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, DbError>;

    /// Record a successful TOTP use
    async fn record_second_factor_use(
        &self,
        username: &str,
        at: DateTime<Utc>,
    ) -> Result<(), DbError>;
}

// =========================================================================
// Credentials
// =========================================================================

/// Username/password-hash lookup
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Get a credential by username
    async fn get_credential(&self, username: &str) -> Result<Option<Credential>, DbError>;

    /// Insert or replace a credential
    async fn upsert_credential(&self, credential: &Credential) -> Result<(), DbError>;

    /// Every account, oldest first
    async fn list_credentials(&self) -> Result<Vec<Credential>, DbError>;
}

// =========================================================================
// Audit
// =========================================================================

/// Sink for security events
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Persist one event
    async fn record_event(&self, event: &AuditEvent) -> Result<(), DbError>;

    /// Most recent login attempts, newest first, optionally for one user
    async fn recent_logins(
        &self,
        username: Option<String>,
        limit: u32,
    ) -> Result<Vec<LoginLog>, DbError>;

    /// Most recent account actions, newest first, optionally filtered by
    /// actor and action name
    async fn recent_actions(
        &self,
        username: Option<String>,
        action: Option<String>,
        limit: u32,
    ) -> Result<Vec<ActionLog>, DbError>;
}

/// Everything the services need from durable storage
pub trait Database: SessionRepository + SecondFactorRepository + CredentialStore + AuditSink {}

impl<T> Database for T where T: SessionRepository + SecondFactorRepository + CredentialStore + AuditSink
{}
