//! Application error types for gatekeeper
//!
//! Every service returns one of these enums. Decode and crypto failures never
//! reach this layer; they are folded into `false`/`None` results where they occur.

use std::time::Duration;

use thiserror::Error;

/// Authentication and request-screening errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AuthError {
    /// Structurally invalid input (bad username, unparsable value, duplicate user)
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    /// Bad password, signature, expired token or wrong second-factor code
    #[error("Authentication failed")]
    AuthenticationFailed,

    /// Token or session is not valid
    #[error("Invalid token")]
    InvalidToken,

    /// Too many requests in the current window
    #[error("Rate limited, retry after {retry_after_secs} seconds")]
    RateLimited { retry_after_secs: u64 },

    /// Identity is temporarily banned
    #[error("Blocked, retry after {retry_after_secs} seconds")]
    Blocked { retry_after_secs: u64 },

    /// Second factor was never set up (or was disabled)
    #[error("Second factor not configured")]
    NotConfigured,

    /// No backup codes remain
    #[error("No backup codes remain")]
    Exhausted,

    /// Credentials passed but a second-factor code is needed
    #[error("Second factor required")]
    SecondFactorRequired,

    /// Password does not satisfy the configured policy
    #[error("Password policy violation: {0}")]
    PolicyViolation(String),

    /// A backing store could not answer
    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

/// Errors from the shared security store (memory or external cache)
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    /// Operation exceeded its deadline
    #[error("Store operation timed out after {0:?}")]
    Timeout(Duration),

    /// Backend unreachable or connection dropped
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Stored value has an unexpected shape
    #[error("Store serialization error: {0}")]
    Serialization(String),

    /// Compare-and-swap kept losing against concurrent writers
    #[error("Store contention on key: {0}")]
    Contention(String),
}

/// Database-related errors
#[derive(Debug, Error)]
pub enum DbError {
    /// SQLite error
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Record not found
    #[error("Record not found")]
    NotFound,

    /// Constraint violation
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Stored column could not be decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Durable store did not answer in time
    #[error("Database operation timed out after {0:?}")]
    Timeout(Duration),
}

/// Application-level error type
///
/// Aggregates the domain errors for the binary and bootstrap code.
#[derive(Debug, Error)]
pub enum AppError {
    /// Authentication error
    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// Security store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for AuthError {
    fn from(err: StoreError) -> Self {
        AuthError::Unavailable(err.to_string())
    }
}

impl From<DbError> for AuthError {
    fn from(err: DbError) -> Self {
        AuthError::Unavailable(err.to_string())
    }
}

/// Trait for determining if an error is retryable
pub trait RetryableError {
    /// Returns true if the error is retryable
    fn is_retryable(&self) -> bool;
}

impl RetryableError for StoreError {
    fn is_retryable(&self) -> bool {
        match self {
            StoreError::Timeout(_) => true,
            StoreError::Unavailable(_) => true,
            StoreError::Contention(_) => true,
            StoreError::Serialization(_) => false,
        }
    }
}

impl RetryableError for AuthError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            AuthError::RateLimited { .. } | AuthError::Blocked { .. } | AuthError::Unavailable(_)
        )
    }
}

impl StoreError {
    /// True when the backend itself is unreachable, as opposed to holding bad data
    pub fn is_connectivity(&self) -> bool {
        matches!(self, StoreError::Timeout(_) | StoreError::Unavailable(_))
    }
}
