//! Database migrations for gatekeeper
//!
//! This module contains SQL migrations for the SQLite database schema.
//! Timestamps are stored as RFC 3339 strings with microsecond precision
//! and a `Z` suffix, so string order matches time order.

/// SQL statement to create the initial database schema
pub const CREATE_SCHEMA: &str = r#"
-- Login credentials
CREATE TABLE IF NOT EXISTS user_accounts (
    username TEXT PRIMARY KEY,
    password_hash TEXT,
    role TEXT NOT NULL DEFAULT 'user',
    is_active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Sessions, keyed by SHA-256 of the bearer token
CREATE TABLE IF NOT EXISTS sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    token_hash TEXT NOT NULL UNIQUE,
    username TEXT NOT NULL,
    ip_address TEXT,
    user_agent TEXT,
    created_at TEXT NOT NULL,
    last_active TEXT NOT NULL,
    expires_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(username, last_active);
CREATE INDEX IF NOT EXISTS idx_sessions_expiry ON sessions(expires_at);

-- Second-factor profiles
CREATE TABLE IF NOT EXISTS user_second_factor (
    username TEXT PRIMARY KEY,
    state TEXT NOT NULL,
    secret TEXT,
    backup_codes TEXT NOT NULL DEFAULT '[]',
    created_at TEXT,
    last_used_at TEXT
);

-- Identity blocks placed by crawler detection
CREATE TABLE IF NOT EXISTS blocked_ips (
    ip TEXT PRIMARY KEY,
    reason TEXT NOT NULL,
    blocked_at TEXT NOT NULL,
    blocked_until TEXT NOT NULL
);

-- Login attempts
CREATE TABLE IF NOT EXISTS login_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL,
    ip_address TEXT NOT NULL,
    user_agent TEXT,
    success INTEGER NOT NULL,
    failure_reason TEXT,
    timestamp TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_login_logs_time ON login_logs(timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_login_logs_user ON login_logs(username);

-- Account actions
CREATE TABLE IF NOT EXISTS audit_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL,
    action TEXT NOT NULL,
    resource TEXT,
    ip_address TEXT,
    timestamp TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_logs_time ON audit_logs(timestamp DESC);
"#;

/// Get the migration version
pub fn migration_version() -> i32 {
    1
}
