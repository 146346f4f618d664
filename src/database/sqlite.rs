//! SQLite implementation of the storage collaborators
//!
//! This module provides a SQLite-based implementation of every durable trait
//! using rusqlite and tokio-rusqlite for async operations.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{OptionalExtension, Row};
use tokio_rusqlite::Connection;

use super::migrations::CREATE_SCHEMA;
use super::{AuditSink, CredentialStore, SecondFactorRepository, SessionRepository};
use crate::error::DbError;
use crate::models::{
    ActionLog, AuditEvent, BlockRecord, Credential, LoginLog, Role, SecondFactorProfile,
    SecondFactorState, Session,
};

/// SQLite database implementation
pub struct SqliteDatabase {
    conn: Connection,
}

impl SqliteDatabase {
    /// Create a new SQLite database connection
    ///
    /// Use `:memory:` for in-memory database or a file path for persistent storage.
    pub async fn new(path: &str) -> Result<Self, DbError> {
        let conn = Connection::open(path).await?;

        conn.call(|conn| {
            conn.execute_batch(CREATE_SCHEMA)?;
            Ok::<_, rusqlite::Error>(())
        })
        .await?;

        Ok(Self { conn })
    }

    /// Create a new in-memory database (useful for testing)
    pub async fn in_memory() -> Result<Self, DbError> {
        Self::new(":memory:").await
    }

    /// Look up the durable block record for an identity
    pub async fn blocked_ip(&self, ip: &str) -> Result<Option<BlockRecord>, DbError> {
        let ip = ip.to_string();

        self.conn
            .call(move |conn| {
                conn.query_row(
                    r#"
                    SELECT ip, reason, blocked_at, blocked_until
                    FROM blocked_ips
                    WHERE ip = ?1
                    "#,
                    [&ip],
                    |row| {
                        Ok(BlockRecord {
                            ip: row.get(0)?,
                            reason: row.get(1)?,
                            blocked_at: datetime_at(row, 2)?,
                            blocked_until: datetime_at(row, 3)?,
                        })
                    },
                )
                .optional()
            })
            .await
            .map_err(Into::into)
    }
}

#[async_trait]
impl SessionRepository for SqliteDatabase {
    async fn insert_session_capped(
        &self,
        session: &Session,
        max_per_user: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, DbError> {
        let session = session.clone();
        let now = format_datetime(now);
        let keep = i64::try_from(max_per_user.max(1)).unwrap_or(i64::MAX) - 1;

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;

                let mut removed = {
                    let mut stmt = tx.prepare(
                        "SELECT token_hash FROM sessions WHERE username = ?1 AND expires_at <= ?2",
                    )?;
                    let expired = stmt
                        .query_map(rusqlite::params![session.username, now], |row| row.get(0))?
                        .collect::<Result<Vec<String>, _>>()?;
                    expired
                };
                tx.execute(
                    "DELETE FROM sessions WHERE username = ?1 AND expires_at <= ?2",
                    rusqlite::params![session.username, now],
                )?;

                let live: i64 = tx.query_row(
                    "SELECT COUNT(*) FROM sessions WHERE username = ?1",
                    [&session.username],
                    |row| row.get(0),
                )?;

                let excess = live - keep;
                if excess > 0 {
                    let victims = {
                        let mut stmt = tx.prepare(
                            r#"
                            SELECT token_hash FROM sessions
                            WHERE username = ?1
                            ORDER BY last_active ASC, id ASC
                            LIMIT ?2
                            "#,
                        )?;
                        let victims = stmt
                            .query_map(rusqlite::params![session.username, excess], |row| {
                                row.get(0)
                            })?
                            .collect::<Result<Vec<String>, _>>()?;
                        victims
                    };
                    for hash in &victims {
                        tx.execute("DELETE FROM sessions WHERE token_hash = ?1", [hash])?;
                    }
                    removed.extend(victims);
                }

                tx.execute(
                    r#"
                    INSERT INTO sessions
                    (token_hash, username, ip_address, user_agent, created_at, last_active, expires_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                    "#,
                    rusqlite::params![
                        session.token_hash,
                        session.username,
                        session.ip_address,
                        session.user_agent,
                        format_datetime(session.created_at),
                        format_datetime(session.last_active),
                        format_datetime(session.expires_at),
                    ],
                )?;

                tx.commit()?;
                Ok::<_, rusqlite::Error>(removed)
            })
            .await
            .map_err(Into::into)
    }

    async fn get_session(&self, token_hash: &str) -> Result<Option<Session>, DbError> {
        let token_hash = token_hash.to_string();

        self.conn
            .call(move |conn| {
                conn.query_row(
                    r#"
                    SELECT id, token_hash, username, ip_address, user_agent,
                           created_at, last_active, expires_at
                    FROM sessions
                    WHERE token_hash = ?1
                    "#,
                    [&token_hash],
                    session_from_row,
                )
                .optional()
            })
            .await
            .map_err(Into::into)
    }

    async fn touch_session(&self, token_hash: &str, at: DateTime<Utc>) -> Result<bool, DbError> {
        let token_hash = token_hash.to_string();
        let at = format_datetime(at);

        self.conn
            .call(move |conn| {
                let updated = conn.execute(
                    "UPDATE sessions SET last_active = ?1 WHERE token_hash = ?2",
                    rusqlite::params![at, token_hash],
                )?;
                Ok::<_, rusqlite::Error>(updated > 0)
            })
            .await
            .map_err(Into::into)
    }

    async fn delete_session(&self, token_hash: &str) -> Result<bool, DbError> {
        let token_hash = token_hash.to_string();

        self.conn
            .call(move |conn| {
                let deleted =
                    conn.execute("DELETE FROM sessions WHERE token_hash = ?1", [&token_hash])?;
                Ok::<_, rusqlite::Error>(deleted > 0)
            })
            .await
            .map_err(Into::into)
    }

    async fn list_user_sessions(
        &self,
        username: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Session>, DbError> {
        let username = username.to_string();
        let now = format_datetime(now);

        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    r#"
                    SELECT id, token_hash, username, ip_address, user_agent,
                           created_at, last_active, expires_at
                    FROM sessions
                    WHERE username = ?1 AND expires_at > ?2
                    ORDER BY last_active DESC, id DESC
                    "#,
                )?;

                let sessions = stmt
                    .query_map(rusqlite::params![username, now], session_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;

                Ok::<_, rusqlite::Error>(sessions)
            })
            .await
            .map_err(Into::into)
    }

    async fn delete_user_sessions(
        &self,
        username: &str,
        keep_hash: Option<String>,
    ) -> Result<Vec<String>, DbError> {
        let username = username.to_string();

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;

                let hashes = {
                    let mut stmt = tx.prepare(
                        r#"
                        SELECT token_hash FROM sessions
                        WHERE username = ?1 AND (?2 IS NULL OR token_hash != ?2)
                        "#,
                    )?;
                    let hashes = stmt
                        .query_map(rusqlite::params![username, keep_hash], |row| row.get(0))?
                        .collect::<Result<Vec<String>, _>>()?;
                    hashes
                };
                tx.execute(
                    "DELETE FROM sessions WHERE username = ?1 AND (?2 IS NULL OR token_hash != ?2)",
                    rusqlite::params![username, keep_hash],
                )?;

                tx.commit()?;
                Ok::<_, rusqlite::Error>(hashes)
            })
            .await
            .map_err(Into::into)
    }

    async fn purge_expired_sessions(&self, now: DateTime<Utc>) -> Result<Vec<String>, DbError> {
        let now = format_datetime(now);

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;

                let hashes = {
                    let mut stmt =
                        tx.prepare("SELECT token_hash FROM sessions WHERE expires_at <= ?1")?;
                    let hashes = stmt
                        .query_map([&now], |row| row.get(0))?
                        .collect::<Result<Vec<String>, _>>()?;
                    hashes
                };
                tx.execute("DELETE FROM sessions WHERE expires_at <= ?1", [&now])?;

                tx.commit()?;
                Ok::<_, rusqlite::Error>(hashes)
            })
            .await
            .map_err(Into::into)
    }
}

#[async_trait]
impl SecondFactorRepository for SqliteDatabase {
    async fn get_second_factor(
        &self,
        username: &str,
    ) -> Result<Option<SecondFactorProfile>, DbError> {
        let username = username.to_string();

        self.conn
            .call(move |conn| {
                conn.query_row(
                    r#"
                    SELECT username, state, secret, backup_codes, created_at, last_used_at
                    FROM user_second_factor
                    WHERE username = ?1
                    "#,
                    [&username],
                    |row| {
                        Ok(SecondFactorProfile {
                            username: row.get(0)?,
                            state: second_factor_state_from_row(row)?,
                            created_at: parse_datetime(row.get(4)?),
                            last_used_at: parse_datetime(row.get(5)?),
                        })
                    },
                )
                .optional()
            })
            .await
            .map_err(Into::into)
    }

    async fn save_second_factor(&self, profile: &SecondFactorProfile) -> Result<(), DbError> {
        let username = profile.username.clone();
        let state = profile.state.as_str();
        let secret = profile.state.secret().map(str::to_string);
        let backup_codes = serde_json::to_string(&profile.state.backup_codes())
            .map_err(|e| DbError::Serialization(e.to_string()))?;
        let created_at = profile.created_at.map(format_datetime);
        let last_used_at = profile.last_used_at.map(format_datetime);

        self.conn
            .call(move |conn| {
                conn.execute(
                    r#"
                    INSERT OR REPLACE INTO user_second_factor
                    (username, state, secret, backup_codes, created_at, last_used_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                    "#,
                    rusqlite::params![
                        username,
                        state,
                        secret,
                        backup_codes,
                        created_at,
                        last_used_at
                    ],
                )?;
                Ok::<_, rusqlite::Error>(())
            })
            .await?;

        Ok(())
    }

    async fn replace_second_factor(
        &self,
        expected: &SecondFactorState,
        profile: &SecondFactorProfile,
    ) -> Result<bool, DbError> {
        let username = profile.username.clone();
        let state = profile.state.as_str();
        let secret = profile.state.secret().map(str::to_string);
        let backup_codes = serde_json::to_string(&profile.state.backup_codes())
            .map_err(|e| DbError::Serialization(e.to_string()))?;
        let created_at = profile.created_at.map(format_datetime);
        let last_used_at = profile.last_used_at.map(format_datetime);

        let expected_state = expected.as_str();
        let expected_secret = expected.secret().map(str::to_string);
        let expected_codes = serde_json::to_string(&expected.backup_codes())
            .map_err(|e| DbError::Serialization(e.to_string()))?;
        let expect_missing = matches!(expected, SecondFactorState::Unconfigured);

        self.conn
            .call(move |conn| {
                let changed = if expect_missing {
                    conn.execute(
                        r#"
                        INSERT INTO user_second_factor
                        (username, state, secret, backup_codes, created_at, last_used_at)
                        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                        ON CONFLICT(username) DO UPDATE SET
                            state = excluded.state,
                            secret = excluded.secret,
                            backup_codes = excluded.backup_codes,
                            created_at = excluded.created_at,
                            last_used_at = excluded.last_used_at
                        WHERE user_second_factor.state = 'unconfigured'
                        "#,
                        rusqlite::params![
                            username,
                            state,
                            secret,
                            backup_codes,
                            created_at,
                            last_used_at
                        ],
                    )?
                } else {
                    conn.execute(
                        r#"
                        UPDATE user_second_factor
                        SET state = ?1, secret = ?2, backup_codes = ?3,
                            created_at = ?4, last_used_at = ?5
                        WHERE username = ?6 AND state = ?7 AND secret IS ?8 AND backup_codes = ?9
                        "#,
                        rusqlite::params![
                            state,
                            secret,
                            backup_codes,
                            created_at,
                            last_used_at,
                            username,
                            expected_state,
                            expected_secret,
                            expected_codes
                        ],
                    )?
                };
                Ok::<_, rusqlite::Error>(changed == 1)
            })
            .await
            .map_err(Into::into)
    }

    async fn consume_backup_code(
        &self,
        username: &str,
        code: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, DbError> {
        let username = username.to_string();
        let code = code.to_string();
        let at = format_datetime(at);

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;

                let row = tx
                    .query_row(
                        "SELECT state, backup_codes FROM user_second_factor WHERE username = ?1",
                        [&username],
                        |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
                    )
                    .optional()?;

                let Some((state, raw_codes)) = row else {
                    return Ok::<_, rusqlite::Error>(false);
                };
                if state != "active" {
                    return Ok(false);
                }

                let mut codes = parse_backup_codes(&raw_codes, 1)?;
                if !codes.remove(&code) {
                    return Ok(false);
                }
                let remaining = serde_json::to_string(&codes)
                    .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;

                tx.execute(
                    r#"
                    UPDATE user_second_factor
                    SET backup_codes = ?1, last_used_at = ?2
                    WHERE username = ?3
                    "#,
                    rusqlite::params![remaining, at, username],
                )?;

                tx.commit()?;
                Ok(true)
            })
            .await
            .map_err(Into::into)
    }

    async fn record_second_factor_use(
        &self,
        username: &str,
        at: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let username = username.to_string();
        let at = format_datetime(at);

        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE user_second_factor SET last_used_at = ?1 WHERE username = ?2",
                    rusqlite::params![at, username],
                )?;
                Ok::<_, rusqlite::Error>(())
            })
            .await?;

        Ok(())
    }
}

#[async_trait]
impl CredentialStore for SqliteDatabase {
    async fn get_credential(&self, username: &str) -> Result<Option<Credential>, DbError> {
        let username = username.to_string();

        self.conn
            .call(move |conn| {
                conn.query_row(
                    r#"
                    SELECT username, password_hash, role, is_active, created_at, updated_at
                    FROM user_accounts
                    WHERE username = ?1
                    "#,
                    [&username],
                    credential_from_row,
                )
                .optional()
            })
            .await
            .map_err(Into::into)
    }

    async fn upsert_credential(&self, credential: &Credential) -> Result<(), DbError> {
        let username = credential.username.clone();
        let password_hash = credential.password_hash.clone();
        let role = credential.role.to_string();
        let is_active = credential.is_active;
        let created_at = format_datetime(credential.created_at);
        let updated_at = format_datetime(credential.updated_at);

        self.conn
            .call(move |conn| {
                conn.execute(
                    r#"
                    INSERT OR REPLACE INTO user_accounts
                    (username, password_hash, role, is_active, created_at, updated_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                    "#,
                    rusqlite::params![
                        username,
                        password_hash,
                        role,
                        is_active,
                        created_at,
                        updated_at
                    ],
                )?;
                Ok::<_, rusqlite::Error>(())
            })
            .await?;

        Ok(())
    }

    async fn list_credentials(&self) -> Result<Vec<Credential>, DbError> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    r#"
                    SELECT username, password_hash, role, is_active, created_at, updated_at
                    FROM user_accounts
                    ORDER BY created_at ASC, username ASC
                    "#,
                )?;

                let credentials = stmt
                    .query_map([], credential_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;

                Ok::<_, rusqlite::Error>(credentials)
            })
            .await
            .map_err(Into::into)
    }
}

#[async_trait]
impl AuditSink for SqliteDatabase {
    async fn record_event(&self, event: &AuditEvent) -> Result<(), DbError> {
        let event = event.clone();

        self.conn
            .call(move |conn| {
                match event {
                    AuditEvent::IpBlocked(record) => {
                        conn.execute(
                            r#"
                            INSERT OR REPLACE INTO blocked_ips
                            (ip, reason, blocked_at, blocked_until)
                            VALUES (?1, ?2, ?3, ?4)
                            "#,
                            rusqlite::params![
                                record.ip,
                                record.reason,
                                format_datetime(record.blocked_at),
                                format_datetime(record.blocked_until)
                            ],
                        )?;
                    }
                    AuditEvent::LoginAttempt(log) => {
                        conn.execute(
                            r#"
                            INSERT INTO login_logs
                            (username, ip_address, user_agent, success, failure_reason, timestamp)
                            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                            "#,
                            rusqlite::params![
                                log.username,
                                log.ip_address,
                                log.user_agent,
                                log.success,
                                log.failure_reason,
                                format_datetime(log.timestamp)
                            ],
                        )?;
                    }
                    AuditEvent::Action(action) => {
                        conn.execute(
                            r#"
                            INSERT INTO audit_logs
                            (username, action, resource, ip_address, timestamp)
                            VALUES (?1, ?2, ?3, ?4, ?5)
                            "#,
                            rusqlite::params![
                                action.username,
                                action.action,
                                action.resource,
                                action.ip_address,
                                format_datetime(action.timestamp)
                            ],
                        )?;
                    }
                }
                Ok::<_, rusqlite::Error>(())
            })
            .await?;

        Ok(())
    }

    async fn recent_logins(
        &self,
        username: Option<String>,
        limit: u32,
    ) -> Result<Vec<LoginLog>, DbError> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    r#"
                    SELECT id, username, ip_address, user_agent, success, failure_reason, timestamp
                    FROM login_logs
                    WHERE (?1 IS NULL OR username = ?1)
                    ORDER BY timestamp DESC, id DESC
                    LIMIT ?2
                    "#,
                )?;

                let logs = stmt
                    .query_map(rusqlite::params![username, limit], |row| {
                        Ok(LoginLog {
                            id: Some(row.get(0)?),
                            username: row.get(1)?,
                            ip_address: row.get(2)?,
                            user_agent: row.get(3)?,
                            success: row.get(4)?,
                            failure_reason: row.get(5)?,
                            timestamp: datetime_at(row, 6)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;

                Ok::<_, rusqlite::Error>(logs)
            })
            .await
            .map_err(Into::into)
    }

    async fn recent_actions(
        &self,
        username: Option<String>,
        action: Option<String>,
        limit: u32,
    ) -> Result<Vec<ActionLog>, DbError> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    r#"
                    SELECT username, action, resource, ip_address, timestamp
                    FROM audit_logs
                    WHERE (?1 IS NULL OR username = ?1) AND (?2 IS NULL OR action = ?2)
                    ORDER BY timestamp DESC, id DESC
                    LIMIT ?3
                    "#,
                )?;

                let actions = stmt
                    .query_map(rusqlite::params![username, action, limit], |row| {
                        Ok(ActionLog {
                            username: row.get(0)?,
                            action: row.get(1)?,
                            resource: row.get(2)?,
                            ip_address: row.get(3)?,
                            timestamp: datetime_at(row, 4)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;

                Ok::<_, rusqlite::Error>(actions)
            })
            .await
            .map_err(Into::into)
    }
}

/// Format a timestamp so that string order matches time order
fn format_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a datetime string to DateTime<Utc>
fn parse_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    })
}

/// Read a required timestamp column
fn datetime_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn credential_from_row(row: &Row<'_>) -> rusqlite::Result<Credential> {
    let role: String = row.get(2)?;
    Ok(Credential {
        username: row.get(0)?,
        password_hash: row.get(1)?,
        role: role.parse().unwrap_or(Role::User),
        is_active: row.get(3)?,
        created_at: datetime_at(row, 4)?,
        updated_at: datetime_at(row, 5)?,
    })
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: Some(row.get(0)?),
        token_hash: row.get(1)?,
        username: row.get(2)?,
        ip_address: row.get(3)?,
        user_agent: row.get(4)?,
        created_at: datetime_at(row, 5)?,
        last_active: datetime_at(row, 6)?,
        expires_at: datetime_at(row, 7)?,
    })
}

fn parse_backup_codes(raw: &str, idx: usize) -> rusqlite::Result<BTreeSet<String>> {
    serde_json::from_str::<Option<BTreeSet<String>>>(raw)
        .map(Option::unwrap_or_default)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Rebuild the state enum from `state`, `secret` and `backup_codes` (columns 1-3)
fn second_factor_state_from_row(row: &Row<'_>) -> rusqlite::Result<SecondFactorState> {
    let state: String = row.get(1)?;
    let secret: Option<String> = row.get(2)?;
    let backup_codes = parse_backup_codes(&row.get::<_, String>(3)?, 3)?;

    let missing_secret = || {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            Type::Null,
            format!("second factor in state {} has no secret", state).into(),
        )
    };

    match state.as_str() {
        "pending" => Ok(SecondFactorState::Pending {
            secret: secret.ok_or_else(missing_secret)?,
            backup_codes,
        }),
        "active" => Ok(SecondFactorState::Active {
            secret: secret.ok_or_else(missing_secret)?,
            backup_codes,
        }),
        "disabled" => Ok(SecondFactorState::Disabled),
        _ => Ok(SecondFactorState::Unconfigured),
    }
}
