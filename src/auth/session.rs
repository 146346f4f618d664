//! Session registry
//!
//! The durable [`SessionRepository`] is the source of truth. Live sessions are
//! mirrored into the [`SecurityStore`] under `session:{token_hash}` with a TTL
//! equal to the remaining lifetime, so most validations never reach the
//! durable store. Raw tokens are never stored; everything is keyed by the
//! SHA-256 hex digest.
//!
//! Revocation deletes the durable row before the cache entry. A cache delete
//! that fails is reported to the caller and remembered locally; until it is
//! retried successfully, cache hits for that hash are ignored.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::database::SessionRepository;
use crate::error::{AuthError, DbError, StoreError};
use crate::models::Session;
use crate::store::{bounded, SecurityStore};

/// SHA-256 hex digest of a bearer token
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Configuration for the session registry
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Lifetime of a new session
    pub max_age: Duration,

    /// Live sessions allowed per user
    pub max_per_user: usize,

    /// Deadline for each cache and durable round trip
    pub store_timeout: Duration,

    /// Answer from a process-local mirror when the durable store fails
    pub lookup_fail_open: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(24 * 60 * 60),
            max_per_user: 5,
            store_timeout: Duration::from_secs(2),
            lookup_fail_open: false,
        }
    }
}

/// A newly created session and how many older ones it displaced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedSession {
    pub session: Session,
    pub evicted: usize,
}

/// Durable + cached session lifecycle
pub struct SessionRegistry {
    config: SessionConfig,
    durable: Arc<dyn SessionRepository>,
    cache: Arc<dyn SecurityStore>,
    clock: Arc<dyn Clock>,
    mirror: Option<RwLock<HashMap<String, Session>>>,
    /// Cache deletes that failed, with the time after which the cached
    /// entry has expired on its own
    pending_drops: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl SessionRegistry {
    /// Create a new session registry
    pub fn new(
        config: SessionConfig,
        durable: Arc<dyn SessionRepository>,
        cache: Arc<dyn SecurityStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mirror = config
            .lookup_fail_open
            .then(|| RwLock::new(HashMap::new()));
        Self {
            config,
            durable,
            cache,
            clock,
            mirror,
            pending_drops: Mutex::new(HashMap::new()),
        }
    }

    fn cache_key(token_hash: &str) -> String {
        format!("session:{}", token_hash)
    }

    async fn with_deadline<T, F>(&self, fut: F) -> Result<T, DbError>
    where
        F: Future<Output = Result<T, DbError>>,
    {
        let limit = self.config.store_timeout;
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(DbError::Timeout(limit)),
        }
    }

    /// Mirror a session into the cache; cache failures are only logged
    async fn cache_put(&self, session: &Session) {
        let key = Self::cache_key(&session.token_hash);
        let limit = self.config.store_timeout;

        let result = match session.remaining(self.clock.now()) {
            Some(ttl) => match serde_json::to_string(session) {
                Ok(encoded) => bounded(limit, self.cache.set(&key, &encoded, Some(ttl))).await,
                Err(e) => {
                    warn!(error = %e, "Failed to encode session for cache");
                    return;
                }
            },
            None => bounded(limit, self.cache.delete(&key)).await.map(|_| ()),
        };

        if let Err(e) = result {
            warn!(error = %e, "Session cache write failed");
        }
    }

    /// Remove sessions from the cache and the local mirror
    ///
    /// Every hash is attempted. Failed deletes are kept for retry and the
    /// first error is returned.
    async fn cache_drop(&self, token_hashes: &[String]) -> Result<(), StoreError> {
        if let Some(mirror) = &self.mirror {
            let mut mirror = mirror.write().await;
            for hash in token_hashes {
                mirror.remove(hash);
            }
        }

        let limit = self.config.store_timeout;
        let mut first_error = None;
        for hash in token_hashes {
            if let Err(e) = bounded(limit, self.cache.delete(&Self::cache_key(hash))).await {
                warn!(error = %e, "Session cache delete failed, will retry");
                self.remember_drop(hash).await;
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn remember_drop(&self, token_hash: &str) {
        let until = chrono::Duration::from_std(self.config.max_age)
            .map(|max_age| self.clock.now() + max_age)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.pending_drops
            .lock()
            .await
            .insert(token_hash.to_string(), until);
    }

    /// Retry cache deletes that failed earlier
    async fn retry_pending_drops(&self) {
        let mut pending = self.pending_drops.lock().await;
        if pending.is_empty() {
            return;
        }

        let now = self.clock.now();
        pending.retain(|_, until| *until > now);

        let limit = self.config.store_timeout;
        let hashes: Vec<String> = pending.keys().cloned().collect();
        for hash in hashes {
            match bounded(limit, self.cache.delete(&Self::cache_key(&hash))).await {
                Ok(_) => {
                    pending.remove(&hash);
                }
                Err(e) => {
                    debug!(error = %e, "Session cache still unavailable for pending deletes");
                    break;
                }
            }
        }
    }

    async fn is_pending_drop(&self, token_hash: &str) -> bool {
        self.pending_drops.lock().await.contains_key(token_hash)
    }

    async fn mirror_put(&self, session: &Session) {
        if let Some(mirror) = &self.mirror {
            let now = self.clock.now();
            let mut mirror = mirror.write().await;
            mirror.retain(|_, cached| !cached.is_expired(now));
            mirror.insert(session.token_hash.clone(), session.clone());
        }
    }

    /// Register a session for `token`
    ///
    /// Purges the owner's expired sessions and evicts the least recently
    /// active ones so that the cap holds after insertion.
    pub async fn create(
        &self,
        token: &str,
        username: &str,
        ip: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<CreatedSession, AuthError> {
        let max_age = chrono::Duration::from_std(self.config.max_age)
            .map_err(|e| AuthError::MalformedInput(format!("session max_age: {}", e)))?;
        let now = self.clock.now();

        let session = Session::new(hash_token(token), username, now, max_age)
            .with_ip(ip)
            .with_user_agent(user_agent);

        let evicted = self
            .with_deadline(self.durable.insert_session_capped(
                &session,
                self.config.max_per_user,
                now,
            ))
            .await?;

        self.cache_drop(&evicted).await?;
        self.cache_put(&session).await;
        self.mirror_put(&session).await;

        info!(
            username = %username,
            evicted = evicted.len(),
            "Session created"
        );

        Ok(CreatedSession {
            session,
            evicted: evicted.len(),
        })
    }

    /// Resolve a token to its live session
    ///
    /// Cache first, then the durable store (refreshing `last_active` and
    /// the cache). Any failure yields `None` unless fail-open lookups are
    /// configured.
    pub async fn validate(&self, token: &str) -> Option<Session> {
        let token_hash = hash_token(token);
        let key = Self::cache_key(&token_hash);
        let now = self.clock.now();
        let limit = self.config.store_timeout;

        self.retry_pending_drops().await;

        if self.is_pending_drop(&token_hash).await {
            debug!("Session awaiting cache removal, using durable store");
        } else {
            match bounded(limit, self.cache.get(&key)).await {
                Ok(Some(raw)) => match serde_json::from_str::<Session>(&raw) {
                    Ok(session) if !session.is_expired(now) => return Some(session),
                    _ => {
                        let _ = bounded(limit, self.cache.delete(&key)).await;
                    }
                },
                Ok(None) => {}
                Err(e) => debug!(error = %e, "Session cache read failed, using durable store"),
            }
        }

        match self.lookup_durable(&token_hash).await {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "Durable session lookup failed");
                self.mirror_lookup(&token_hash).await
            }
        }
    }

    async fn lookup_durable(&self, token_hash: &str) -> Result<Option<Session>, DbError> {
        let now = self.clock.now();
        let dropped = || vec![token_hash.to_string()];

        let Some(mut session) = self
            .with_deadline(self.durable.get_session(token_hash))
            .await?
        else {
            let _ = self.cache_drop(&dropped()).await;
            return Ok(None);
        };
        if session.is_expired(now) {
            let _ = self.cache_drop(&dropped()).await;
            return Ok(None);
        }

        if !self.with_deadline(self.durable.touch_session(token_hash, now)).await? {
            // Revoked between read and touch
            return Ok(None);
        }
        session.last_active = now;

        self.cache_put(&session).await;

        // A revoke that ran after the touch has already cleared the cache;
        // take back the entry just written
        if self
            .with_deadline(self.durable.get_session(token_hash))
            .await?
            .is_none()
        {
            let _ = self.cache_drop(&dropped()).await;
            return Ok(None);
        }

        self.mirror_put(&session).await;
        Ok(Some(session))
    }

    async fn mirror_lookup(&self, token_hash: &str) -> Option<Session> {
        let mirror = self.mirror.as_ref()?;
        let now = self.clock.now();
        let mut mirror = mirror.write().await;
        let session = match mirror.get(token_hash).map(|s| s.is_expired(now)) {
            Some(true) => {
                mirror.remove(token_hash);
                None
            }
            Some(false) => mirror.get(token_hash).cloned(),
            None => None,
        };
        if session.is_some() {
            warn!("Session answered from local mirror while durable store is down");
        }
        session
    }

    /// Revoke one session. Returns false when it did not exist.
    ///
    /// Fails with `Unavailable` when the cache entry could not be removed;
    /// the durable row is gone by then and this process keeps rejecting the
    /// token, but callers should retry so other instances stop trusting it.
    pub async fn revoke(&self, token: &str) -> Result<bool, AuthError> {
        let token_hash = hash_token(token);
        self.retry_pending_drops().await;

        let removed = self
            .with_deadline(self.durable.delete_session(&token_hash))
            .await?;
        self.cache_drop(std::slice::from_ref(&token_hash)).await?;

        if removed {
            debug!("Session revoked");
        }
        Ok(removed)
    }

    /// Live sessions of a user, most recently active first
    pub async fn list(&self, username: &str) -> Result<Vec<Session>, AuthError> {
        let now = self.clock.now();
        Ok(self
            .with_deadline(self.durable.list_user_sessions(username, now))
            .await?)
    }

    /// Revoke every session of a user except `except_token`'s
    ///
    /// Returns how many sessions were removed.
    pub async fn revoke_all(
        &self,
        username: &str,
        except_token: Option<&str>,
    ) -> Result<usize, AuthError> {
        let keep = except_token.map(hash_token);
        self.retry_pending_drops().await;

        let removed = self
            .with_deadline(self.durable.delete_user_sessions(username, keep))
            .await?;
        self.cache_drop(&removed).await?;

        info!(username = %username, revoked = removed.len(), "Sessions revoked");
        Ok(removed.len())
    }

    /// Delete every expired session. Returns how many were removed.
    pub async fn purge_expired(&self) -> Result<usize, AuthError> {
        let now = self.clock.now();
        let removed = self
            .with_deadline(self.durable.purge_expired_sessions(now))
            .await?;
        // Expired entries are rejected on read; a failed delete only costs memory
        if let Err(e) = self.cache_drop(&removed).await {
            debug!(error = %e, "Purged sessions left in cache");
        }

        if !removed.is_empty() {
            info!(purged = removed.len(), "Expired sessions purged");
        }
        Ok(removed.len())
    }
}
