//! Per-identity request rate limiting
//!
//! Fixed-window counters keyed by `(identity, floor(now / window))` plus a
//! separate block entry. Once an identity exceeds the quota it is blocked for
//! `block_duration`, and every check short-circuits until the block expires,
//! regardless of window rollover. All state lives in the injected
//! [`SecurityStore`], so memory and shared backends behave the same.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::{AuthError, StoreError};
use crate::store::{bounded, SecurityStore};

/// Reason stored for blocks placed by the limiter itself
pub const RATE_LIMIT_REASON: &str = "rate_limit";

/// Configuration for the rate limiter
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Requests allowed per window
    pub max_requests: u64,

    /// Window length
    pub window: Duration,

    /// Block length once the quota is exceeded
    pub block_duration: Duration,

    /// Deadline for each store round trip
    pub store_timeout: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 60,
            window: Duration::from_secs(60),
            block_duration: Duration::from_secs(300), // 5 minutes
            store_timeout: Duration::from_secs(2),
        }
    }
}

/// Outcome of a rate-limit check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateDecision {
    /// Request may proceed
    Allowed { remaining: u64 },

    /// Quota just exceeded; a block was placed
    Limited { retry_after: Duration },

    /// Identity is under an existing block
    Blocked {
        retry_after: Duration,
        reason: String,
    },

    /// Store could not answer; request is rejected
    Unavailable,
}

impl RateDecision {
    /// Check if the request may proceed
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed { .. })
    }

    /// Seconds until a retry can succeed, rounded up
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            RateDecision::Limited { retry_after } | RateDecision::Blocked { retry_after, .. } => {
                Some(ceil_secs(*retry_after))
            }
            _ => None,
        }
    }

    /// Human-readable rejection message
    pub fn message(&self) -> Option<String> {
        match self {
            RateDecision::Allowed { .. } => None,
            RateDecision::Limited { retry_after } => Some(format!(
                "Too many requests, temporarily blocked for {} seconds",
                ceil_secs(*retry_after)
            )),
            RateDecision::Blocked { retry_after, .. } => Some(format!(
                "Temporarily blocked, retry in {} seconds",
                ceil_secs(*retry_after)
            )),
            RateDecision::Unavailable => {
                Some("Rate limiting unavailable, request rejected".to_string())
            }
        }
    }

    /// Convert into the error taxonomy
    pub fn into_result(self) -> Result<u64, AuthError> {
        match self {
            RateDecision::Allowed { remaining } => Ok(remaining),
            RateDecision::Limited { retry_after } => Err(AuthError::RateLimited {
                retry_after_secs: ceil_secs(retry_after),
            }),
            RateDecision::Blocked { retry_after, .. } => Err(AuthError::Blocked {
                retry_after_secs: ceil_secs(retry_after),
            }),
            RateDecision::Unavailable => Err(AuthError::Unavailable(
                "rate limit store unavailable".to_string(),
            )),
        }
    }
}

/// Diagnostic snapshot for one identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitStatus {
    pub identity: String,
    pub requests_in_window: u64,
    pub max_requests: u64,
    pub window_seconds: u64,
    pub is_blocked: bool,
    pub block_reason: Option<String>,
    pub block_remaining_seconds: u64,
}

pub(crate) fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

/// Store-backed fixed-window rate limiter
pub struct RateLimiter {
    config: RateLimitConfig,
    store: Arc<dyn SecurityStore>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a new rate limiter
    pub fn new(config: RateLimitConfig, store: Arc<dyn SecurityStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            store,
            clock,
        }
    }

    /// Active configuration
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn window_secs(&self) -> i64 {
        self.config.window.as_secs().max(1) as i64
    }

    fn window_key(&self, identity: &str) -> String {
        let index = self.clock.unix_secs().div_euclid(self.window_secs());
        format!("rate:{}:{}", identity, index)
    }

    fn block_key(identity: &str) -> String {
        format!("blocked:{}", identity)
    }

    /// Count one request and decide whether it may proceed
    ///
    /// Fails closed when the store errors or times out.
    pub async fn check(&self, identity: &str) -> RateDecision {
        match self.try_check(identity).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!(identity = %identity, error = %e, "Rate limit check failed, rejecting");
                RateDecision::Unavailable
            }
        }
    }

    async fn try_check(&self, identity: &str) -> Result<RateDecision, StoreError> {
        if let Some((reason, retry_after)) = self.active_block(identity).await? {
            return Ok(RateDecision::Blocked {
                retry_after,
                reason,
            });
        }

        let limit = self.config.store_timeout;
        let key = self.window_key(identity);
        let count = bounded(limit, self.store.incr(&key)).await?;
        if count == 1 {
            let ttl = self.config.window + Duration::from_secs(1);
            bounded(limit, self.store.expire(&key, ttl)).await?;
        }

        let count = count.max(0) as u64;
        if count > self.config.max_requests {
            self.block(identity, RATE_LIMIT_REASON, self.config.block_duration)
                .await?;
            warn!(
                identity = %identity,
                count,
                max = self.config.max_requests,
                "Rate limit exceeded, identity blocked"
            );
            return Ok(RateDecision::Limited {
                retry_after: self.config.block_duration,
            });
        }

        Ok(RateDecision::Allowed {
            remaining: self.config.max_requests - count,
        })
    }

    /// Place a block directly
    pub async fn block(&self, identity: &str, reason: &str, duration: Duration) -> Result<(), StoreError> {
        let reason = if reason.is_empty() { RATE_LIMIT_REASON } else { reason };
        bounded(
            self.config.store_timeout,
            self.store
                .set(&Self::block_key(identity), reason, Some(duration)),
        )
        .await?;
        debug!(identity = %identity, reason = %reason, ?duration, "Block placed");
        Ok(())
    }

    /// Lift a block early
    pub async fn unblock(&self, identity: &str) -> Result<bool, StoreError> {
        bounded(
            self.config.store_timeout,
            self.store.delete(&Self::block_key(identity)),
        )
        .await
    }

    /// Reason and remaining time of an active block
    async fn active_block(&self, identity: &str) -> Result<Option<(String, Duration)>, StoreError> {
        let limit = self.config.store_timeout;
        let key = Self::block_key(identity);

        let Some(reason) = bounded(limit, self.store.get(&key)).await? else {
            return Ok(None);
        };
        let remaining = bounded(limit, self.store.ttl(&key))
            .await?
            .unwrap_or(self.config.block_duration);
        Ok(Some((reason, remaining)))
    }

    /// Snapshot of the current window and block without counting a request
    pub async fn status(&self, identity: &str) -> Result<RateLimitStatus, StoreError> {
        let limit = self.config.store_timeout;
        let count = bounded(limit, self.store.get(&self.window_key(identity)))
            .await?
            .and_then(|raw| raw.parse::<u64>().ok())
            .unwrap_or(0);
        let block = self.active_block(identity).await?;

        Ok(RateLimitStatus {
            identity: identity.to_string(),
            requests_in_window: count,
            max_requests: self.config.max_requests,
            window_seconds: self.config.window.as_secs(),
            is_blocked: block.is_some(),
            block_remaining_seconds: block.as_ref().map_or(0, |(_, d)| ceil_secs(*d)),
            block_reason: block.map(|(reason, _)| reason),
        })
    }
}
