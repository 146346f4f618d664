//! Failed-login throttling
//!
//! Each identity keeps a list of failure timestamps (unix milliseconds,
//! JSON-encoded) under `login_fail:{identity}`. Lists are pruned to the block
//! horizon on every read and write. Appends go through compare-and-swap so
//! concurrent failures are never lost.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::ratelimit::ceil_secs;
use crate::clock::Clock;
use crate::error::{AuthError, StoreError};
use crate::store::{bounded, SecurityStore};

const CAS_ATTEMPTS: usize = 8;

/// Configuration for the login throttle
#[derive(Debug, Clone)]
pub struct LoginThrottleConfig {
    /// Failures within the horizon that trigger a block
    pub max_attempts: usize,

    /// Horizon and block length
    pub block_duration: Duration,

    /// Deadline for each store round trip
    pub store_timeout: Duration,
}

impl Default for LoginThrottleConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            block_duration: Duration::from_secs(900), // 15 minutes
            store_timeout: Duration::from_secs(2),
        }
    }
}

/// Per-identity failed-login tracker
pub struct LoginThrottle {
    config: LoginThrottleConfig,
    store: Arc<dyn SecurityStore>,
    clock: Arc<dyn Clock>,
}

impl LoginThrottle {
    /// Create a new login throttle
    pub fn new(
        config: LoginThrottleConfig,
        store: Arc<dyn SecurityStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            store,
            clock,
        }
    }

    fn key(identity: &str) -> String {
        format!("login_fail:{}", identity)
    }

    fn horizon_ms(&self) -> i64 {
        self.config.block_duration.as_millis() as i64
    }

    fn prune(&self, failures: Vec<i64>, now_ms: i64) -> Vec<i64> {
        let cutoff = now_ms - self.horizon_ms();
        failures.into_iter().filter(|t| *t > cutoff).collect()
    }

    fn decode(raw: Option<&str>) -> Result<Vec<i64>, StoreError> {
        match raw {
            None => Ok(Vec::new()),
            Some(raw) => serde_json::from_str(raw)
                .map_err(|e| StoreError::Serialization(format!("login failures: {}", e))),
        }
    }

    async fn load(&self, identity: &str) -> Result<(Option<String>, Vec<i64>), StoreError> {
        let raw = bounded(self.config.store_timeout, self.store.get(&Self::key(identity))).await?;
        let failures = Self::decode(raw.as_deref())?;
        Ok((raw, failures))
    }

    /// Check whether a login attempt may proceed
    ///
    /// Rejects with `Blocked` while the identity has at least `max_attempts`
    /// failures in the horizon. Fails closed when the store errors.
    pub async fn allow(&self, identity: &str) -> Result<(), AuthError> {
        let failures = match self.load(identity).await {
            Ok((_, failures)) => failures,
            Err(e) => {
                warn!(identity = %identity, error = %e, "Login throttle check failed, rejecting");
                return Err(AuthError::Unavailable(e.to_string()));
            }
        };

        let now_ms = self.clock.unix_millis();
        let failures = self.prune(failures, now_ms);
        if failures.len() < self.config.max_attempts {
            return Ok(());
        }

        let Some(oldest) = failures.iter().min().copied() else {
            return Ok(());
        };
        let remaining_ms = oldest + self.horizon_ms() - now_ms;
        if remaining_ms <= 0 {
            return Ok(());
        }

        let retry_after_secs = ceil_secs(Duration::from_millis(remaining_ms as u64)).max(1);
        info!(
            identity = %identity,
            failures = failures.len(),
            retry_after_secs,
            "Login attempt throttled"
        );
        Err(AuthError::Blocked { retry_after_secs })
    }

    /// Record the outcome of a login attempt
    ///
    /// Only failures are stored. A success leaves earlier failures in place.
    pub async fn record_attempt(&self, identity: &str, success: bool) -> Result<(), StoreError> {
        if success {
            return Ok(());
        }

        let key = Self::key(identity);
        let ttl = self.config.block_duration + Duration::from_secs(60);

        for _ in 0..CAS_ATTEMPTS {
            let (raw, failures) = self.load(identity).await?;
            let now_ms = self.clock.unix_millis();
            let mut failures = self.prune(failures, now_ms);
            failures.push(now_ms);

            let encoded = serde_json::to_string(&failures)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            let swapped = bounded(
                self.config.store_timeout,
                self.store
                    .compare_and_swap(&key, raw.as_deref(), Some(&encoded), Some(ttl)),
            )
            .await?;

            if swapped {
                debug!(identity = %identity, failures = failures.len(), "Login failure recorded");
                return Ok(());
            }
        }

        Err(StoreError::Contention(key))
    }

    /// Failures currently inside the horizon
    pub async fn failure_count(&self, identity: &str) -> Result<usize, StoreError> {
        let (_, failures) = self.load(identity).await?;
        Ok(self.prune(failures, self.clock.unix_millis()).len())
    }
}
