//! Security store trait
//!
//! The counter/KV abstraction shared by the rate limiter, login throttle,
//! session cache and crawler blocks. Implementations must behave identically;
//! the backend is picked once at construction.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;

/// Key/value store with TTLs, atomic increments and compare-and-swap
///
/// Keys are namespaced `category:rest`, e.g. `rate:10.0.0.1:28512345`.
/// Values are strings; counters are decimal integers.
#[async_trait]
pub trait SecurityStore: Send + Sync {
    /// Backend name for logs and diagnostics
    fn name(&self) -> &str;

    /// Read a live value
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write a value, replacing any previous value and TTL
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Atomically add one and return the new value
    ///
    /// A missing key starts at zero. An existing TTL is kept.
    async fn incr(&self, key: &str) -> Result<i64, StoreError>;

    /// Set a TTL on an existing key. Returns false when the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Remaining TTL, or `None` when the key is missing or has no expiry
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError>;

    /// Remove a key. Returns true when something was removed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Replace the value only if it currently equals `expected`
    ///
    /// `expected = None` means "key must be absent"; `new = None` deletes.
    /// Returns false when the precondition did not hold.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError>;

    /// Connectivity check
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Run a store call under a deadline
pub async fn bounded<T, F>(limit: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(limit)),
    }
}

/// Category of a key: the part before the first `:`
pub fn key_category(key: &str) -> &str {
    key.split_once(':').map(|(category, _)| category).unwrap_or(key)
}
