//! Failover wrapper for the shared store
//!
//! Serves from a local [`MemoryStore`] while the shared backend is
//! unreachable, so limiting degrades to per-instance instead of switching off.
//! Non-connectivity errors from the primary are returned unchanged.
//!
//! Deletes issued while degraded are journaled and replayed against the
//! primary before it answers anything else, so a revoked session or lifted
//! block cannot reappear when the shared store comes back. Deletes always
//! clear the fallback too.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::StoreError;

use super::memory::MemoryStore;
use super::traits::SecurityStore;

/// Primary store with an in-process fallback
pub struct FailoverStore {
    primary: Arc<dyn SecurityStore>,
    fallback: MemoryStore,
    degraded: AtomicBool,
    pending_deletes: Mutex<HashSet<String>>,
}

impl FailoverStore {
    /// Wrap `primary`, falling back to `fallback` on connectivity errors
    pub fn new(primary: Arc<dyn SecurityStore>, fallback: MemoryStore) -> Self {
        Self {
            primary,
            fallback,
            degraded: AtomicBool::new(false),
            pending_deletes: Mutex::new(HashSet::new()),
        }
    }

    /// True while requests are being served from the fallback
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Deletes waiting for the primary to come back
    pub async fn pending_deletes(&self) -> usize {
        self.pending_deletes.lock().await.len()
    }

    /// Apply journaled deletes to the primary
    async fn replay_deletes(&self) -> Result<(), StoreError> {
        let mut pending = self.pending_deletes.lock().await;
        if pending.is_empty() {
            return Ok(());
        }

        let keys: Vec<String> = pending.iter().cloned().collect();
        for key in keys {
            self.primary.delete(&key).await?;
            pending.remove(&key);
        }
        info!(
            backend = self.primary.name(),
            "Replayed deletes issued while the shared store was unavailable"
        );
        Ok(())
    }

    async fn route<'a, T, P, PF, F, FF>(
        &'a self,
        op: &'static str,
        primary: P,
        fallback: F,
    ) -> Result<T, StoreError>
    where
        P: FnOnce(&'a dyn SecurityStore) -> PF,
        PF: Future<Output = Result<T, StoreError>> + 'a,
        F: FnOnce(&'a MemoryStore) -> FF,
        FF: Future<Output = Result<T, StoreError>> + 'a,
    {
        let result = match self.replay_deletes().await {
            Ok(()) => primary(self.primary.as_ref()).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(value) => {
                if self.degraded.swap(false, Ordering::Relaxed) {
                    info!(
                        backend = self.primary.name(),
                        "Shared security store recovered"
                    );
                }
                Ok(value)
            }
            Err(e) if e.is_connectivity() => {
                if !self.degraded.swap(true, Ordering::Relaxed) {
                    warn!(
                        backend = self.primary.name(),
                        op,
                        error = %e,
                        "Shared security store unavailable, serving from local memory"
                    );
                }
                fallback(&self.fallback).await
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl SecurityStore for FailoverStore {
    fn name(&self) -> &str {
        "failover"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.route("get", |s| s.get(key), |m| m.get(key)).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.route("set", |s| s.set(key, value, ttl), |m| m.set(key, value, ttl))
            .await
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        self.route("incr", |s| s.incr(key), |m| m.incr(key)).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.route("expire", |s| s.expire(key, ttl), |m| m.expire(key, ttl))
            .await
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        self.route("ttl", |s| s.ttl(key), |m| m.ttl(key)).await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let removed_locally = self.fallback.delete(key).await?;
        self.route(
            "delete",
            |s| s.delete(key),
            |_| async move {
                self.pending_deletes.lock().await.insert(key.to_string());
                Ok(removed_locally)
            },
        )
        .await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        self.route(
            "compare_and_swap",
            |s| s.compare_and_swap(key, expected, new, ttl),
            |m| m.compare_and_swap(key, expected, new, ttl),
        )
        .await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.primary.ping().await
    }
}
