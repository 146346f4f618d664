//! In-process security store
//!
//! Single-instance backend. Each key category (`rate`, `blocked`,
//! `login_fail`, `session`, ...) has its own lock, so traffic on one
//! category never waits on another. Expiry follows the injected clock.
//! Expired entries are swept from a category every [`SWEEP_EVERY`] inserts,
//! so keys that are never read again (old rate windows) do not accumulate.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};

use crate::clock::Clock;
use crate::error::StoreError;

use super::traits::{key_category, SecurityStore};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Inserts into one category between sweeps of its expired entries
pub const SWEEP_EVERY: u32 = 256;

#[derive(Debug, Default)]
struct Shard {
    entries: HashMap<String, Entry>,
    inserts: u32,
}

impl Shard {
    fn insert(&mut self, key: &str, entry: Entry, now: DateTime<Utc>) {
        self.entries.insert(key.to_string(), entry);
        self.inserts += 1;
        if self.inserts >= SWEEP_EVERY {
            self.inserts = 0;
            self.entries.retain(|_, entry| entry.is_live(now));
        }
    }
}

type Bucket = Arc<Mutex<Shard>>;

/// In-memory [`SecurityStore`]
pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    buckets: RwLock<HashMap<String, Bucket>>,
}

impl MemoryStore {
    /// Create an empty store reading time from `clock`
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            buckets: RwLock::new(HashMap::new()),
        }
    }

    async fn bucket(&self, key: &str) -> Bucket {
        let category = key_category(key);
        if let Some(bucket) = self.buckets.read().await.get(category) {
            return Arc::clone(bucket);
        }
        let mut buckets = self.buckets.write().await;
        Arc::clone(buckets.entry(category.to_string()).or_default())
    }

    fn deadline(&self, ttl: Option<Duration>) -> Result<Option<DateTime<Utc>>, StoreError> {
        ttl.map(|ttl| {
            chrono::Duration::from_std(ttl)
                .map(|ttl| self.clock.now() + ttl)
                .map_err(|e| StoreError::Serialization(format!("invalid ttl: {}", e)))
        })
        .transpose()
    }

    /// Drop expired entries in every category
    ///
    /// Returns the number of entries removed. Reads already ignore expired
    /// entries; this only reclaims memory.
    pub async fn cleanup(&self) -> usize {
        let now = self.clock.now();
        let buckets: Vec<Bucket> = self.buckets.read().await.values().cloned().collect();

        let mut removed = 0;
        for bucket in buckets {
            let mut shard = bucket.lock().await;
            let before = shard.entries.len();
            shard.entries.retain(|_, entry| entry.is_live(now));
            shard.inserts = 0;
            removed += before - shard.entries.len();
        }
        removed
    }

    /// Number of live entries across all categories
    pub async fn len(&self) -> usize {
        let now = self.clock.now();
        let buckets: Vec<Bucket> = self.buckets.read().await.values().cloned().collect();

        let mut count = 0;
        for bucket in buckets {
            count += bucket
                .lock()
                .await
                .entries
                .values()
                .filter(|entry| entry.is_live(now))
                .count();
        }
        count
    }

    /// Entries held in memory, expired ones not yet swept included
    pub async fn resident(&self) -> usize {
        let buckets: Vec<Bucket> = self.buckets.read().await.values().cloned().collect();

        let mut count = 0;
        for bucket in buckets {
            count += bucket.lock().await.entries.len();
        }
        count
    }

    /// True when no live entries remain
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl SecurityStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = self.clock.now();
        let bucket = self.bucket(key).await;
        let mut shard = bucket.lock().await;

        let found = shard
            .entries
            .get(key)
            .map(|entry| (entry.is_live(now), entry.value.clone()));

        match found {
            Some((true, value)) => Ok(Some(value)),
            Some((false, _)) => {
                shard.entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let now = self.clock.now();
        let expires_at = self.deadline(ttl)?;
        let bucket = self.bucket(key).await;
        bucket.lock().await.insert(
            key,
            Entry {
                value: value.to_string(),
                expires_at,
            },
            now,
        );
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let now = self.clock.now();
        let bucket = self.bucket(key).await;
        let mut shard = bucket.lock().await;

        let (current, expires_at) = match shard.entries.get(key) {
            Some(entry) if entry.is_live(now) => {
                let value = entry.value.parse::<i64>().map_err(|_| {
                    StoreError::Serialization(format!("value at {} is not an integer", key))
                })?;
                (value, entry.expires_at)
            }
            _ => (0, None),
        };

        let next = current + 1;
        shard.insert(
            key,
            Entry {
                value: next.to_string(),
                expires_at,
            },
            now,
        );
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let expires_at = self.deadline(Some(ttl))?;
        let bucket = self.bucket(key).await;
        let mut shard = bucket.lock().await;

        match shard.entries.get_mut(key) {
            Some(entry) if entry.is_live(now) => {
                entry.expires_at = expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let now = self.clock.now();
        let bucket = self.bucket(key).await;
        let shard = bucket.lock().await;

        Ok(shard
            .entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .and_then(|entry| entry.expires_at)
            .and_then(|at| (at - now).to_std().ok()))
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let bucket = self.bucket(key).await;
        let removed = bucket.lock().await.entries.remove(key);
        Ok(removed.map_or(false, |entry| entry.is_live(now)))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let expires_at = self.deadline(ttl)?;
        let bucket = self.bucket(key).await;
        let mut shard = bucket.lock().await;

        let current = shard
            .entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.as_str());
        if current != expected {
            return Ok(false);
        }

        match new {
            Some(value) => {
                shard.insert(
                    key,
                    Entry {
                        value: value.to_string(),
                        expires_at,
                    },
                    now,
                );
            }
            None => {
                shard.entries.remove(key);
            }
        }
        Ok(true)
    }
}
