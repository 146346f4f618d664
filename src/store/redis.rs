//! Redis-backed security store
//!
//! Shared backend for multi-instance deployments. All keys are prefixed,
//! every command runs under the configured deadline, and compare-and-swap
//! is a server-side Lua script so it stays atomic across instances.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{ErrorKind, FromRedisValue, RedisError};
use tracing::info;

use crate::error::StoreError;

use super::traits::{bounded, SecurityStore};

/// GET, compare, then SET/DEL in one round trip.
/// ARGV: has_expected, expected, has_new, new, ttl_ms (0 = no expiry)
const COMPARE_AND_SWAP_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '1' then
  if current ~= ARGV[2] then return 0 end
else
  if current then return 0 end
end
if ARGV[3] == '1' then
  if tonumber(ARGV[5]) > 0 then
    redis.call('SET', KEYS[1], ARGV[4], 'PX', ARGV[5])
  else
    redis.call('SET', KEYS[1], ARGV[4])
  end
else
  redis.call('DEL', KEYS[1])
end
return 1
"#;

/// Configuration for the Redis store
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Redis connection URL
    pub url: String,
    /// Key prefix for all entries
    pub prefix: String,
    /// Deadline for establishing the connection
    pub connection_timeout: Duration,
    /// Deadline for each command
    pub command_timeout: Duration,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            prefix: "gatekeeper:".to_string(),
            connection_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(2),
        }
    }
}

impl From<RedisError> for StoreError {
    fn from(err: RedisError) -> Self {
        if err.is_timeout() {
            return StoreError::Unavailable(format!("redis timeout: {}", err));
        }
        match err.kind() {
            ErrorKind::TypeError => StoreError::Serialization(err.to_string()),
            _ => StoreError::Unavailable(err.to_string()),
        }
    }
}

/// Redis implementation of [`SecurityStore`]
pub struct RedisStore {
    config: RedisStoreConfig,
    conn: ConnectionManager,
    cas_script: redis::Script,
}

impl RedisStore {
    /// Connect to Redis
    ///
    /// The connection manager reconnects on its own after transient failures.
    pub async fn connect(config: RedisStoreConfig) -> Result<Self, StoreError> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| StoreError::Unavailable(format!("invalid redis url: {}", e)))?;

        let conn = bounded(config.connection_timeout, async {
            ConnectionManager::new(client)
                .await
                .map_err(StoreError::from)
        })
        .await?;

        info!(prefix = %config.prefix, "Connected to redis security store");

        Ok(Self {
            config,
            conn,
            cas_script: redis::Script::new(COMPARE_AND_SWAP_SCRIPT),
        })
    }

    /// Returns the key prefix
    pub fn prefix(&self) -> &str {
        &self.config.prefix
    }

    /// Generates a prefixed key for Redis storage
    fn make_key(&self, key: &str) -> String {
        format!("{}{}", self.config.prefix, key)
    }

    async fn run<T: FromRedisValue>(&self, cmd: redis::Cmd) -> Result<T, StoreError> {
        let mut conn = self.conn.clone();
        bounded(self.config.command_timeout, async move {
            cmd.query_async::<_, T>(&mut conn)
                .await
                .map_err(StoreError::from)
        })
        .await
    }
}

fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl SecurityStore for RedisStore {
    fn name(&self) -> &str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(self.make_key(key));
        self.run(cmd).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.make_key(key)).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(millis(ttl));
        }
        self.run::<()>(cmd).await
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let mut cmd = redis::cmd("INCR");
        cmd.arg(self.make_key(key));
        self.run(cmd).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut cmd = redis::cmd("PEXPIRE");
        cmd.arg(self.make_key(key)).arg(millis(ttl));
        let updated: i64 = self.run(cmd).await?;
        Ok(updated == 1)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let mut cmd = redis::cmd("PTTL");
        cmd.arg(self.make_key(key));
        let remaining: i64 = self.run(cmd).await?;
        // -2: missing key, -1: no expiry
        Ok(u64::try_from(remaining).ok().map(Duration::from_millis))
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(self.make_key(key));
        let removed: i64 = self.run(cmd).await?;
        Ok(removed > 0)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let mut invocation = self.cas_script.key(self.make_key(key));
        invocation
            .arg(if expected.is_some() { "1" } else { "0" })
            .arg(expected.unwrap_or(""))
            .arg(if new.is_some() { "1" } else { "0" })
            .arg(new.unwrap_or(""))
            .arg(ttl.map(millis).unwrap_or(0));

        let mut conn = self.conn.clone();
        let swapped: i64 = bounded(self.config.command_timeout, async move {
            invocation
                .invoke_async::<_, i64>(&mut conn)
                .await
                .map_err(StoreError::from)
        })
        .await?;
        Ok(swapped == 1)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let reply: String = self.run(redis::cmd("PING")).await?;
        if reply == "PONG" {
            Ok(())
        } else {
            Err(StoreError::Unavailable(format!(
                "unexpected ping reply: {}",
                reply
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Test 1: Default configuration
    #[test]
    fn test_redis_store_config_default() {
        let config = RedisStoreConfig::default();
        assert_eq!(config.url, "redis://localhost:6379");
        assert_eq!(config.prefix, "gatekeeper:");
        assert_eq!(config.command_timeout, Duration::from_secs(2));
    }

    // Test 2: TTLs are sent in whole milliseconds, never zero
    #[test]
    fn test_millis_conversion() {
        assert_eq!(millis(Duration::from_secs(61)), 61_000);
        assert_eq!(millis(Duration::from_micros(10)), 1);
    }

    // Test 3: Type errors map to serialization, everything else to unavailable
    #[test]
    fn test_redis_error_mapping() {
        let err: StoreError = RedisError::from((ErrorKind::TypeError, "not an integer")).into();
        assert!(matches!(err, StoreError::Serialization(_)));

        let err: StoreError = RedisError::from((ErrorKind::IoError, "refused")).into();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }

    // Test 4: An invalid URL is reported without attempting a connection
    #[tokio::test]
    async fn test_connect_invalid_url() {
        let config = RedisStoreConfig {
            url: "not a url".to_string(),
            ..Default::default()
        };
        let result = RedisStore::connect(config).await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }
}
