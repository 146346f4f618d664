//! Construction of the runtime object graph from [`Config`]
//!
//! The store backend is chosen here, once, and injected everywhere else.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::auth::AuthManager;
use crate::clock::Clock;
use crate::config::Config;
use crate::database::Database;
use crate::error::AppError;
use crate::otel::SecurityMetrics;
use crate::store::{FailoverStore, MemoryStore, RedisStore, SecurityStore};

/// Build the security store selected by `store.backend`
///
/// With `store.failover` set, an unreachable Redis degrades to the
/// in-process store instead of failing startup.
pub async fn build_store(
    config: &Config,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn SecurityStore>, AppError> {
    match config.store.backend.as_str() {
        "memory" => {
            info!("Using in-memory security store");
            Ok(Arc::new(MemoryStore::new(clock)))
        }
        "redis" => {
            let redis_config = config.redis_store_config().ok_or_else(|| {
                AppError::Config("store.redis.url is required for the redis backend".to_string())
            })?;

            match RedisStore::connect(redis_config).await {
                Ok(redis) if config.store.failover => {
                    info!("Using redis security store with in-memory failover");
                    Ok(Arc::new(FailoverStore::new(
                        Arc::new(redis),
                        MemoryStore::new(clock),
                    )))
                }
                Ok(redis) => {
                    info!("Using redis security store");
                    Ok(Arc::new(redis))
                }
                Err(e) if config.store.failover => {
                    error!(error = %e, "Redis unreachable, falling back to in-memory security store");
                    Ok(Arc::new(MemoryStore::new(clock)))
                }
                Err(e) => Err(e.into()),
            }
        }
        other => Err(AppError::Config(format!(
            "unknown store backend '{}'",
            other
        ))),
    }
}

/// Build the auth manager over an opened database and store
pub fn build_auth_manager<D: Database + 'static>(
    config: &Config,
    db: Arc<D>,
    store: Arc<dyn SecurityStore>,
    clock: Arc<dyn Clock>,
    metrics: Option<Arc<SecurityMetrics>>,
) -> Result<AuthManager<D>, AppError> {
    let manager = AuthManager::new(db, store, clock, config.auth_config())
        .map_err(|e| AppError::Config(e.to_string()))?;

    if manager.uses_default_secret() {
        warn!("auth.secret_key is the documented default; tokens can be forged");
    }

    Ok(match metrics {
        Some(metrics) => manager.with_metrics(metrics),
        None => manager,
    })
}

/// Apply the `admin` section: create or repair the bootstrap administrator
pub async fn ensure_admin<D: Database + 'static>(
    config: &Config,
    manager: &AuthManager<D>,
) -> Result<(), AppError> {
    let admin = &config.admin;
    match manager
        .ensure_admin_user(&admin.username, admin.password.as_deref())
        .await
    {
        Ok(Some(principal)) => {
            info!(username = %principal.username, "Bootstrap administrator ready");
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(e) => Err(AppError::Config(format!(
            "admin account '{}': {}",
            admin.username, e
        ))),
    }
}
