//! Common test utilities and helpers for integration tests

#![allow(dead_code)]

use std::sync::Arc;

use gatekeeper::auth::{AuthConfig, AuthManager, LoginRequest, TokenConfig};
use gatekeeper::clock::ManualClock;
use gatekeeper::database::SqliteDatabase;
use gatekeeper::store::{MemoryStore, SecurityStore};

/// Fixed starting instant, aligned to a 60 s window boundary
pub const START_UNIX: i64 = 1_700_000_040;

/// Client address used by the login helpers
pub const TEST_IP: &str = "203.0.113.7";

/// A desktop browser user-agent
pub const BROWSER_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) Gecko/20100101 Firefox/128.0";

/// Create an in-memory database for testing
pub async fn create_test_database() -> Arc<SqliteDatabase> {
    Arc::new(
        SqliteDatabase::in_memory()
            .await
            .expect("Failed to create test database"),
    )
}

/// Create a clock parked at [`START_UNIX`]
pub fn create_test_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::at_unix(START_UNIX))
}

/// Auth configuration with a real secret and cheap hashing
pub fn test_auth_config() -> AuthConfig {
    AuthConfig {
        token: TokenConfig {
            secret_key: "integration-test-secret".to_string(),
            ..Default::default()
        },
        password_iterations: 1_000,
        ..Default::default()
    }
}

/// Everything a test needs to drive the manager and inspect its stores
pub struct TestContext {
    pub clock: Arc<ManualClock>,
    pub database: Arc<SqliteDatabase>,
    pub store: Arc<dyn SecurityStore>,
    pub manager: AuthManager<SqliteDatabase>,
}

/// Create a manager over an in-memory database and memory store
pub async fn create_test_context(config: AuthConfig) -> TestContext {
    let clock = create_test_clock();
    let database = create_test_database().await;
    create_test_context_with(clock, database, config)
}

/// Create a manager over the given clock and database
pub fn create_test_context_with(
    clock: Arc<ManualClock>,
    database: Arc<SqliteDatabase>,
    config: AuthConfig,
) -> TestContext {
    let store: Arc<dyn SecurityStore> = Arc::new(MemoryStore::new(clock.clone()));
    let manager = AuthManager::new(database.clone(), store.clone(), clock.clone(), config)
        .expect("Failed to create auth manager");

    TestContext {
        clock,
        database,
        store,
        manager,
    }
}

/// Build a login request from [`TEST_IP`] with a browser user-agent
pub fn login_request(username: &str, password: &str) -> LoginRequest {
    LoginRequest {
        username: username.to_string(),
        password: password.to_string(),
        second_factor_code: None,
        ip: TEST_IP.to_string(),
        user_agent: Some(BROWSER_UA.to_string()),
    }
}
