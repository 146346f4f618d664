//! Security store backend parity tests
//!
//! The same behavioral suite runs against every backend. The Redis run is
//! skipped unless `GATEKEEPER_TEST_REDIS_URL` points at a server.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use gatekeeper::auth::{
    LoginThrottle, LoginThrottleConfig, RateDecision, RateLimitConfig, RateLimiter,
};
use gatekeeper::clock::{Clock, SystemClock};
use gatekeeper::error::AuthError;
use gatekeeper::store::{FailoverStore, MemoryStore, RedisStore, RedisStoreConfig, SecurityStore};

/// Behavior every backend must share; time never advances inside it
async fn run_store_suite(store: Arc<dyn SecurityStore>, clock: Arc<dyn Clock>, ns: &str) {
    let key = |rest: &str| format!("{}:{}", rest, ns);

    // get / set / delete
    assert_eq!(store.get(&key("blocked")).await.unwrap(), None);
    store
        .set(&key("blocked"), "crawler", Some(Duration::from_secs(120)))
        .await
        .unwrap();
    assert_eq!(
        store.get(&key("blocked")).await.unwrap().as_deref(),
        Some("crawler")
    );
    let ttl = store.ttl(&key("blocked")).await.unwrap().unwrap();
    assert!(ttl <= Duration::from_secs(120) && ttl > Duration::from_secs(100));
    assert!(store.delete(&key("blocked")).await.unwrap());
    assert!(!store.delete(&key("blocked")).await.unwrap());

    // incr keeps its TTL
    assert_eq!(store.incr(&key("rate")).await.unwrap(), 1);
    assert!(store
        .expire(&key("rate"), Duration::from_secs(61))
        .await
        .unwrap());
    assert_eq!(store.incr(&key("rate")).await.unwrap(), 2);
    assert!(store.ttl(&key("rate")).await.unwrap().is_some());
    assert!(!store
        .expire(&key("missing"), Duration::from_secs(5))
        .await
        .unwrap());

    // compare-and-swap
    let cas = key("login_fail");
    assert!(store
        .compare_and_swap(&cas, None, Some("[1]"), None)
        .await
        .unwrap());
    assert!(!store
        .compare_and_swap(&cas, None, Some("[2]"), None)
        .await
        .unwrap());
    assert!(!store
        .compare_and_swap(&cas, Some("[9]"), Some("[2]"), None)
        .await
        .unwrap());
    assert!(store
        .compare_and_swap(&cas, Some("[1]"), Some("[1,2]"), None)
        .await
        .unwrap());
    assert_eq!(store.get(&cas).await.unwrap().as_deref(), Some("[1,2]"));
    assert!(store
        .compare_and_swap(&cas, Some("[1,2]"), None, None)
        .await
        .unwrap());
    assert_eq!(store.get(&cas).await.unwrap(), None);

    // rate limiter: exact quota, then blocked
    let limiter = RateLimiter::new(
        RateLimitConfig {
            max_requests: 3,
            window: Duration::from_secs(3600),
            ..Default::default()
        },
        store.clone(),
        clock.clone(),
    );
    let ip = format!("10.0.0.1-{}", ns);
    for expected in [2, 1, 0] {
        assert_eq!(
            limiter.check(&ip).await,
            RateDecision::Allowed {
                remaining: expected
            }
        );
    }
    assert!(matches!(
        limiter.check(&ip).await,
        RateDecision::Limited { .. }
    ));
    assert!(matches!(
        limiter.check(&ip).await,
        RateDecision::Blocked { .. }
    ));
    assert!(limiter.unblock(&ip).await.unwrap());

    // login throttle: block after the fifth failure
    let throttle = LoginThrottle::new(LoginThrottleConfig::default(), store, clock);
    for _ in 0..5 {
        assert!(throttle.allow(&ip).await.is_ok());
        throttle.record_attempt(&ip, false).await.unwrap();
    }
    assert_eq!(throttle.failure_count(&ip).await.unwrap(), 5);
    assert!(matches!(
        throttle.allow(&ip).await,
        Err(AuthError::Blocked { .. })
    ));
}

/// Test 1: memory backend
#[tokio::test]
async fn test_memory_store_suite() {
    let clock = create_test_clock();
    let store = Arc::new(MemoryStore::new(clock.clone()));
    run_store_suite(store, clock, "memory").await;
}

/// Test 2: failover wrapper over a healthy primary
#[tokio::test]
async fn test_failover_store_suite() {
    let clock = create_test_clock();
    let primary: Arc<dyn SecurityStore> = Arc::new(MemoryStore::new(clock.clone()));
    let store = Arc::new(FailoverStore::new(
        primary,
        MemoryStore::new(clock.clone()),
    ));
    run_store_suite(store.clone(), clock, "failover").await;
    assert!(!store.is_degraded());
}

/// Test 3: redis backend, when a server is available
#[tokio::test]
async fn test_redis_store_suite() {
    let Ok(url) = std::env::var("GATEKEEPER_TEST_REDIS_URL") else {
        eprintln!("GATEKEEPER_TEST_REDIS_URL not set, skipping redis suite");
        return;
    };

    let ns = format!("{}", std::process::id());
    let store = RedisStore::connect(RedisStoreConfig {
        url,
        prefix: format!("gatekeeper-test-{}:", ns),
        ..Default::default()
    })
    .await
    .expect("Failed to connect to redis");
    assert!(store.ping().await.is_ok());

    run_store_suite(Arc::new(store), Arc::new(SystemClock), &ns).await;
}
