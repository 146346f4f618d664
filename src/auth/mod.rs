//! Authentication and request-screening services for gatekeeper
//!
//! This module provides:
//! - Password hashing and policy checks
//! - HMAC-signed bearer tokens
//! - TOTP second factor with backup codes
//! - Fixed-window rate limiting and failed-login throttling
//! - Durable, cached login sessions
//! - Heuristic crawler detection
//! - [`AuthManager`], the facade that wires them together

pub mod crawler;
pub mod login_throttle;
pub mod manager;
pub mod password;
pub mod ratelimit;
pub mod second_factor;
pub mod session;
pub mod token;
pub mod totp;

pub use crawler::{CrawlerConfig, CrawlerDetector, CrawlerVerdict};
pub use login_throttle::{LoginThrottle, LoginThrottleConfig};
pub use manager::{validate_username, AuthConfig, AuthManager, LoginOutcome, LoginRequest};
pub use password::{PasswordHasher, PasswordPolicy, PolicyViolation};
pub use ratelimit::{RateDecision, RateLimitConfig, RateLimitStatus, RateLimiter};
pub use second_factor::{SecondFactorConfig, SecondFactorService};
pub use session::{hash_token, CreatedSession, SessionConfig, SessionRegistry};
pub use token::{TokenClaims, TokenConfig, TokenService};
