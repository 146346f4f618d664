//! Configuration management for gatekeeper
//!
//! This module handles loading, parsing, and validating configuration from
//! YAML files and `GATEKEEPER_*` environment variables, and converts the file
//! sections into the runtime configs the services take.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::auth::crawler::{DEFAULT_PATH_PATTERNS, DEFAULT_USER_AGENT_MARKERS};
use crate::auth::password::{PasswordPolicy, DEFAULT_ITERATIONS};
use crate::auth::token::{DEFAULT_SECRET_KEY, DEFAULT_TOKEN_TTL_SECS};
use crate::auth::{
    AuthConfig, CrawlerConfig, LoginThrottleConfig, RateLimitConfig, SecondFactorConfig,
    SessionConfig, TokenConfig,
};
use crate::store::RedisStoreConfig;

const ENV_PREFIX: &str = "GATEKEEPER_";

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Token signing and password hashing
    #[serde(default)]
    pub auth: AuthSettings,

    /// Per-identity request limits
    #[serde(default)]
    pub rate_limit: RateLimitSettings,

    /// Failed-login throttling
    #[serde(default)]
    pub login: LoginSettings,

    /// Session lifetime and cap
    #[serde(default)]
    pub session: SessionSettings,

    /// TOTP second factor
    #[serde(default)]
    pub second_factor: SecondFactorSettings,

    /// Crawler detection
    #[serde(default)]
    pub crawler: CrawlerSettings,

    /// Password strength rules
    #[serde(default)]
    pub password_policy: PasswordPolicy,

    /// Security store backend
    #[serde(default)]
    pub store: StoreSettings,

    /// Bootstrap administrator account
    #[serde(default)]
    pub admin: AdminSettings,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// OpenTelemetry configuration
    #[serde(default)]
    pub otel: OtelConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::FileRead(format!("Failed to read config file: {}", e)))?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(yaml);
        serde_yaml::from_str(&expanded)
            .map_err(|e| ConfigError::Parse(format!("Failed to parse YAML: {}", e)))
    }

    /// Load configuration from environment variables with prefix GATEKEEPER_
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Some(secret) = env_var("AUTH_SECRET_KEY") {
            config.auth.secret_key = secret;
        }
        if let Some(ttl) = parse_env("AUTH_TOKEN_TTL_SECS")? {
            config.auth.token_ttl_secs = ttl;
        }
        if let Some(iterations) = parse_env("AUTH_PASSWORD_ITERATIONS")? {
            config.auth.password_iterations = iterations;
        }

        if let Some(max) = parse_env("RATE_LIMIT_MAX_REQUESTS")? {
            config.rate_limit.max_requests = max;
        }
        if let Some(max) = parse_env("SESSION_MAX_PER_USER")? {
            config.session.max_per_user = max;
        }
        if let Some(fail_open) = parse_env("SESSION_LOOKUP_FAIL_OPEN")? {
            config.session.lookup_fail_open = fail_open;
        }

        if let Some(backend) = env_var("STORE_BACKEND") {
            config.store.backend = backend;
        }
        if let Some(url) = env_var("REDIS_URL") {
            config.store.redis.url = Some(url);
        }
        if let Some(prefix) = env_var("REDIS_PREFIX") {
            config.store.redis.prefix = prefix;
        }

        if let Some(username) = env_var("ADMIN_USERNAME") {
            config.admin.username = username;
        }
        if let Some(password) = env_var("ADMIN_PASSWORD") {
            config.admin.password = Some(password);
        }

        if let Some(path) = env_var("DATABASE_PATH") {
            config.database.path = path;
        }

        if let Some(enabled) = parse_env("OTEL_ENABLED")? {
            config.otel.enabled = enabled;
        }
        if let Some(endpoint) = env_var("OTEL_ENDPOINT") {
            config.otel.endpoint = Some(endpoint);
        }

        if let Some(level) = env_var("LOG_LEVEL") {
            config.logging.level = level;
        }

        Ok(config)
    }

    /// Reject unusable values and collect warnings about risky ones
    pub fn validate(&self) -> Result<Vec<String>, ConfigError> {
        let mut warnings = Vec::new();

        if self.auth.secret_key.is_empty() {
            return Err(ConfigError::InvalidValue(
                "auth.secret_key must not be empty".to_string(),
            ));
        }
        if self.auth.secret_key == DEFAULT_SECRET_KEY {
            warnings.push("auth.secret_key is the documented default".to_string());
        }
        if self.auth.password_iterations < 10_000 {
            warnings.push(format!(
                "auth.password_iterations is low ({})",
                self.auth.password_iterations
            ));
        }

        let positive = [
            ("rate_limit.max_requests", self.rate_limit.max_requests),
            ("rate_limit.window_secs", self.rate_limit.window_secs),
            ("login.max_attempts", self.login.max_attempts as u64),
            ("login.block_duration_secs", self.login.block_duration_secs),
            ("session.max_age_secs", self.session.max_age_secs),
            ("session.max_per_user", self.session.max_per_user as u64),
            ("store.timeout_ms", self.store.timeout_ms),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue(format!("{} must be > 0", name)));
            }
        }

        match self.store.backend.as_str() {
            "memory" => {}
            "redis" => {
                if self.store.redis.url.is_none() {
                    return Err(ConfigError::MissingRequired(
                        "store.redis.url is required for the redis backend".to_string(),
                    ));
                }
            }
            other => {
                return Err(ConfigError::InvalidValue(format!(
                    "unknown store backend '{}'",
                    other
                )))
            }
        }

        if self.admin.password.is_some() && self.admin.username.is_empty() {
            return Err(ConfigError::InvalidValue(
                "admin.username must not be empty".to_string(),
            ));
        }

        if self.session.lookup_fail_open {
            warnings.push("session.lookup_fail_open accepts sessions while the database is down".to_string());
        }

        Ok(warnings)
    }

    /// Deadline applied to every store round trip
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store.timeout_ms)
    }

    /// Runtime configuration for the auth services
    pub fn auth_config(&self) -> AuthConfig {
        let store_timeout = self.store_timeout();

        AuthConfig {
            token: TokenConfig {
                secret_key: self.auth.secret_key.clone(),
                default_ttl: chrono::Duration::seconds(self.auth.token_ttl_secs),
            },
            password_iterations: self.auth.password_iterations,
            password_policy: self.password_policy.clone(),
            rate_limit: RateLimitConfig {
                max_requests: self.rate_limit.max_requests,
                window: Duration::from_secs(self.rate_limit.window_secs),
                block_duration: Duration::from_secs(self.rate_limit.block_duration_secs),
                store_timeout,
            },
            login: LoginThrottleConfig {
                max_attempts: self.login.max_attempts,
                block_duration: Duration::from_secs(self.login.block_duration_secs),
                store_timeout,
            },
            session: SessionConfig {
                max_age: Duration::from_secs(self.session.max_age_secs),
                max_per_user: self.session.max_per_user,
                store_timeout,
                lookup_fail_open: self.session.lookup_fail_open,
            },
            second_factor: SecondFactorConfig {
                issuer: self.second_factor.issuer.clone(),
                window: self.second_factor.window,
                backup_code_count: self.second_factor.backup_code_count,
                secret_bytes: self.second_factor.secret_bytes,
            },
            crawler: CrawlerConfig {
                user_agent_markers: self.crawler.user_agent_markers.clone(),
                path_patterns: self.crawler.path_patterns.clone(),
                block_duration: Duration::from_secs(self.crawler.block_duration_secs),
            },
            crawler_enabled: self.crawler.enabled,
        }
    }

    /// Redis store configuration, if a URL is set
    pub fn redis_store_config(&self) -> Option<RedisStoreConfig> {
        let url = self.store.redis.url.clone()?;
        Some(RedisStoreConfig {
            url,
            prefix: self.store.redis.prefix.clone(),
            connection_timeout: Duration::from_secs(self.store.redis.connection_timeout_secs),
            command_timeout: self.store_timeout(),
        })
    }
}

/// Token signing and password hashing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthSettings {
    /// HMAC secret for bearer tokens
    #[serde(default = "default_secret_key")]
    pub secret_key: String,

    /// Default token lifetime in seconds
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: i64,

    /// PBKDF2 iteration count
    #[serde(default = "default_password_iterations")]
    pub password_iterations: u32,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            secret_key: default_secret_key(),
            token_ttl_secs: default_token_ttl(),
            password_iterations: default_password_iterations(),
        }
    }
}

fn default_secret_key() -> String {
    DEFAULT_SECRET_KEY.to_string()
}

fn default_token_ttl() -> i64 {
    DEFAULT_TOKEN_TTL_SECS
}

fn default_password_iterations() -> u32 {
    DEFAULT_ITERATIONS
}

/// Administrator created or updated at startup
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdminSettings {
    /// Login name of the bootstrap administrator
    #[serde(default = "default_admin_username")]
    pub username: String,

    /// Password to set; without one no account is touched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl Default for AdminSettings {
    fn default() -> Self {
        Self {
            username: default_admin_username(),
            password: None,
        }
    }
}

fn default_admin_username() -> String {
    "admin".to_string()
}

/// Request rate limiting
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateLimitSettings {
    /// Requests allowed per window
    #[serde(default = "default_max_requests")]
    pub max_requests: u64,

    /// Window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Block length in seconds once the quota is exceeded
    #[serde(default = "default_rate_block_secs")]
    pub block_duration_secs: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            window_secs: default_window_secs(),
            block_duration_secs: default_rate_block_secs(),
        }
    }
}

fn default_max_requests() -> u64 {
    60
}

fn default_window_secs() -> u64 {
    60
}

fn default_rate_block_secs() -> u64 {
    300
}

/// Failed-login throttling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoginSettings {
    /// Failures that trigger a block
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    /// Horizon and block length in seconds
    #[serde(default = "default_login_block_secs")]
    pub block_duration_secs: u64,
}

impl Default for LoginSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            block_duration_secs: default_login_block_secs(),
        }
    }
}

fn default_max_attempts() -> usize {
    5
}

fn default_login_block_secs() -> u64 {
    900
}

/// Session lifetime and cap
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSettings {
    /// Session lifetime in seconds
    #[serde(default = "default_session_max_age")]
    pub max_age_secs: u64,

    /// Live sessions allowed per user
    #[serde(default = "default_max_per_user")]
    pub max_per_user: usize,

    /// Serve lookups from a local mirror when the database fails
    #[serde(default)]
    pub lookup_fail_open: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_age_secs: default_session_max_age(),
            max_per_user: default_max_per_user(),
            lookup_fail_open: false,
        }
    }
}

fn default_session_max_age() -> u64 {
    24 * 60 * 60
}

fn default_max_per_user() -> usize {
    5
}

/// TOTP second factor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SecondFactorSettings {
    /// Issuer label shown in authenticator apps
    #[serde(default = "default_issuer")]
    pub issuer: String,

    /// Accepted steps either side of now
    #[serde(default = "default_totp_window")]
    pub window: u32,

    /// Backup codes per setup
    #[serde(default = "default_backup_code_count")]
    pub backup_code_count: usize,

    /// Secret size in bytes
    #[serde(default = "default_secret_bytes")]
    pub secret_bytes: usize,
}

impl Default for SecondFactorSettings {
    fn default() -> Self {
        Self {
            issuer: default_issuer(),
            window: default_totp_window(),
            backup_code_count: default_backup_code_count(),
            secret_bytes: default_secret_bytes(),
        }
    }
}

fn default_issuer() -> String {
    crate::auth::second_factor::DEFAULT_ISSUER.to_string()
}

fn default_totp_window() -> u32 {
    1
}

fn default_backup_code_count() -> usize {
    10
}

fn default_secret_bytes() -> usize {
    crate::auth::totp::DEFAULT_SECRET_BYTES
}

/// Crawler detection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CrawlerSettings {
    /// Classify and block crawlers during request screening
    #[serde(default = "default_crawler_enabled")]
    pub enabled: bool,

    /// Case-insensitive user-agent substrings
    #[serde(default = "default_user_agent_markers")]
    pub user_agent_markers: Vec<String>,

    /// Regular expressions matched against the request path and query
    #[serde(default = "default_path_patterns")]
    pub path_patterns: Vec<String>,

    /// Block length in seconds
    #[serde(default = "default_crawler_block_secs")]
    pub block_duration_secs: u64,
}

impl Default for CrawlerSettings {
    fn default() -> Self {
        Self {
            enabled: default_crawler_enabled(),
            user_agent_markers: default_user_agent_markers(),
            path_patterns: default_path_patterns(),
            block_duration_secs: default_crawler_block_secs(),
        }
    }
}

fn default_crawler_enabled() -> bool {
    true
}

fn default_user_agent_markers() -> Vec<String> {
    DEFAULT_USER_AGENT_MARKERS
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_path_patterns() -> Vec<String> {
    DEFAULT_PATH_PATTERNS.iter().map(|s| s.to_string()).collect()
}

fn default_crawler_block_secs() -> u64 {
    3600
}

/// Security store backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreSettings {
    /// `memory` or `redis`
    #[serde(default = "default_store_backend")]
    pub backend: String,

    /// Deadline for each store round trip in milliseconds
    #[serde(default = "default_store_timeout_ms")]
    pub timeout_ms: u64,

    /// Serve from local memory while the shared store is unreachable
    #[serde(default = "default_failover")]
    pub failover: bool,

    /// Redis connection
    #[serde(default)]
    pub redis: RedisSettings,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            timeout_ms: default_store_timeout_ms(),
            failover: default_failover(),
            redis: RedisSettings::default(),
        }
    }
}

fn default_store_backend() -> String {
    "memory".to_string()
}

fn default_store_timeout_ms() -> u64 {
    2000
}

fn default_failover() -> bool {
    true
}

/// Redis connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RedisSettings {
    /// Redis URL
    #[serde(default)]
    pub url: Option<String>,

    /// Key prefix
    #[serde(default = "default_redis_prefix")]
    pub prefix: String,

    /// Connection deadline in seconds
    #[serde(default = "default_redis_connect_secs")]
    pub connection_timeout_secs: u64,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: None,
            prefix: default_redis_prefix(),
            connection_timeout_secs: default_redis_connect_secs(),
        }
    }
}

fn default_redis_prefix() -> String {
    "gatekeeper:".to_string()
}

fn default_redis_connect_secs() -> u64 {
    5
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatabaseConfig {
    /// SQLite database path
    #[serde(default = "default_database_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

fn default_database_path() -> String {
    "data/gatekeeper.db".to_string()
}

/// OpenTelemetry configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OtelConfig {
    /// Export spans and metrics over OTLP
    #[serde(default)]
    pub enabled: bool,

    /// OTLP gRPC endpoint
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Service name
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

impl Default for OtelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: None,
            service_name: default_service_name(),
        }
    }
}

fn default_service_name() -> String {
    "gatekeeper".to_string()
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// `json` or `text`
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

/// Configuration errors
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    /// Error reading configuration file
    #[error("Failed to read configuration file: {0}")]
    FileRead(String),

    /// Error parsing configuration
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    /// Invalid configuration value
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    /// Missing required configuration
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(format!("{}{}", ENV_PREFIX, name)).ok()
}

fn parse_env<T: FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    env_var(name)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|_| {
                ConfigError::Parse(format!("Invalid value for {}{}: {}", ENV_PREFIX, name, raw))
            })
        })
        .transpose()
}

/// Expand environment variables in a string
///
/// Supports `${VAR_NAME}` syntax
fn expand_env_vars(input: &str) -> String {
    let re = regex_lite::Regex::new(r"\$\{([^}]+)\}")
        .expect("Invalid regex pattern for environment variable expansion");

    re.replace_all(input, |caps: &regex_lite::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_else(|_| caps[0].to_string())
    })
    .into_owned()
}
