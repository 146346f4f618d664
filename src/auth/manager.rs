//! Authentication manager
//!
//! This module provides the main authentication interface for the application.
//! It owns one instance of every security service and wires them to the
//! injected database, security store and clock.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::ConfigError;
use crate::database::Database;
use crate::error::AuthError;
use crate::models::{
    ActionLog, AuditEvent, BlockRecord, Credential, LoginLog, Principal, Role,
    SecondFactorEnrollment, SecondFactorStatus, Session,
};
use crate::otel::SecurityMetrics;
use crate::store::SecurityStore;

use super::crawler::{CrawlerConfig, CrawlerDetector, CrawlerVerdict};
use super::login_throttle::{LoginThrottle, LoginThrottleConfig};
use super::password::{PasswordHasher, PasswordPolicy, DEFAULT_ITERATIONS};
use super::ratelimit::{RateDecision, RateLimitConfig, RateLimitStatus, RateLimiter};
use super::second_factor::{SecondFactorConfig, SecondFactorService};
use super::session::{CreatedSession, SessionConfig, SessionRegistry};
use super::token::{TokenClaims, TokenConfig, TokenService};

const MAX_USERNAME_LEN: usize = 64;

/// Configuration for the authentication manager
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Token signing
    pub token: TokenConfig,

    /// PBKDF2 iteration count
    pub password_iterations: u32,

    /// Rules for new passwords
    pub password_policy: PasswordPolicy,

    /// Request rate limiting
    pub rate_limit: RateLimitConfig,

    /// Failed-login throttling
    pub login: LoginThrottleConfig,

    /// Session lifetime and cap
    pub session: SessionConfig,

    /// TOTP second factor
    pub second_factor: SecondFactorConfig,

    /// Crawler detection
    pub crawler: CrawlerConfig,

    /// Run crawler classification in `screen_request`
    pub crawler_enabled: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token: TokenConfig::default(),
            password_iterations: DEFAULT_ITERATIONS,
            password_policy: PasswordPolicy::default(),
            rate_limit: RateLimitConfig::default(),
            login: LoginThrottleConfig::default(),
            session: SessionConfig::default(),
            second_factor: SecondFactorConfig::default(),
            crawler: CrawlerConfig::default(),
            crawler_enabled: true,
        }
    }
}

/// A login attempt
#[derive(Debug, Clone, Default)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
    pub second_factor_code: Option<String>,
    pub ip: String,
    pub user_agent: Option<String>,
}

/// A successful login
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginOutcome {
    /// Bearer token; shown once
    pub token: String,

    /// Authenticated user
    pub principal: Principal,

    /// When the token or its session lapses, whichever comes first
    pub expires_at: DateTime<Utc>,

    /// Older sessions evicted by the per-user cap
    pub evicted_sessions: usize,
}

/// Authentication manager
///
/// Provides methods for screening requests, logging users in and out, and
/// managing credentials, sessions and second factors.
pub struct AuthManager<D: Database + 'static> {
    db: Arc<D>,
    clock: Arc<dyn Clock>,
    hasher: PasswordHasher,
    policy: PasswordPolicy,
    tokens: TokenService,
    token_ttl: chrono::Duration,
    second_factor: SecondFactorService,
    rate_limiter: Arc<RateLimiter>,
    login_throttle: LoginThrottle,
    sessions: SessionRegistry,
    crawler: CrawlerDetector,
    crawler_enabled: bool,
    crawler_block: Duration,
    metrics: Option<Arc<SecurityMetrics>>,
    dummy_hash: String,
}

impl<D: Database + 'static> AuthManager<D> {
    /// Create a new authentication manager
    ///
    /// Fails only when the crawler patterns do not compile.
    pub fn new(
        db: Arc<D>,
        store: Arc<dyn SecurityStore>,
        clock: Arc<dyn Clock>,
        config: AuthConfig,
    ) -> Result<Self, ConfigError> {
        let hasher = PasswordHasher::new(config.password_iterations);
        let dummy_hash = hasher.hash("gatekeeper-timing-equalizer");

        let rate_limiter = Arc::new(RateLimiter::new(
            config.rate_limit,
            store.clone(),
            clock.clone(),
        ));
        let crawler_block = config.crawler.block_duration;
        let crawler = CrawlerDetector::new(
            config.crawler,
            rate_limiter.clone(),
            db.clone(),
            clock.clone(),
        )?;

        Ok(Self {
            tokens: TokenService::new(config.token.clone(), clock.clone()),
            token_ttl: config.token.default_ttl,
            second_factor: SecondFactorService::new(
                config.second_factor,
                db.clone(),
                clock.clone(),
            ),
            login_throttle: LoginThrottle::new(config.login, store.clone(), clock.clone()),
            sessions: SessionRegistry::new(config.session, db.clone(), store, clock.clone()),
            policy: config.password_policy,
            crawler_enabled: config.crawler_enabled,
            crawler_block,
            rate_limiter,
            crawler,
            hasher,
            dummy_hash,
            metrics: None,
            clock,
            db,
        })
    }

    /// Attach security metrics
    pub fn with_metrics(mut self, metrics: Arc<SecurityMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// The rate limiter shared with the crawler detector
    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    /// Check if the token service signs with the documented default secret
    pub fn uses_default_secret(&self) -> bool {
        self.tokens.uses_default_secret()
    }

    // =========================================================================
    // Request screening
    // =========================================================================

    /// Rate-limit then classify a request
    ///
    /// A request classified as a bot blocks its identity and is rejected.
    /// Returns the requests remaining in the current window.
    pub async fn screen_request(
        &self,
        ip: &str,
        user_agent: Option<&str>,
        path: &str,
    ) -> Result<u64, AuthError> {
        let decision = self.check_rate_limit(ip).await;
        let remaining = decision.into_result()?;

        if !self.crawler_enabled {
            return Ok(remaining);
        }

        if let CrawlerVerdict::Bot { reason } = self.crawler.classify(user_agent, path, ip) {
            self.crawler.block(ip, &reason, None).await?;
            if let Some(metrics) = &self.metrics {
                metrics.record_crawler_blocked();
            }
            return Err(AuthError::Blocked {
                retry_after_secs: self.crawler_block.as_secs(),
            });
        }

        Ok(remaining)
    }

    /// Count one request against `ip`'s quota
    pub async fn check_rate_limit(&self, ip: &str) -> RateDecision {
        let decision = self.rate_limiter.check(ip).await;
        if let Some(metrics) = &self.metrics {
            match &decision {
                RateDecision::Allowed { .. } => {}
                RateDecision::Limited { .. } => metrics.record_rate_limited("limited"),
                RateDecision::Blocked { .. } => metrics.record_rate_limited("blocked"),
                RateDecision::Unavailable => metrics.record_rate_limited("unavailable"),
            }
        }
        decision
    }

    /// Rate-limit diagnostics for `ip`
    pub async fn rate_limit_status(&self, ip: &str) -> Result<RateLimitStatus, AuthError> {
        Ok(self.rate_limiter.status(ip).await?)
    }

    /// Classify a request without side effects
    pub fn classify_crawler(
        &self,
        user_agent: Option<&str>,
        path: &str,
        ip: &str,
    ) -> CrawlerVerdict {
        self.crawler.classify(user_agent, path, ip)
    }

    /// Block an identity and write the audit record
    pub async fn block_ip(
        &self,
        ip: &str,
        reason: &str,
        duration: Option<Duration>,
    ) -> Result<BlockRecord, AuthError> {
        self.crawler.block(ip, reason, duration).await
    }

    /// Lift a block. Returns false when there was none.
    pub async fn unblock_ip(&self, ip: &str) -> Result<bool, AuthError> {
        Ok(self.rate_limiter.unblock(ip).await?)
    }

    // =========================================================================
    // Passwords and tokens
    // =========================================================================

    /// Hash a password on the blocking pool
    pub async fn hash_password(&self, password: &str) -> Result<String, AuthError> {
        let hasher = self.hasher.clone();
        let password = password.to_string();
        let started = Instant::now();

        let hash = tokio::task::spawn_blocking(move || hasher.hash(&password))
            .await
            .map_err(|e| AuthError::Unavailable(format!("hashing task failed: {}", e)))?;

        if let Some(metrics) = &self.metrics {
            metrics.record_password_hash(started.elapsed());
        }
        Ok(hash)
    }

    /// Verify a password on the blocking pool
    pub async fn verify_password(&self, password: &str, hash: &str) -> Result<bool, AuthError> {
        let hasher = self.hasher.clone();
        let password = password.to_string();
        let hash = hash.to_string();
        let started = Instant::now();

        let valid = tokio::task::spawn_blocking(move || hasher.verify(&password, &hash))
            .await
            .map_err(|e| AuthError::Unavailable(format!("hashing task failed: {}", e)))?;

        if let Some(metrics) = &self.metrics {
            metrics.record_password_hash(started.elapsed());
        }
        Ok(valid)
    }

    /// Sign a token with the given claims
    pub fn issue_token(
        &self,
        claims: Map<String, Value>,
        ttl: Option<chrono::Duration>,
    ) -> Result<String, AuthError> {
        self.tokens.issue(claims, ttl)
    }

    /// Verify a token's signature and expiry
    pub fn verify_token(&self, token: &str) -> Option<TokenClaims> {
        self.tokens.verify(token)
    }

    // =========================================================================
    // Login
    // =========================================================================

    /// Check whether `ip` may attempt a login
    pub async fn check_login_allowed(&self, ip: &str) -> Result<(), AuthError> {
        self.login_throttle.allow(ip).await
    }

    /// Record a login outcome for `ip`
    pub async fn record_login_attempt(&self, ip: &str, success: bool) -> Result<(), AuthError> {
        Ok(self.login_throttle.record_attempt(ip, success).await?)
    }

    /// Password (and second factor) login
    ///
    /// Unknown users, inactive users and wrong passwords fail identically.
    /// `SecondFactorRequired` is only returned after the password matched and
    /// does not count as a failure.
    pub async fn login(&self, request: LoginRequest) -> Result<LoginOutcome, AuthError> {
        let ip = request.ip.as_str();
        let user_agent = request.user_agent.as_deref();

        if let Err(e) = self.login_throttle.allow(ip).await {
            self.log_login(&request, Some("too_many_attempts")).await;
            self.count_login("blocked");
            return Err(e);
        }

        let credential = match self.check_credentials(&request.username, &request.password).await? {
            Some(credential) => credential,
            None => {
                self.fail_login(&request, "invalid_credentials").await;
                return Err(AuthError::AuthenticationFailed);
            }
        };

        if self.second_factor.is_enabled(&credential.username).await? {
            let code = match request.second_factor_code.as_deref().map(str::trim) {
                Some(code) if !code.is_empty() => code,
                _ => {
                    debug!(username = %credential.username, "Second factor code required");
                    return Err(AuthError::SecondFactorRequired);
                }
            };

            match self
                .second_factor
                .verify_user_code(&credential.username, code)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    self.fail_login(&request, "invalid_second_factor").await;
                    return Err(AuthError::AuthenticationFailed);
                }
                Err(AuthError::Exhausted) => {
                    self.fail_login(&request, "backup_codes_exhausted").await;
                    return Err(AuthError::Exhausted);
                }
                Err(e) => return Err(e),
            }
        }

        let principal = Principal::from(&credential);
        let mut claims = Map::new();
        claims.insert("sub".to_string(), json!(principal.username));
        claims.insert("role".to_string(), json!(principal.role.to_string()));
        claims.insert("jti".to_string(), json!(random_id()));
        let token = self.tokens.issue(claims, None)?;
        let token_expires_at = self.clock.now() + self.token_ttl;

        let CreatedSession { session, evicted } = self
            .sessions
            .create(&token, &principal.username, Some(ip), user_agent)
            .await?;

        if let Err(e) = self.login_throttle.record_attempt(ip, true).await {
            warn!(ip = %ip, error = %e, "Failed to record login success");
        }
        self.log_login(&request, None).await;
        self.log_action(&principal.username, "login", None, Some(ip))
            .await;
        self.count_login("success");
        if let Some(metrics) = &self.metrics {
            metrics.record_session_created(evicted);
        }

        info!(
            username = %principal.username,
            ip = %ip,
            evicted = evicted,
            "Login succeeded"
        );

        Ok(LoginOutcome {
            token,
            principal,
            expires_at: token_expires_at.min(session.expires_at),
            evicted_sessions: evicted,
        })
    }

    /// Resolve a bearer token to its user
    ///
    /// The token must verify, its session must be live and the account must
    /// still be active.
    pub async fn authenticate(&self, token: &str) -> Result<Principal, AuthError> {
        let claims = self.tokens.verify(token).ok_or(AuthError::InvalidToken)?;
        let subject = claims.subject().ok_or(AuthError::InvalidToken)?;

        let session = self
            .sessions
            .validate(token)
            .await
            .ok_or(AuthError::InvalidToken)?;
        if session.username != subject {
            warn!(subject = %subject, owner = %session.username, "Token subject does not match session owner");
            return Err(AuthError::InvalidToken);
        }

        match self.db.get_credential(subject).await? {
            Some(credential) if credential.is_active => Ok(Principal::from(&credential)),
            _ => Err(AuthError::InvalidToken),
        }
    }

    /// End the session behind `token`. Returns false when there was none.
    pub async fn logout(&self, token: &str) -> Result<bool, AuthError> {
        let revoked = self.sessions.revoke(token).await?;
        if let Some(subject) = self.tokens.verify(token).as_ref().and_then(TokenClaims::subject) {
            if revoked {
                self.log_action(subject, "logout", None, None).await;
            }
        }
        Ok(revoked)
    }

    /// Most recent login attempts, newest first
    pub async fn recent_logins(
        &self,
        username: Option<&str>,
        limit: u32,
    ) -> Result<Vec<LoginLog>, AuthError> {
        Ok(self
            .db
            .recent_logins(username.map(str::to_string), limit)
            .await?)
    }

    /// Most recent administrative actions, newest first
    ///
    /// `username` filters by actor and `action` by action name.
    pub async fn audit_logs(
        &self,
        username: Option<&str>,
        action: Option<&str>,
        limit: u32,
    ) -> Result<Vec<ActionLog>, AuthError> {
        Ok(self
            .db
            .recent_actions(username.map(str::to_string), action.map(str::to_string), limit)
            .await?)
    }

    // =========================================================================
    // Accounts
    // =========================================================================

    /// Every account, oldest first
    pub async fn list_users(&self) -> Result<Vec<Credential>, AuthError> {
        Ok(self.db.list_credentials().await?)
    }

    /// Create or repair the bootstrap administrator
    ///
    /// Without a password nothing is changed and `None` is returned. An
    /// existing account keeps its creation time but is reactivated, promoted
    /// to admin and given the password; its sessions are revoked when the
    /// password changed.
    pub async fn ensure_admin_user(
        &self,
        username: &str,
        password: Option<&str>,
    ) -> Result<Option<Principal>, AuthError> {
        let Some(password) = password else {
            debug!(username = %username, "No admin password configured");
            return Ok(None);
        };
        validate_username(username)?;
        self.check_policy(password)?;

        let now = self.clock.now();
        let existing = self.db.get_credential(username).await?;

        if let Some(current) = &existing {
            let unchanged = current.is_active
                && current.role == Role::Admin
                && match &current.password_hash {
                    Some(hash) => self.verify_password(password, hash).await?,
                    None => false,
                };
            if unchanged {
                debug!(username = %username, "Admin account already up to date");
                return Ok(Some(Principal::from(current)));
            }
        }

        let hash = self.hash_password(password).await?;
        let credential = match existing {
            Some(mut current) => {
                current.password_hash = Some(hash);
                current.role = Role::Admin;
                current.is_active = true;
                current.updated_at = now;
                current
            }
            None => Credential::new(username, hash, Role::Admin, now),
        };
        self.db.upsert_credential(&credential).await?;

        let revoked = self.sessions.revoke_all(username, None).await?;
        self.log_action(username, "ensure_admin", Some(username), None)
            .await;
        info!(username = %username, revoked_sessions = revoked, "Admin account ensured");
        Ok(Some(Principal::from(&credential)))
    }

    /// Create an active account
    pub async fn create_user(
        &self,
        username: &str,
        password: &str,
        role: Role,
    ) -> Result<Principal, AuthError> {
        validate_username(username)?;
        self.check_policy(password)?;

        if self.db.get_credential(username).await?.is_some() {
            return Err(AuthError::MalformedInput(format!(
                "user '{}' already exists",
                username
            )));
        }

        let hash = self.hash_password(password).await?;
        let credential = Credential::new(username, hash, role, self.clock.now());
        self.db.upsert_credential(&credential).await?;

        self.log_action(username, "create_user", Some(username), None)
            .await;
        info!(username = %username, role = %role, "User created");
        Ok(Principal::from(&credential))
    }

    /// Change a password after proving the old one
    ///
    /// Every other session of the user is revoked; `current_token` survives.
    pub async fn change_password(
        &self,
        username: &str,
        old_password: &str,
        new_password: &str,
        current_token: Option<&str>,
    ) -> Result<(), AuthError> {
        let mut credential = self
            .check_credentials(username, old_password)
            .await?
            .ok_or(AuthError::AuthenticationFailed)?;
        self.check_policy(new_password)?;

        credential.password_hash = Some(self.hash_password(new_password).await?);
        credential.updated_at = self.clock.now();
        self.db.upsert_credential(&credential).await?;

        let revoked = self.sessions.revoke_all(username, current_token).await?;
        self.log_action(username, "change_password", None, None)
            .await;
        info!(username = %username, revoked_sessions = revoked, "Password changed");
        Ok(())
    }

    /// Administrative password reset; revokes all of the user's sessions
    pub async fn reset_password(
        &self,
        actor: &str,
        username: &str,
        new_password: &str,
    ) -> Result<(), AuthError> {
        self.check_policy(new_password)?;

        let mut credential = self
            .db
            .get_credential(username)
            .await?
            .ok_or_else(|| AuthError::MalformedInput(format!("unknown user '{}'", username)))?;

        credential.password_hash = Some(self.hash_password(new_password).await?);
        credential.updated_at = self.clock.now();
        self.db.upsert_credential(&credential).await?;

        let revoked = self.sessions.revoke_all(username, None).await?;
        self.log_action(actor, "reset_password", Some(username), None)
            .await;
        warn!(actor = %actor, username = %username, revoked_sessions = revoked, "Password reset");
        Ok(())
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    /// Register a session for a token issued elsewhere
    pub async fn create_session(
        &self,
        token: &str,
        username: &str,
        ip: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<CreatedSession, AuthError> {
        let created = self.sessions.create(token, username, ip, user_agent).await?;
        if let Some(metrics) = &self.metrics {
            metrics.record_session_created(created.evicted);
        }
        Ok(created)
    }

    /// Look up a live session
    pub async fn validate_session(&self, token: &str) -> Option<Session> {
        self.sessions.validate(token).await
    }

    /// Revoke one session
    pub async fn revoke_session(&self, token: &str) -> Result<bool, AuthError> {
        self.sessions.revoke(token).await
    }

    /// Revoke all of a user's sessions except `except_token`
    pub async fn revoke_all_sessions(
        &self,
        username: &str,
        except_token: Option<&str>,
    ) -> Result<usize, AuthError> {
        let revoked = self.sessions.revoke_all(username, except_token).await?;
        self.log_action(username, "revoke_all_sessions", None, None)
            .await;
        Ok(revoked)
    }

    /// Live sessions of a user, most recently active first
    pub async fn list_sessions(&self, username: &str) -> Result<Vec<Session>, AuthError> {
        self.sessions.list(username).await
    }

    /// Drop every expired session
    pub async fn purge_expired_sessions(&self) -> Result<usize, AuthError> {
        self.sessions.purge_expired().await
    }

    // =========================================================================
    // Second factor
    // =========================================================================

    /// Start second-factor enrollment
    pub async fn setup_second_factor(
        &self,
        username: &str,
    ) -> Result<SecondFactorEnrollment, AuthError> {
        self.second_factor.setup(username).await
    }

    /// Confirm enrollment with a code from the authenticator
    pub async fn enable_second_factor(&self, username: &str, code: &str) -> Result<(), AuthError> {
        self.second_factor.enable(username, code).await?;
        self.log_action(username, "enable_second_factor", None, None)
            .await;
        Ok(())
    }

    /// Turn the second factor off
    pub async fn disable_second_factor(&self, username: &str) -> Result<(), AuthError> {
        self.second_factor.disable(username).await?;
        self.log_action(username, "disable_second_factor", None, None)
            .await;
        Ok(())
    }

    /// Check a TOTP or backup code
    pub async fn verify_second_factor_code(
        &self,
        username: &str,
        code: &str,
    ) -> Result<bool, AuthError> {
        self.second_factor.verify_user_code(username, code).await
    }

    /// Replace the backup codes
    pub async fn regenerate_backup_codes(&self, username: &str) -> Result<Vec<String>, AuthError> {
        let codes = self.second_factor.regenerate_backup_codes(username).await?;
        self.log_action(username, "regenerate_backup_codes", None, None)
            .await;
        Ok(codes)
    }

    /// Second-factor diagnostics
    pub async fn second_factor_status(
        &self,
        username: &str,
    ) -> Result<SecondFactorStatus, AuthError> {
        self.second_factor.status(username).await
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Returns the credential when the password matches an active account
    async fn check_credentials(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<Credential>, AuthError> {
        let credential = self.db.get_credential(username).await?;

        let hash = credential
            .as_ref()
            .filter(|c| c.is_active)
            .and_then(|c| c.password_hash.clone());
        let Some(hash) = hash else {
            // Burn the same hashing time as a real check
            let _ = self.verify_password(password, &self.dummy_hash).await?;
            return Ok(None);
        };

        if self.verify_password(password, &hash).await? {
            Ok(credential)
        } else {
            Ok(None)
        }
    }

    fn check_policy(&self, password: &str) -> Result<(), AuthError> {
        self.policy.validate(password).map_err(|violations| {
            AuthError::PolicyViolation(
                violations
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; "),
            )
        })
    }

    async fn fail_login(&self, request: &LoginRequest, reason: &str) {
        if let Err(e) = self.login_throttle.record_attempt(&request.ip, false).await {
            warn!(ip = %request.ip, error = %e, "Failed to record login failure");
        }
        self.log_login(request, Some(reason)).await;
        self.count_login("failure");
        info!(username = %request.username, ip = %request.ip, reason = %reason, "Login failed");
    }

    async fn log_login(&self, request: &LoginRequest, failure: Option<&str>) {
        let now = self.clock.now();
        let user_agent = request.user_agent.as_deref();
        let log = match failure {
            None => LoginLog::success(&request.username, &request.ip, user_agent, now),
            Some(reason) => {
                LoginLog::failure(&request.username, &request.ip, user_agent, reason, now)
            }
        };
        self.record(AuditEvent::LoginAttempt(log)).await;
    }

    async fn log_action(
        &self,
        username: &str,
        action: &str,
        resource: Option<&str>,
        ip: Option<&str>,
    ) {
        self.record(AuditEvent::Action(ActionLog {
            username: username.to_string(),
            action: action.to_string(),
            resource: resource.map(str::to_string),
            ip_address: ip.map(str::to_string),
            timestamp: self.clock.now(),
        }))
        .await;
    }

    async fn record(&self, event: AuditEvent) {
        if let Err(e) = self.db.record_event(&event).await {
            warn!(kind = event.kind(), error = %e, "Failed to write audit event");
        }
    }

    fn count_login(&self, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_login(outcome);
        }
    }
}

fn random_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Usernames are 1-64 characters of ASCII letters, digits, `.`, `_`, `-` or `@`
pub fn validate_username(username: &str) -> Result<(), AuthError> {
    if username.is_empty() || username.len() > MAX_USERNAME_LEN {
        return Err(AuthError::MalformedInput(format!(
            "username must be 1-{} characters",
            MAX_USERNAME_LEN
        )));
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '@'))
    {
        return Err(AuthError::MalformedInput(format!(
            "username '{}' contains invalid characters",
            username
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::totp;
    use crate::clock::ManualClock;
    use crate::database::{CredentialStore, SqliteDatabase};
    use crate::store::MemoryStore;

    const IP: &str = "192.168.1.100";
    const BROWSER: &str = "Mozilla/5.0 (X11; Linux x86_64) Firefox/128.0";

    struct Harness {
        clock: Arc<ManualClock>,
        db: Arc<SqliteDatabase>,
        manager: AuthManager<SqliteDatabase>,
    }

    async fn create_test_manager(config: AuthConfig) -> Harness {
        let clock = Arc::new(ManualClock::at_unix(1_700_000_040));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let db = Arc::new(SqliteDatabase::in_memory().await.unwrap());
        let manager = AuthManager::new(db.clone(), store, clock.clone(), config).unwrap();
        Harness { clock, db, manager }
    }

    fn test_config() -> AuthConfig {
        AuthConfig {
            token: TokenConfig {
                secret_key: "test-secret".to_string(),
                ..Default::default()
            },
            password_iterations: 1_000,
            ..Default::default()
        }
    }

    fn login_request(username: &str, password: &str) -> LoginRequest {
        LoginRequest {
            username: username.to_string(),
            password: password.to_string(),
            second_factor_code: None,
            ip: IP.to_string(),
            user_agent: Some(BROWSER.to_string()),
        }
    }

    // Test 1: login succeeds and the token authenticates
    #[tokio::test]
    async fn test_login_and_authenticate() {
        let h = create_test_manager(test_config()).await;
        h.manager
            .create_user("alice", "Passw0rd", Role::Admin)
            .await
            .unwrap();

        let outcome = h
            .manager
            .login(login_request("alice", "Passw0rd"))
            .await
            .unwrap();
        assert_eq!(outcome.principal.username, "alice");
        assert_eq!(outcome.evicted_sessions, 0);

        let claims = h.manager.verify_token(&outcome.token).unwrap();
        assert_eq!(claims.subject(), Some("alice"));
        assert_eq!(claims.get_str("role"), Some("admin"));
        assert!(claims.get_str("jti").is_some());

        let principal = h.manager.authenticate(&outcome.token).await.unwrap();
        assert_eq!(principal.role, Role::Admin);

        let logins = h.manager.recent_logins(Some("alice"), 10).await.unwrap();
        assert_eq!(logins.len(), 1);
        assert!(logins[0].success);
    }

    // Test 2: unknown user and wrong password fail identically
    #[tokio::test]
    async fn test_login_failures_are_uniform() {
        let h = create_test_manager(test_config()).await;
        h.manager
            .create_user("alice", "Passw0rd", Role::User)
            .await
            .unwrap();

        let wrong = h.manager.login(login_request("alice", "nope")).await;
        let unknown = h.manager.login(login_request("mallory", "nope")).await;
        assert_eq!(wrong, Err(AuthError::AuthenticationFailed));
        assert_eq!(unknown, Err(AuthError::AuthenticationFailed));

        let logins = h.manager.recent_logins(None, 10).await.unwrap();
        assert_eq!(logins.len(), 2);
        assert!(logins
            .iter()
            .all(|l| l.failure_reason.as_deref() == Some("invalid_credentials")));
    }

    // Test 3: repeated failures block the IP, even for the right password
    #[tokio::test]
    async fn test_login_throttled() {
        let h = create_test_manager(test_config()).await;
        h.manager
            .create_user("alice", "Passw0rd", Role::User)
            .await
            .unwrap();

        for _ in 0..5 {
            let _ = h.manager.login(login_request("alice", "wrong")).await;
        }

        let result = h.manager.login(login_request("alice", "Passw0rd")).await;
        assert!(matches!(result, Err(AuthError::Blocked { .. })));

        h.clock.advance(chrono::Duration::seconds(901));
        assert!(h.manager.login(login_request("alice", "Passw0rd")).await.is_ok());
    }

    // Test 4: second factor required only after the password matched
    #[tokio::test]
    async fn test_login_with_second_factor() {
        let h = create_test_manager(test_config()).await;
        h.manager
            .create_user("alice", "Passw0rd", Role::User)
            .await
            .unwrap();
        let enrollment = h.manager.setup_second_factor("alice").await.unwrap();
        let now = h.clock.unix_secs();
        let code = totp::compute_code(&enrollment.secret, now).unwrap();
        h.manager.enable_second_factor("alice", &code).await.unwrap();

        assert_eq!(
            h.manager.login(login_request("alice", "wrong")).await,
            Err(AuthError::AuthenticationFailed)
        );
        assert_eq!(
            h.manager.login(login_request("alice", "Passw0rd")).await,
            Err(AuthError::SecondFactorRequired)
        );

        let mut request = login_request("alice", "Passw0rd");
        request.second_factor_code = Some("not-a-code".to_string());
        assert_eq!(
            h.manager.login(request.clone()).await,
            Err(AuthError::AuthenticationFailed)
        );

        request.second_factor_code = Some(code);
        assert!(h.manager.login(request.clone()).await.is_ok());

        request.second_factor_code = Some(enrollment.backup_codes[0].to_lowercase());
        assert!(h.manager.login(request).await.is_ok());
    }

    // Test 5: logout ends the session
    #[tokio::test]
    async fn test_logout() {
        let h = create_test_manager(test_config()).await;
        h.manager
            .create_user("alice", "Passw0rd", Role::User)
            .await
            .unwrap();
        let outcome = h
            .manager
            .login(login_request("alice", "Passw0rd"))
            .await
            .unwrap();

        assert!(h.manager.logout(&outcome.token).await.unwrap());
        assert_eq!(
            h.manager.authenticate(&outcome.token).await,
            Err(AuthError::InvalidToken)
        );
        assert!(!h.manager.logout(&outcome.token).await.unwrap());
    }

    // Test 6: deactivated accounts cannot authenticate with live sessions
    #[tokio::test]
    async fn test_authenticate_inactive_user() {
        let h = create_test_manager(test_config()).await;
        h.manager
            .create_user("alice", "Passw0rd", Role::User)
            .await
            .unwrap();
        let outcome = h
            .manager
            .login(login_request("alice", "Passw0rd"))
            .await
            .unwrap();

        let mut credential = h.db.get_credential("alice").await.unwrap().unwrap();
        credential.is_active = false;
        h.db.upsert_credential(&credential).await.unwrap();

        assert_eq!(
            h.manager.authenticate(&outcome.token).await,
            Err(AuthError::InvalidToken)
        );
        assert_eq!(
            h.manager.login(login_request("alice", "Passw0rd")).await,
            Err(AuthError::AuthenticationFailed)
        );
    }

    // Test 7: create_user enforces username rules, policy and uniqueness
    #[tokio::test]
    async fn test_create_user_validation() {
        let h = create_test_manager(test_config()).await;

        assert!(matches!(
            h.manager.create_user("", "Passw0rd", Role::User).await,
            Err(AuthError::MalformedInput(_))
        ));
        assert!(matches!(
            h.manager.create_user("bad name", "Passw0rd", Role::User).await,
            Err(AuthError::MalformedInput(_))
        ));
        match h.manager.create_user("bob", "short", Role::User).await {
            Err(AuthError::PolicyViolation(msg)) => assert!(msg.contains("at least 8")),
            other => panic!("expected policy violation, got {:?}", other),
        }

        h.manager
            .create_user("bob", "Passw0rd", Role::User)
            .await
            .unwrap();
        assert!(matches!(
            h.manager.create_user("bob", "Passw0rd", Role::User).await,
            Err(AuthError::MalformedInput(_))
        ));
    }

    // Test 8: change_password keeps the current session only
    #[tokio::test]
    async fn test_change_password() {
        let h = create_test_manager(test_config()).await;
        h.manager
            .create_user("alice", "Passw0rd", Role::User)
            .await
            .unwrap();
        let first = h
            .manager
            .login(login_request("alice", "Passw0rd"))
            .await
            .unwrap();
        let second = h
            .manager
            .login(login_request("alice", "Passw0rd"))
            .await
            .unwrap();

        assert_eq!(
            h.manager
                .change_password("alice", "wrong", "N3wPassword", None)
                .await,
            Err(AuthError::AuthenticationFailed)
        );
        assert!(matches!(
            h.manager
                .change_password("alice", "Passw0rd", "weak", None)
                .await,
            Err(AuthError::PolicyViolation(_))
        ));

        h.manager
            .change_password("alice", "Passw0rd", "N3wPassword", Some(&second.token))
            .await
            .unwrap();

        assert!(h.manager.authenticate(&first.token).await.is_err());
        assert!(h.manager.authenticate(&second.token).await.is_ok());
        assert!(h.manager.login(login_request("alice", "N3wPassword")).await.is_ok());
    }

    // Test 9: reset_password revokes every session
    #[tokio::test]
    async fn test_reset_password() {
        let h = create_test_manager(test_config()).await;
        h.manager
            .create_user("alice", "Passw0rd", Role::User)
            .await
            .unwrap();
        let outcome = h
            .manager
            .login(login_request("alice", "Passw0rd"))
            .await
            .unwrap();

        h.manager
            .reset_password("admin", "alice", "Res3tPassword")
            .await
            .unwrap();
        assert!(h.manager.authenticate(&outcome.token).await.is_err());
        assert!(h.manager.login(login_request("alice", "Res3tPassword")).await.is_ok());

        assert!(matches!(
            h.manager
                .reset_password("admin", "ghost", "Res3tPassword")
                .await,
            Err(AuthError::MalformedInput(_))
        ));

        let actions = h.manager.audit_logs(Some("admin"), None, 10).await.unwrap();
        assert_eq!(actions[0].action, "reset_password");
        assert_eq!(actions[0].resource.as_deref(), Some("alice"));
    }

    // Test 10: screen_request blocks crawlers and rejects later requests
    #[tokio::test]
    async fn test_screen_request() {
        let h = create_test_manager(test_config()).await;

        assert!(h
            .manager
            .screen_request(IP, Some(BROWSER), "/api/records")
            .await
            .is_ok());

        assert_eq!(
            h.manager
                .screen_request("10.0.0.9", Some("curl/8.5.0"), "/api/records")
                .await,
            Err(AuthError::Blocked {
                retry_after_secs: 3600
            })
        );
        assert!(matches!(
            h.manager
                .screen_request("10.0.0.9", Some(BROWSER), "/api/records")
                .await,
            Err(AuthError::Blocked { .. })
        ));

        let block = h.db.blocked_ip("10.0.0.9").await.unwrap().unwrap();
        assert!(block.reason.contains("curl"));

        assert!(h.manager.unblock_ip("10.0.0.9").await.unwrap());
        assert!(h
            .manager
            .screen_request("10.0.0.9", Some(BROWSER), "/")
            .await
            .is_ok());
    }

    // Test 11: crawler classification can be switched off
    #[tokio::test]
    async fn test_screen_request_crawler_disabled() {
        let h = create_test_manager(AuthConfig {
            crawler_enabled: false,
            ..test_config()
        })
        .await;

        assert!(h
            .manager
            .screen_request(IP, None, "/api/records?per_page=1000")
            .await
            .is_ok());
        assert!(h.manager.classify_crawler(None, "/", IP).is_bot());
    }

    // Test 12: screen_request enforces the quota
    #[tokio::test]
    async fn test_screen_request_rate_limited() {
        let h = create_test_manager(AuthConfig {
            rate_limit: RateLimitConfig {
                max_requests: 2,
                ..Default::default()
            },
            ..test_config()
        })
        .await;

        assert_eq!(h.manager.screen_request(IP, Some(BROWSER), "/").await, Ok(1));
        assert_eq!(h.manager.screen_request(IP, Some(BROWSER), "/").await, Ok(0));
        assert!(matches!(
            h.manager.screen_request(IP, Some(BROWSER), "/").await,
            Err(AuthError::RateLimited { .. })
        ));

        let status = h.manager.rate_limit_status(IP).await.unwrap();
        assert!(status.is_blocked);
    }

    // Test 13: username validation
    #[test]
    fn test_validate_username() {
        assert!(validate_username("alice").is_ok());
        assert!(validate_username("a.b-c_d@example.com").is_ok());
        assert!(validate_username("").is_err());
        assert!(validate_username("has space").is_err());
        assert!(validate_username(&"x".repeat(65)).is_err());
    }

    // Test 14: list_users returns every account without password hashes
    #[tokio::test]
    async fn test_list_users() {
        let h = create_test_manager(test_config()).await;
        h.manager
            .create_user("alice", "Passw0rd", Role::User)
            .await
            .unwrap();
        h.clock.advance(chrono::Duration::seconds(1));
        h.manager
            .create_user("root", "Passw0rd", Role::Admin)
            .await
            .unwrap();

        let users = h.manager.list_users().await.unwrap();
        let names: Vec<&str> = users.iter().map(|u| u.username.as_str()).collect();
        assert_eq!(names, vec!["alice", "root"]);
        assert_eq!(users[1].role, Role::Admin);

        let encoded = serde_json::to_string(&users).unwrap();
        assert!(!encoded.contains("password_hash"));
    }

    // Test 15: ensure_admin_user creates, repairs and leaves a correct admin alone
    #[tokio::test]
    async fn test_ensure_admin_user() {
        let h = create_test_manager(test_config()).await;

        assert!(h.manager.ensure_admin_user("admin", None).await.unwrap().is_none());
        assert!(h.manager.list_users().await.unwrap().is_empty());

        let principal = h
            .manager
            .ensure_admin_user("admin", Some("Adm1nPassword"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(principal.role, Role::Admin);
        let outcome = h
            .manager
            .login(login_request("admin", "Adm1nPassword"))
            .await
            .unwrap();

        // Same password: the session survives
        h.manager
            .ensure_admin_user("admin", Some("Adm1nPassword"))
            .await
            .unwrap();
        assert!(h.manager.authenticate(&outcome.token).await.is_ok());

        // New password: old sessions end, creation time is kept
        let created_at = h.db.get_credential("admin").await.unwrap().unwrap().created_at;
        h.clock.advance(chrono::Duration::minutes(1));
        h.manager
            .ensure_admin_user("admin", Some("R0tatedPassword"))
            .await
            .unwrap();
        assert!(h.manager.authenticate(&outcome.token).await.is_err());
        let stored = h.db.get_credential("admin").await.unwrap().unwrap();
        assert_eq!(stored.created_at, created_at);
        assert_eq!(stored.updated_at, h.clock.now());
        assert!(h.manager.login(login_request("admin", "R0tatedPassword")).await.is_ok());

        assert!(matches!(
            h.manager.ensure_admin_user("admin", Some("short")).await,
            Err(AuthError::PolicyViolation(_))
        ));

        let logs = h
            .manager
            .audit_logs(None, Some("ensure_admin"), 10)
            .await
            .unwrap();
        assert_eq!(logs.len(), 2);
    }

    // Test 16: audit_logs filters by actor and action
    #[tokio::test]
    async fn test_audit_logs_filters() {
        let h = create_test_manager(test_config()).await;
        h.manager
            .create_user("alice", "Passw0rd", Role::User)
            .await
            .unwrap();
        h.clock.advance(chrono::Duration::seconds(1));
        h.manager
            .reset_password("root", "alice", "Res3tPassword")
            .await
            .unwrap();

        let all = h.manager.audit_logs(None, None, 10).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].action, "reset_password");

        let by_alice = h.manager.audit_logs(Some("alice"), None, 10).await.unwrap();
        assert_eq!(by_alice.len(), 1);
        assert_eq!(by_alice[0].action, "create_user");

        assert!(h
            .manager
            .audit_logs(Some("root"), Some("create_user"), 10)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(h.manager.audit_logs(None, None, 1).await.unwrap().len(), 1);
    }
}
