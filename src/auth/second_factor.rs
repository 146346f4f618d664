//! Second-factor lifecycle
//!
//! Owns the `Unconfigured → Pending → Active → Disabled` state machine on top
//! of a [`SecondFactorRepository`]. Code arithmetic lives in [`super::totp`].

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::totp;
use crate::clock::Clock;
use crate::database::SecondFactorRepository;
use crate::error::AuthError;
use crate::models::{
    SecondFactorEnrollment, SecondFactorProfile, SecondFactorState, SecondFactorStatus,
};

/// Default issuer shown in authenticator apps
pub const DEFAULT_ISSUER: &str = "Gatekeeper";

const MAX_TRANSITION_ATTEMPTS: usize = 5;

/// Second factor configuration
#[derive(Debug, Clone)]
pub struct SecondFactorConfig {
    /// Issuer label in the provisioning URI
    pub issuer: String,

    /// Accepted steps either side of now
    pub window: u32,

    /// Backup codes issued per setup/regeneration
    pub backup_code_count: usize,

    /// Secret size in bytes
    pub secret_bytes: usize,
}

impl Default for SecondFactorConfig {
    fn default() -> Self {
        Self {
            issuer: DEFAULT_ISSUER.to_string(),
            window: 1,
            backup_code_count: 10,
            secret_bytes: totp::DEFAULT_SECRET_BYTES,
        }
    }
}

/// TOTP second factor with single-use backup codes
pub struct SecondFactorService {
    config: SecondFactorConfig,
    repository: Arc<dyn SecondFactorRepository>,
    clock: Arc<dyn Clock>,
}

impl SecondFactorService {
    /// Create a new second factor service
    pub fn new(
        config: SecondFactorConfig,
        repository: Arc<dyn SecondFactorRepository>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            repository,
            clock,
        }
    }

    async fn load(&self, username: &str) -> Result<SecondFactorProfile, AuthError> {
        Ok(self
            .repository
            .get_second_factor(username)
            .await?
            .unwrap_or_else(|| SecondFactorProfile::unconfigured(username)))
    }

    /// Issue a fresh secret and backup codes; the profile becomes pending
    ///
    /// Any previous secret stops working immediately.
    pub async fn setup(&self, username: &str) -> Result<SecondFactorEnrollment, AuthError> {
        if username.trim().is_empty() {
            return Err(AuthError::MalformedInput("username is empty".to_string()));
        }

        let previous = self.load(username).await?;
        let secret = totp::generate_secret(self.config.secret_bytes);
        let backup_codes = totp::generate_backup_codes(self.config.backup_code_count);

        let profile = SecondFactorProfile {
            username: username.to_string(),
            state: SecondFactorState::Pending {
                secret: secret.clone(),
                backup_codes: backup_codes.clone(),
            },
            created_at: Some(self.clock.now()),
            last_used_at: previous.last_used_at,
        };
        self.repository.save_second_factor(&profile).await?;

        info!(
            username = %username,
            previous_state = previous.state.as_str(),
            "Second factor setup started"
        );

        Ok(SecondFactorEnrollment {
            provisioning_uri: totp::provisioning_uri(&self.config.issuer, username, &secret),
            secret,
            backup_codes: backup_codes.into_iter().collect(),
        })
    }

    /// Confirm a pending secret with a current code
    ///
    /// State is untouched when the code is wrong. The code is checked
    /// against whatever secret is pending when the write lands, so a
    /// concurrent `setup` wins over a confirmation of the old secret.
    pub async fn enable(&self, username: &str, code: &str) -> Result<(), AuthError> {
        let code = code.trim();
        let changed = self
            .transition(username, |profile| {
                let (secret, backup_codes) = match &profile.state {
                    SecondFactorState::Pending {
                        secret,
                        backup_codes,
                    } => (secret.clone(), backup_codes.clone()),
                    SecondFactorState::Active { .. } => return Ok(None),
                    SecondFactorState::Unconfigured | SecondFactorState::Disabled => {
                        return Err(AuthError::NotConfigured)
                    }
                };

                if !totp::verify_code(&secret, code, self.clock.unix_secs(), self.config.window) {
                    info!(username = %username, "Second factor confirmation code rejected");
                    return Err(AuthError::AuthenticationFailed);
                }

                Ok(Some(SecondFactorProfile {
                    state: SecondFactorState::Active {
                        secret,
                        backup_codes,
                    },
                    last_used_at: Some(self.clock.now()),
                    ..profile.clone()
                }))
            })
            .await?;

        if changed {
            info!(username = %username, "Second factor enabled");
        } else {
            debug!(username = %username, "Second factor already active");
        }
        Ok(())
    }

    /// Turn the second factor off; codes stop being accepted immediately
    pub async fn disable(&self, username: &str) -> Result<(), AuthError> {
        let changed = self
            .transition(username, |profile| match profile.state {
                SecondFactorState::Unconfigured => Err(AuthError::NotConfigured),
                SecondFactorState::Disabled => Ok(None),
                _ => Ok(Some(SecondFactorProfile {
                    state: SecondFactorState::Disabled,
                    ..profile.clone()
                })),
            })
            .await?;

        if changed {
            info!(username = %username, "Second factor disabled");
        }
        Ok(())
    }

    /// Apply `next` to the stored profile with a conditional write
    ///
    /// `next` returns `None` when no write is needed. A lost race reloads
    /// and re-evaluates, so every write is based on the state it replaces.
    /// Returns whether a write happened.
    async fn transition<F>(&self, username: &str, mut next: F) -> Result<bool, AuthError>
    where
        F: FnMut(&SecondFactorProfile) -> Result<Option<SecondFactorProfile>, AuthError>,
    {
        for _ in 0..MAX_TRANSITION_ATTEMPTS {
            let current = self.load(username).await?;
            let Some(updated) = next(&current)? else {
                return Ok(false);
            };
            if self
                .repository
                .replace_second_factor(&current.state, &updated)
                .await?
            {
                return Ok(true);
            }
            debug!(username = %username, "Second factor changed concurrently, retrying");
        }

        warn!(username = %username, "Second factor update kept losing to concurrent writers");
        Err(AuthError::Unavailable(
            "second factor is being modified concurrently".to_string(),
        ))
    }

    /// Check a login code: live TOTP first, then a single-use backup code
    ///
    /// Returns `Ok(false)` for a wrong code, `NotConfigured` when the profile
    /// is not active, and `Exhausted` when a backup code is presented but
    /// none remain.
    pub async fn verify_user_code(&self, username: &str, code: &str) -> Result<bool, AuthError> {
        let profile = self.load(username).await?;
        let SecondFactorState::Active {
            secret,
            backup_codes,
        } = &profile.state
        else {
            return Err(AuthError::NotConfigured);
        };

        let code = code.trim();
        let now = self.clock.now();

        if totp::verify_code(secret, code, now.timestamp(), self.config.window) {
            self.repository
                .record_second_factor_use(username, now)
                .await?;
            debug!(username = %username, "TOTP code accepted");
            return Ok(true);
        }

        if code.len() == totp::BACKUP_CODE_LEN {
            let normalized = code.to_ascii_uppercase();
            if self
                .repository
                .consume_backup_code(username, &normalized, now)
                .await?
            {
                info!(
                    username = %username,
                    remaining = backup_codes.len().saturating_sub(1),
                    "Backup code consumed"
                );
                return Ok(true);
            }
            if backup_codes.is_empty() {
                return Err(AuthError::Exhausted);
            }
        }

        Ok(false)
    }

    /// Replace the backup codes of a pending or active profile
    ///
    /// No second-factor proof is requested.
    pub async fn regenerate_backup_codes(&self, username: &str) -> Result<Vec<String>, AuthError> {
        let fresh = totp::generate_backup_codes(self.config.backup_code_count);

        self.transition(username, |profile| {
            let state = match &profile.state {
                SecondFactorState::Pending { secret, .. } => SecondFactorState::Pending {
                    secret: secret.clone(),
                    backup_codes: fresh.clone(),
                },
                SecondFactorState::Active { secret, .. } => SecondFactorState::Active {
                    secret: secret.clone(),
                    backup_codes: fresh.clone(),
                },
                SecondFactorState::Unconfigured | SecondFactorState::Disabled => {
                    return Err(AuthError::NotConfigured)
                }
            };
            Ok(Some(SecondFactorProfile {
                state,
                ..profile.clone()
            }))
        })
        .await?;

        warn!(
            username = %username,
            "Backup codes regenerated without second-factor proof"
        );
        Ok(fresh.into_iter().collect())
    }

    /// Diagnostic snapshot
    pub async fn status(&self, username: &str) -> Result<SecondFactorStatus, AuthError> {
        Ok(SecondFactorStatus::from(&self.load(username).await?))
    }

    /// True when codes are required at login
    pub async fn is_enabled(&self, username: &str) -> Result<bool, AuthError> {
        Ok(self.load(username).await?.state.is_active())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::database::SqliteDatabase;
    use crate::error::DbError;
    use async_trait::async_trait;
    use chrono::{DateTime, Duration, Utc};
    use std::sync::Mutex;

    async fn create_service() -> (Arc<ManualClock>, SecondFactorService) {
        let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
        let db = Arc::new(SqliteDatabase::in_memory().await.unwrap());
        let service = SecondFactorService::new(SecondFactorConfig::default(), db, clock.clone());
        (clock, service)
    }

    fn current_code(clock: &ManualClock, secret: &str) -> String {
        totp::compute_code(secret, clock.unix_secs()).unwrap()
    }

    // Test 1: setup returns a pending enrollment
    #[tokio::test]
    async fn test_setup_is_pending() {
        let (_, service) = create_service().await;
        let enrollment = service.setup("alice").await.unwrap();

        assert_eq!(enrollment.backup_codes.len(), 10);
        assert!(enrollment
            .provisioning_uri
            .starts_with("otpauth://totp/Gatekeeper:alice?secret="));

        let status = service.status("alice").await.unwrap();
        assert!(status.configured);
        assert!(!status.enabled);
        assert_eq!(status.backup_codes_remaining, 10);
        assert!(!service.is_enabled("alice").await.unwrap());
    }

    // Test 2: enable only flips state on a correct code
    #[tokio::test]
    async fn test_enable_requires_valid_code() {
        let (clock, service) = create_service().await;
        let enrollment = service.setup("alice").await.unwrap();

        let wrong = if current_code(&clock, &enrollment.secret) == "000000" {
            "111111"
        } else {
            "000000"
        };
        assert_eq!(
            service.enable("alice", wrong).await,
            Err(AuthError::AuthenticationFailed)
        );
        assert!(!service.is_enabled("alice").await.unwrap());

        let code = current_code(&clock, &enrollment.secret);
        service.enable("alice", &code).await.unwrap();
        assert!(service.is_enabled("alice").await.unwrap());
    }

    // Test 3: enabling without setup is NotConfigured
    #[tokio::test]
    async fn test_enable_unconfigured() {
        let (_, service) = create_service().await;
        assert_eq!(
            service.enable("nobody", "123456").await,
            Err(AuthError::NotConfigured)
        );
        assert_eq!(
            service.verify_user_code("nobody", "123456").await,
            Err(AuthError::NotConfigured)
        );
    }

    // Test 4: re-running setup invalidates the previous secret
    #[tokio::test]
    async fn test_setup_replaces_secret() {
        let (clock, service) = create_service().await;
        let first = service.setup("alice").await.unwrap();
        let second = service.setup("alice").await.unwrap();
        assert_ne!(first.secret, second.secret);

        let old_code = current_code(&clock, &first.secret);
        let new_code = current_code(&clock, &second.secret);
        if old_code != new_code {
            assert!(service.enable("alice", &old_code).await.is_err());
        }
        service.enable("alice", &new_code).await.unwrap();
    }

    // Test 5: verify accepts the live code within the window
    #[tokio::test]
    async fn test_verify_user_code_totp() {
        let (clock, service) = create_service().await;
        let enrollment = service.setup("alice").await.unwrap();
        service
            .enable("alice", &current_code(&clock, &enrollment.secret))
            .await
            .unwrap();

        clock.advance(Duration::seconds(120));
        let code = current_code(&clock, &enrollment.secret);
        clock.advance(Duration::seconds(30));
        assert!(service.verify_user_code("alice", &code).await.unwrap());

        clock.advance(Duration::seconds(60));
        assert!(!service.verify_user_code("alice", &code).await.unwrap());

        let status = service.status("alice").await.unwrap();
        assert!(status.last_used_at.is_some());
    }

    // Test 6: a backup code works exactly once
    #[tokio::test]
    async fn test_backup_code_single_use() {
        let (clock, service) = create_service().await;
        let enrollment = service.setup("alice").await.unwrap();
        service
            .enable("alice", &current_code(&clock, &enrollment.secret))
            .await
            .unwrap();

        let backup = enrollment.backup_codes[0].clone();
        assert!(service.verify_user_code("alice", &backup).await.unwrap());
        assert!(!service.verify_user_code("alice", &backup).await.unwrap());

        let status = service.status("alice").await.unwrap();
        assert_eq!(status.backup_codes_remaining, 9);
    }

    // Test 7: backup codes are case-insensitive on input
    #[tokio::test]
    async fn test_backup_code_lowercase() {
        let (clock, service) = create_service().await;
        let enrollment = service.setup("alice").await.unwrap();
        service
            .enable("alice", &current_code(&clock, &enrollment.secret))
            .await
            .unwrap();

        let backup = enrollment.backup_codes[3].to_lowercase();
        assert!(service.verify_user_code("alice", &backup).await.unwrap());
    }

    // Test 8: presenting a backup code after all are used is Exhausted
    #[tokio::test]
    async fn test_backup_codes_exhausted() {
        let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
        let db = Arc::new(SqliteDatabase::in_memory().await.unwrap());
        let service = SecondFactorService::new(
            SecondFactorConfig {
                backup_code_count: 1,
                ..Default::default()
            },
            db,
            clock.clone(),
        );

        let enrollment = service.setup("alice").await.unwrap();
        service
            .enable("alice", &current_code(&clock, &enrollment.secret))
            .await
            .unwrap();

        let only = enrollment.backup_codes[0].clone();
        assert!(service.verify_user_code("alice", &only).await.unwrap());
        assert_eq!(
            service.verify_user_code("alice", &only).await,
            Err(AuthError::Exhausted)
        );
    }

    // Test 9: disable stops codes and requires a new setup
    #[tokio::test]
    async fn test_disable() {
        let (clock, service) = create_service().await;
        let enrollment = service.setup("alice").await.unwrap();
        let code = current_code(&clock, &enrollment.secret);
        service.enable("alice", &code).await.unwrap();

        service.disable("alice").await.unwrap();
        assert!(!service.is_enabled("alice").await.unwrap());
        assert_eq!(
            service.verify_user_code("alice", &code).await,
            Err(AuthError::NotConfigured)
        );
        assert_eq!(
            service.enable("alice", &code).await,
            Err(AuthError::NotConfigured)
        );
        assert_eq!(service.disable("bob").await, Err(AuthError::NotConfigured));
    }

    // Test 10: regeneration replaces the whole backup set
    #[tokio::test]
    async fn test_regenerate_backup_codes() {
        let (clock, service) = create_service().await;
        let enrollment = service.setup("alice").await.unwrap();
        service
            .enable("alice", &current_code(&clock, &enrollment.secret))
            .await
            .unwrap();

        let fresh = service.regenerate_backup_codes("alice").await.unwrap();
        assert_eq!(fresh.len(), 10);

        let old = enrollment.backup_codes[0].clone();
        if !fresh.contains(&old) {
            assert!(!service.verify_user_code("alice", &old).await.unwrap());
        }
        assert!(service.verify_user_code("alice", &fresh[0]).await.unwrap());
        assert_eq!(
            service.regenerate_backup_codes("nobody").await,
            Err(AuthError::NotConfigured)
        );
    }

    // Test 11: empty usernames are rejected
    #[tokio::test]
    async fn test_setup_empty_username() {
        let (_, service) = create_service().await;
        assert!(matches!(
            service.setup("  ").await,
            Err(AuthError::MalformedInput(_))
        ));
    }
    /// Repository that lets another writer land right after the next read
    struct InterleavedRepository {
        inner: SqliteDatabase,
        interloper: Mutex<Option<SecondFactorProfile>>,
    }

    impl InterleavedRepository {
        fn arm(&self, profile: SecondFactorProfile) {
            *self.interloper.lock().unwrap() = Some(profile);
        }
    }

    #[async_trait]
    impl SecondFactorRepository for InterleavedRepository {
        async fn get_second_factor(
            &self,
            username: &str,
        ) -> Result<Option<SecondFactorProfile>, DbError> {
            let loaded = self.inner.get_second_factor(username).await?;
            let interloper = self.interloper.lock().unwrap().take();
            if let Some(profile) = interloper {
                self.inner.save_second_factor(&profile).await?;
            }
            Ok(loaded)
        }

        async fn save_second_factor(&self, profile: &SecondFactorProfile) -> Result<(), DbError> {
            self.inner.save_second_factor(profile).await
        }

        async fn replace_second_factor(
            &self,
            expected: &SecondFactorState,
            profile: &SecondFactorProfile,
        ) -> Result<bool, DbError> {
            self.inner.replace_second_factor(expected, profile).await
        }

        async fn consume_backup_code(
            &self,
            username: &str,
            code: &str,
            at: DateTime<Utc>,
        ) -> Result<bool, DbError> {
            self.inner.consume_backup_code(username, code, at).await
        }

        async fn record_second_factor_use(
            &self,
            username: &str,
            at: DateTime<Utc>,
        ) -> Result<(), DbError> {
            self.inner.record_second_factor_use(username, at).await
        }
    }

    async fn create_interleaved_service() -> (
        Arc<ManualClock>,
        Arc<InterleavedRepository>,
        SecondFactorService,
    ) {
        let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
        let repository = Arc::new(InterleavedRepository {
            inner: SqliteDatabase::in_memory().await.unwrap(),
            interloper: Mutex::new(None),
        });
        let service = SecondFactorService::new(
            SecondFactorConfig::default(),
            repository.clone(),
            clock.clone(),
        );
        (clock, repository, service)
    }

    // Test 12: a setup landing mid-enable keeps the new secret pending
    #[tokio::test]
    async fn test_enable_loses_to_concurrent_setup() {
        let (clock, repository, service) = create_interleaved_service().await;
        let first = service.setup("alice").await.unwrap();

        let new_secret = totp::generate_secret(20);
        repository.arm(SecondFactorProfile {
            username: "alice".to_string(),
            state: SecondFactorState::Pending {
                secret: new_secret.clone(),
                backup_codes: totp::generate_backup_codes(10),
            },
            created_at: None,
            last_used_at: None,
        });

        let old_code = current_code(&clock, &first.secret);
        if totp::verify_code(&new_secret, &old_code, clock.unix_secs(), 1) {
            return;
        }
        assert_eq!(
            service.enable("alice", &old_code).await,
            Err(AuthError::AuthenticationFailed)
        );

        let stored = repository
            .inner
            .get_second_factor("alice")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.state.as_str(), "pending");
        assert_eq!(stored.state.secret(), Some(new_secret.as_str()));
    }

    // Test 13: a disable landing mid-regeneration is not undone
    #[tokio::test]
    async fn test_regenerate_does_not_resurrect_disabled() {
        let (clock, repository, service) = create_interleaved_service().await;
        let enrollment = service.setup("alice").await.unwrap();
        service
            .enable("alice", &current_code(&clock, &enrollment.secret))
            .await
            .unwrap();

        repository.arm(SecondFactorProfile {
            username: "alice".to_string(),
            state: SecondFactorState::Disabled,
            created_at: None,
            last_used_at: None,
        });
        assert_eq!(
            service.regenerate_backup_codes("alice").await,
            Err(AuthError::NotConfigured)
        );
        assert!(!service.is_enabled("alice").await.unwrap());
    }

    // Test 14: enable on an active profile writes nothing
    #[tokio::test]
    async fn test_enable_when_active_is_noop() {
        let (clock, repository, service) = create_interleaved_service().await;
        let enrollment = service.setup("alice").await.unwrap();
        service
            .enable("alice", &current_code(&clock, &enrollment.secret))
            .await
            .unwrap();

        let before = repository.inner.get_second_factor("alice").await.unwrap();
        clock.advance(Duration::seconds(60));
        service.enable("alice", "not-a-code").await.unwrap();
        assert_eq!(
            repository.inner.get_second_factor("alice").await.unwrap(),
            before
        );
    }
}
