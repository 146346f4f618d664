//! Second-factor (TOTP) domain models

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a user's second factor
///
/// `setup` moves any state to `Pending`; a correct code moves `Pending` to
/// `Active`; `disable` moves to `Disabled`, which must run `setup` again
/// before it can be re-enabled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SecondFactorState {
    /// Never set up
    #[default]
    Unconfigured,

    /// Secret issued, waiting for the first correct code
    Pending {
        secret: String,
        backup_codes: BTreeSet<String>,
    },

    /// Confirmed and accepting codes
    Active {
        secret: String,
        backup_codes: BTreeSet<String>,
    },

    /// Turned off; secret and backup codes discarded
    Disabled,
}

impl SecondFactorState {
    /// Storage label
    pub fn as_str(&self) -> &'static str {
        match self {
            SecondFactorState::Unconfigured => "unconfigured",
            SecondFactorState::Pending { .. } => "pending",
            SecondFactorState::Active { .. } => "active",
            SecondFactorState::Disabled => "disabled",
        }
    }

    /// Secret, if one is currently issued
    pub fn secret(&self) -> Option<&str> {
        match self {
            SecondFactorState::Pending { secret, .. } | SecondFactorState::Active { secret, .. } => {
                Some(secret)
            }
            _ => None,
        }
    }

    /// Backup codes, if a secret is currently issued
    pub fn backup_codes(&self) -> Option<&BTreeSet<String>> {
        match self {
            SecondFactorState::Pending { backup_codes, .. }
            | SecondFactorState::Active { backup_codes, .. } => Some(backup_codes),
            _ => None,
        }
    }

    /// Check if codes are currently accepted
    pub fn is_active(&self) -> bool {
        matches!(self, SecondFactorState::Active { .. })
    }
}

/// A user's stored second-factor profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecondFactorProfile {
    /// Owner
    pub username: String,

    /// Current lifecycle state
    pub state: SecondFactorState,

    /// When the current secret was issued
    pub created_at: Option<DateTime<Utc>>,

    /// Last accepted code (TOTP or backup)
    pub last_used_at: Option<DateTime<Utc>>,
}

impl SecondFactorProfile {
    /// Profile for a user who never set anything up
    pub fn unconfigured(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            state: SecondFactorState::Unconfigured,
            created_at: None,
            last_used_at: None,
        }
    }
}

/// Result of `setup`: shown to the user once
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecondFactorEnrollment {
    /// Base32 secret (unpadded)
    pub secret: String,

    /// `otpauth://` URI for authenticator apps
    pub provisioning_uri: String,

    /// Single-use recovery codes
    pub backup_codes: Vec<String>,
}

/// Diagnostic snapshot of a user's second factor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecondFactorStatus {
    /// A secret has been issued (pending or active)
    pub configured: bool,

    /// Codes are currently accepted
    pub enabled: bool,

    /// When the current secret was issued
    pub created_at: Option<DateTime<Utc>>,

    /// Last accepted code
    pub last_used_at: Option<DateTime<Utc>>,

    /// Unused backup codes
    pub backup_codes_remaining: usize,
}

impl From<&SecondFactorProfile> for SecondFactorStatus {
    fn from(profile: &SecondFactorProfile) -> Self {
        Self {
            configured: profile.state.secret().is_some(),
            enabled: profile.state.is_active(),
            created_at: profile.created_at,
            last_used_at: profile.last_used_at,
            backup_codes_remaining: profile.state.backup_codes().map_or(0, BTreeSet::len),
        }
    }
}
