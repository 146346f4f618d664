//! Password hashing and policy
//!
//! Hashes are `base64(salt ‖ key)` with a 32-byte random salt and a 32-byte
//! PBKDF2-HMAC-SHA256 key. The iteration count is not encoded, so every
//! hasher that verifies a hash must use the count that produced it.

use base64::{engine::general_purpose::STANDARD, Engine};
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

/// Production iteration count
pub const DEFAULT_ITERATIONS: u32 = 100_000;

const SALT_LEN: usize = 32;
const KEY_LEN: usize = 32;

/// Salted PBKDF2 password hasher
#[derive(Debug, Clone)]
pub struct PasswordHasher {
    iterations: u32,
}

impl Default for PasswordHasher {
    fn default() -> Self {
        Self::new(DEFAULT_ITERATIONS)
    }
}

impl PasswordHasher {
    /// Create a hasher with an explicit iteration count
    pub fn new(iterations: u32) -> Self {
        Self {
            iterations: iterations.max(1),
        }
    }

    /// Configured iteration count
    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    /// Hash a password with a fresh random salt
    pub fn hash(&self, password: &str) -> String {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);

        let key = self.derive(password, &salt);

        let mut encoded = Vec::with_capacity(SALT_LEN + KEY_LEN);
        encoded.extend_from_slice(&salt);
        encoded.extend_from_slice(&key);
        STANDARD.encode(encoded)
    }

    /// Verify a password against an encoded hash
    ///
    /// Returns `false` for any malformed hash.
    pub fn verify(&self, password: &str, encoded: &str) -> bool {
        let decoded = match STANDARD.decode(encoded) {
            Ok(bytes) => bytes,
            Err(_) => return false,
        };
        if decoded.len() != SALT_LEN + KEY_LEN {
            return false;
        }

        let (salt, expected) = decoded.split_at(SALT_LEN);
        let key = self.derive(password, salt);
        key[..].ct_eq(expected).into()
    }

    fn derive(&self, password: &str, salt: &[u8]) -> [u8; KEY_LEN] {
        let mut key = [0u8; KEY_LEN];
        pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, self.iterations, &mut key);
        key
    }
}

/// A single unmet password rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyViolation {
    /// Fewer characters than the minimum
    TooShort { min_length: usize },
    /// No uppercase letter
    MissingUppercase,
    /// No lowercase letter
    MissingLowercase,
    /// No digit
    MissingDigit,
    /// No non-alphanumeric character
    MissingSpecial,
}

impl std::fmt::Display for PolicyViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyViolation::TooShort { min_length } => {
                write!(f, "must be at least {} characters", min_length)
            }
            PolicyViolation::MissingUppercase => write!(f, "must contain an uppercase letter"),
            PolicyViolation::MissingLowercase => write!(f, "must contain a lowercase letter"),
            PolicyViolation::MissingDigit => write!(f, "must contain a digit"),
            PolicyViolation::MissingSpecial => write!(f, "must contain a special character"),
        }
    }
}

/// Password strength rules
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PasswordPolicy {
    /// Minimum length in characters
    pub min_length: usize,
    /// Require at least one uppercase letter
    pub require_uppercase: bool,
    /// Require at least one lowercase letter
    pub require_lowercase: bool,
    /// Require at least one digit
    pub require_digit: bool,
    /// Require at least one non-alphanumeric character
    pub require_special: bool,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self {
            min_length: 8,
            require_uppercase: true,
            require_lowercase: true,
            require_digit: true,
            require_special: false,
        }
    }
}

impl PasswordPolicy {
    /// Check a candidate password, reporting every unmet rule
    pub fn validate(&self, password: &str) -> Result<(), Vec<PolicyViolation>> {
        let mut violations = Vec::new();

        if password.chars().count() < self.min_length {
            violations.push(PolicyViolation::TooShort {
                min_length: self.min_length,
            });
        }
        if self.require_uppercase && !password.chars().any(char::is_uppercase) {
            violations.push(PolicyViolation::MissingUppercase);
        }
        if self.require_lowercase && !password.chars().any(char::is_lowercase) {
            violations.push(PolicyViolation::MissingLowercase);
        }
        if self.require_digit && !password.chars().any(|c| c.is_ascii_digit()) {
            violations.push(PolicyViolation::MissingDigit);
        }
        if self.require_special && !password.chars().any(|c| !c.is_alphanumeric()) {
            violations.push(PolicyViolation::MissingSpecial);
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_hasher() -> PasswordHasher {
        PasswordHasher::new(1_000)
    }

    // Test 1: hash then verify succeeds, wrong password fails
    #[test]
    fn test_hash_and_verify() {
        let hasher = fast_hasher();
        let hash = hasher.hash("Correct-Horse-9");

        assert!(hasher.verify("Correct-Horse-9", &hash));
        assert!(!hasher.verify("correct-horse-9", &hash));
        assert!(!hasher.verify("", &hash));
    }

    // Test 2: two hashes of the same password differ and both verify
    #[test]
    fn test_salt_uniqueness() {
        let hasher = fast_hasher();
        let a = hasher.hash("Passw0rd");
        let b = hasher.hash("Passw0rd");

        assert_ne!(a, b);
        assert!(hasher.verify("Passw0rd", &a));
        assert!(hasher.verify("Passw0rd", &b));
    }

    // Test 3: encoded form is standard base64 of 64 bytes
    #[test]
    fn test_hash_layout() {
        let hash = fast_hasher().hash("x");
        let decoded = STANDARD.decode(&hash).unwrap();
        assert_eq!(decoded.len(), SALT_LEN + KEY_LEN);
    }

    // Test 4: malformed input yields false rather than an error
    #[test]
    fn test_verify_malformed() {
        let hasher = fast_hasher();
        assert!(!hasher.verify("pw", "not base64 !!"));
        assert!(!hasher.verify("pw", ""));
        assert!(!hasher.verify("pw", &STANDARD.encode([0u8; 16])));
    }

    // Test 5: a different iteration count does not verify
    #[test]
    fn test_iteration_count_matters() {
        let hash = PasswordHasher::new(1_000).hash("Passw0rd");
        assert!(!PasswordHasher::new(1_001).verify("Passw0rd", &hash));
    }

    // Test 6: default hasher uses the production iteration count
    #[test]
    fn test_default_iterations() {
        let hasher = PasswordHasher::default();
        assert_eq!(hasher.iterations(), DEFAULT_ITERATIONS);

        let hash = hasher.hash("Passw0rd");
        assert!(hasher.verify("Passw0rd", &hash));
    }

    // Test 7: default policy
    #[test]
    fn test_policy_default_rules() {
        let policy = PasswordPolicy::default();

        assert!(policy.validate("Passw0rd").is_ok());
        assert_eq!(
            policy.validate("short1A"),
            Err(vec![PolicyViolation::TooShort { min_length: 8 }])
        );
        assert_eq!(
            policy.validate("alllowercase"),
            Err(vec![
                PolicyViolation::MissingUppercase,
                PolicyViolation::MissingDigit
            ])
        );
    }

    // Test 8: special characters only when required
    #[test]
    fn test_policy_special_characters() {
        let policy = PasswordPolicy {
            require_special: true,
            ..Default::default()
        };
        assert_eq!(
            policy.validate("Passw0rd"),
            Err(vec![PolicyViolation::MissingSpecial])
        );
        assert!(policy.validate("Passw0rd!").is_ok());
        assert_eq!(
            PolicyViolation::MissingSpecial.to_string(),
            "must contain a special character"
        );
    }
}
