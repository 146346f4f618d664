//! Bearer token issuance and verification
//!
//! Tokens are compact HS256 JWTs: `base64url(header).base64url(payload).base64url(sig)`
//! with unpadded URL-safe Base64. Verification failures of any kind collapse to
//! `None` at the public boundary; the reason is only logged at debug level.

use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Duration;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::Sha256;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::AuthError;

type HmacSha256 = Hmac<Sha256>;

/// Documented placeholder secret; deployments must override it
pub const DEFAULT_SECRET_KEY: &str = "gatekeeper-default-secret-change-me";

/// Default token lifetime in seconds (24 hours)
pub const DEFAULT_TOKEN_TTL_SECS: i64 = 24 * 60 * 60;

/// Configuration for the token service
#[derive(Debug, Clone)]
pub struct TokenConfig {
    /// HMAC signing secret
    pub secret_key: String,

    /// Lifetime used when `issue` gets no explicit TTL
    pub default_ttl: Duration,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            secret_key: DEFAULT_SECRET_KEY.to_string(),
            default_ttl: Duration::seconds(DEFAULT_TOKEN_TTL_SECS),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    alg: String,
    typ: String,
}

/// Verified token payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Expiry, unix seconds
    pub exp: i64,

    /// Issued at, unix seconds
    pub iat: i64,

    /// Caller-supplied claims
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TokenClaims {
    /// The `sub` claim, if present and a string
    pub fn subject(&self) -> Option<&str> {
        self.extra.get("sub").and_then(Value::as_str)
    }

    /// A string claim by name
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.extra.get(name).and_then(Value::as_str)
    }
}

/// Why a token was rejected. Never returned to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenRejection {
    Format,
    Header,
    Signature,
    Payload,
    Expired,
}

/// Stateless HMAC-signed token service
pub struct TokenService {
    config: TokenConfig,
    clock: Arc<dyn Clock>,
}

impl TokenService {
    /// Create a new token service
    ///
    /// Logs a warning when the documented default secret is in use.
    pub fn new(config: TokenConfig, clock: Arc<dyn Clock>) -> Self {
        let service = Self { config, clock };
        if service.uses_default_secret() {
            warn!("Token signing secret is the documented default; set auth.secret_key");
        }
        service
    }

    /// True when the signing secret is the documented default
    pub fn uses_default_secret(&self) -> bool {
        self.config.secret_key == DEFAULT_SECRET_KEY
    }

    /// Issue a token carrying `claims` plus `exp` and `iat`
    ///
    /// `ttl` defaults to the configured lifetime; a negative TTL yields a
    /// token that is already expired.
    pub fn issue(&self, claims: Map<String, Value>, ttl: Option<Duration>) -> Result<String, AuthError> {
        let now = self.clock.unix_secs();
        let ttl = ttl.unwrap_or(self.config.default_ttl);

        let mut payload = claims;
        payload.insert("exp".to_string(), Value::from(now + ttl.num_seconds()));
        payload.insert("iat".to_string(), Value::from(now));

        let header = Header {
            alg: "HS256".to_string(),
            typ: "JWT".to_string(),
        };
        let header = serde_json::to_vec(&header)
            .map_err(|e| AuthError::MalformedInput(format!("token header: {}", e)))?;
        let payload = serde_json::to_vec(&payload)
            .map_err(|e| AuthError::MalformedInput(format!("token payload: {}", e)))?;

        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(header),
            URL_SAFE_NO_PAD.encode(payload)
        );
        let signature = URL_SAFE_NO_PAD.encode(self.sign(signing_input.as_bytes())?);

        Ok(format!("{}.{}", signing_input, signature))
    }

    /// Verify a token and return its claims
    ///
    /// Bad format, bad signature, malformed payload and expiry all yield `None`.
    pub fn verify(&self, token: &str) -> Option<TokenClaims> {
        match self.decode(token) {
            Ok(claims) => Some(claims),
            Err(reason) => {
                debug!(?reason, "Token rejected");
                None
            }
        }
    }

    fn decode(&self, token: &str) -> Result<TokenClaims, TokenRejection> {
        let parts: Vec<&str> = token.split('.').collect();
        let [header_b64, payload_b64, signature_b64] = parts.as_slice() else {
            return Err(TokenRejection::Format);
        };

        let signature = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|_| TokenRejection::Format)?;
        let mut mac = self.mac().map_err(|_| TokenRejection::Signature)?;
        mac.update(header_b64.as_bytes());
        mac.update(b".");
        mac.update(payload_b64.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| TokenRejection::Signature)?;

        let header: Header = URL_SAFE_NO_PAD
            .decode(header_b64)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .ok_or(TokenRejection::Header)?;
        if header.alg != "HS256" {
            return Err(TokenRejection::Header);
        }

        let claims: TokenClaims = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .ok_or(TokenRejection::Payload)?;

        if claims.exp < self.clock.unix_secs() {
            return Err(TokenRejection::Expired);
        }

        Ok(claims)
    }

    fn mac(&self) -> Result<HmacSha256, AuthError> {
        HmacSha256::new_from_slice(self.config.secret_key.as_bytes())
            .map_err(|e| AuthError::MalformedInput(format!("signing key: {}", e)))
    }

    fn sign(&self, input: &[u8]) -> Result<Vec<u8>, AuthError> {
        let mut mac = self.mac()?;
        mac.update(input);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;

    fn create_service(secret: &str) -> (Arc<ManualClock>, TokenService) {
        let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
        let service = TokenService::new(
            TokenConfig {
                secret_key: secret.to_string(),
                ..Default::default()
            },
            clock.clone(),
        );
        (clock, service)
    }

    fn claims(sub: &str) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("sub".to_string(), json!(sub));
        map.insert("role".to_string(), json!("admin"));
        map
    }

    // Test 1: issue then verify returns the claims
    #[test]
    fn test_issue_and_verify() {
        let (_, service) = create_service("test-secret");
        let token = service.issue(claims("alice"), None).unwrap();

        assert_eq!(token.split('.').count(), 3);
        let verified = service.verify(&token).unwrap();
        assert_eq!(verified.subject(), Some("alice"));
        assert_eq!(verified.get_str("role"), Some("admin"));
        assert_eq!(verified.iat, 1_700_000_000);
        assert_eq!(verified.exp, 1_700_000_000 + DEFAULT_TOKEN_TTL_SECS);
    }

    // Test 2: header is HS256/JWT and segments are unpadded base64url
    #[test]
    fn test_token_format() {
        let (_, service) = create_service("test-secret");
        let token = service.issue(Map::new(), None).unwrap();

        assert!(!token.contains('='));
        let header_b64 = token.split('.').next().unwrap();
        let header: Value =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(header_b64).unwrap()).unwrap();
        assert_eq!(header, json!({"alg": "HS256", "typ": "JWT"}));
    }

    // Test 3: negative TTL produces an already-expired token
    #[test]
    fn test_negative_ttl_rejected() {
        let (_, service) = create_service("test-secret");
        let token = service
            .issue(claims("alice"), Some(Duration::seconds(-1)))
            .unwrap();
        assert!(service.verify(&token).is_none());
    }

    // Test 4: tokens expire once exp is in the past
    #[test]
    fn test_expiry_boundary() {
        let (clock, service) = create_service("test-secret");
        let token = service
            .issue(claims("alice"), Some(Duration::seconds(60)))
            .unwrap();

        clock.advance(Duration::seconds(60));
        assert!(service.verify(&token).is_some());

        clock.advance(Duration::seconds(1));
        assert!(service.verify(&token).is_none());
    }

    // Test 5: flipping any signature character invalidates the token
    #[test]
    fn test_signature_tamper_rejected() {
        let (_, service) = create_service("test-secret");
        let token = service.issue(claims("alice"), None).unwrap();
        let (body, signature) = token.rsplit_once('.').unwrap();

        for i in 0..signature.len() {
            let mut chars: Vec<char> = signature.chars().collect();
            chars[i] = if chars[i] == 'A' { 'B' } else { 'A' };
            let tampered = format!("{}.{}", body, chars.into_iter().collect::<String>());
            assert!(service.verify(&tampered).is_none(), "position {}", i);
        }
    }

    // Test 6: payload changes invalidate the signature
    #[test]
    fn test_payload_tamper_rejected() {
        let (_, service) = create_service("test-secret");
        let token = service.issue(claims("alice"), None).unwrap();
        let parts: Vec<&str> = token.split('.').collect();

        let forged_payload = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&json!({"sub": "mallory", "exp": 9_999_999_999i64, "iat": 0}))
                .unwrap(),
        );
        let forged = format!("{}.{}.{}", parts[0], forged_payload, parts[2]);
        assert!(service.verify(&forged).is_none());
    }

    // Test 7: tokens signed with another secret are rejected
    #[test]
    fn test_wrong_secret_rejected() {
        let (_, issuer) = create_service("secret-a");
        let (_, verifier) = create_service("secret-b");
        let token = issuer.issue(claims("alice"), None).unwrap();
        assert!(verifier.verify(&token).is_none());
    }

    // Test 8: malformed tokens are rejected without panicking
    #[test]
    fn test_malformed_rejected() {
        let (_, service) = create_service("test-secret");
        assert!(service.verify("").is_none());
        assert!(service.verify("a.b").is_none());
        assert!(service.verify("a.b.c.d").is_none());
        assert!(service.verify("!!!.???.***").is_none());
    }

    // Test 9: default secret is reported
    #[test]
    fn test_uses_default_secret() {
        let (_, service) = create_service(DEFAULT_SECRET_KEY);
        assert!(service.uses_default_secret());

        let (_, service) = create_service("something-else");
        assert!(!service.uses_default_secret());
    }

    // Test 10: reserved claims cannot be overridden by the caller
    #[test]
    fn test_exp_and_iat_set_by_service() {
        let (_, service) = create_service("test-secret");
        let mut map = claims("alice");
        map.insert("exp".to_string(), json!(1));
        map.insert("iat".to_string(), json!(1));

        let verified = service.verify(&service.issue(map, None).unwrap()).unwrap();
        assert_eq!(verified.iat, 1_700_000_000);
        assert!(verified.exp > 1_700_000_000);
    }
}
