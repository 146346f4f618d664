//! Time-based one-time passwords (RFC 6238, HMAC-SHA1, 6 digits, 30 s step)
//!
//! Pure functions; persistence and lifecycle live in `second_factor`.

use std::collections::BTreeSet;

use base32::Alphabet;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha1::Sha1;
use subtle::ConstantTimeEq;

type HmacSha1 = Hmac<Sha1>;

/// Code length
pub const DIGITS: usize = 6;

/// Time step in seconds
pub const PERIOD_SECS: i64 = 30;

/// Default secret size in bytes
pub const DEFAULT_SECRET_BYTES: usize = 32;

/// Backup code length in characters
pub const BACKUP_CODE_LEN: usize = 8;

const ALPHABET: Alphabet = Alphabet::Rfc4648 { padding: false };

/// Generate a random Base32 secret (RFC 4648, no padding)
pub fn generate_secret(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes.max(1)];
    OsRng.fill_bytes(&mut buf);
    base32::encode(ALPHABET, &buf)
}

/// Decode a Base32 secret, tolerating spaces, padding and lowercase
pub fn decode_secret(secret: &str) -> Option<Vec<u8>> {
    let cleaned: String = secret
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '=')
        .map(|c| c.to_ascii_uppercase())
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    base32::decode(ALPHABET, &cleaned).filter(|bytes| !bytes.is_empty())
}

/// Time step index for a unix timestamp
pub fn time_step(unix_time: i64) -> Option<u64> {
    if unix_time < 0 {
        return None;
    }
    Some((unix_time / PERIOD_SECS) as u64)
}

/// Code for a given step, `None` for a malformed secret
fn code_at_step(key: &[u8], step: u64) -> Option<String> {
    let mut mac = HmacSha1::new_from_slice(key).ok()?;
    mac.update(&step.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let binary = (u32::from(digest[offset] & 0x7f) << 24)
        | (u32::from(digest[offset + 1]) << 16)
        | (u32::from(digest[offset + 2]) << 8)
        | u32::from(digest[offset + 3]);

    Some(format!("{:0width$}", binary % 1_000_000, width = DIGITS))
}

/// Compute the code valid at `unix_time`
pub fn compute_code(secret: &str, unix_time: i64) -> Option<String> {
    let key = decode_secret(secret)?;
    code_at_step(&key, time_step(unix_time)?)
}

/// Check `code` against every step within `window` of `unix_time`
///
/// Each comparison is constant-time. Codes that are not exactly six
/// characters are rejected outright.
pub fn verify_code(secret: &str, code: &str, unix_time: i64, window: u32) -> bool {
    if code.len() != DIGITS {
        return false;
    }
    let Some(key) = decode_secret(secret) else {
        return false;
    };
    let Some(current) = time_step(unix_time) else {
        return false;
    };

    let window = u64::from(window);
    let first = current.saturating_sub(window);
    let last = current.saturating_add(window);

    let mut matched = false;
    for step in first..=last {
        if let Some(expected) = code_at_step(&key, step) {
            matched |= bool::from(expected.as_bytes().ct_eq(code.as_bytes()));
        }
    }
    matched
}

/// `otpauth://` URI understood by authenticator apps
pub fn provisioning_uri(issuer: &str, username: &str, secret: &str) -> String {
    let issuer = encode_component(issuer);
    format!(
        "otpauth://totp/{issuer}:{}?secret={}&issuer={issuer}&digits={}&period={}",
        encode_component(username),
        secret,
        DIGITS,
        PERIOD_SECS,
    )
}

/// Generate `count` distinct backup codes
pub fn generate_backup_codes(count: usize) -> BTreeSet<String> {
    let mut codes = BTreeSet::new();
    while codes.len() < count {
        let mut code = generate_secret(BACKUP_CODE_LEN);
        code.truncate(BACKUP_CODE_LEN);
        codes.insert(code);
    }
    codes
}

/// Percent-encode everything outside the RFC 3986 unreserved set
fn encode_component(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}
