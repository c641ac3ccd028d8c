//! HMAC-SHA256 verification for upstream webhook signatures.
//!
//! The upstream provider signs each delivery with a single header carrying
//! the timestamp and one or more signatures:
//!
//! - Header format: `t=<unix-seconds>,v1=<base64-hmac>[,v1=<base64-hmac>...]`
//! - Signature is computed over: `{timestamp}.{raw_body}`
//! - The signature is base64-encoded HMAC-SHA256
//!
//! Multiple `v1` entries appear while the provider rotates secrets;
//! verification succeeds if any entry matches. Timestamps older or newer
//! than the replay tolerance are rejected before any comparison.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64_STANDARD};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the upstream signature
pub const SIGNATURE_HEADER: &str = "upstream-signature";

/// Prefix for webhook secrets
pub const SECRET_PREFIX: &str = "whsec_";

/// Why a signature header was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    #[error("signature header is malformed")]
    MalformedHeader,
    #[error("timestamp outside replay tolerance")]
    StaleTimestamp,
    #[error("no signature entry matched")]
    Mismatch,
}

/// Generate a new webhook secret.
///
/// Returns a `whsec_` prefixed base64-encoded 32-byte random secret.
pub fn generate_secret() -> String {
    use rand::Rng;

    let mut secret_bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut secret_bytes);

    format!("{}{}", SECRET_PREFIX, BASE64_STANDARD.encode(secret_bytes))
}

/// Extract the raw secret bytes from a `whsec_` prefixed secret.
///
/// Returns `None` if the secret doesn't have the correct prefix or invalid base64.
pub fn decode_secret(secret: &str) -> Option<Vec<u8>> {
    let encoded = secret.strip_prefix(SECRET_PREFIX)?;
    BASE64_STANDARD.decode(encoded).ok()
}

/// Sign a payload for the given timestamp.
///
/// The signature is computed over `{timestamp}.{payload}` and returned as
/// base64 without the `v1=` prefix. Returns `None` for an undecodable secret.
pub fn sign_payload(timestamp: i64, payload: &str, secret: &str) -> Option<String> {
    let secret_bytes = decode_secret(secret)?;

    let signed_content = format!("{}.{}", timestamp, payload);

    let mut mac = HmacSha256::new_from_slice(&secret_bytes).ok()?;
    mac.update(signed_content.as_bytes());
    let signature = mac.finalize().into_bytes();

    Some(BASE64_STANDARD.encode(signature))
}

/// Build a complete signature header for a payload (used when replaying
/// upstream deliveries in tests and tooling).
pub fn signature_header(timestamp: i64, payload: &str, secret: &str) -> Option<String> {
    let signature = sign_payload(timestamp, payload, secret)?;
    Some(format!("t={},v1={}", timestamp, signature))
}

/// Parse a signature header into its timestamp and `v1` entries.
///
/// Returns `None` when the timestamp is missing/unparseable or no `v1`
/// entry is present.
pub fn parse_header(header: &str) -> Option<(i64, Vec<String>)> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let (key, value) = part.trim().split_once('=')?;
        match key {
            "t" => timestamp = Some(value.parse::<i64>().ok()?),
            "v1" => signatures.push(value.to_string()),
            // Unknown schemes (e.g. a future v2) are skipped, not an error
            _ => {}
        }
    }

    let timestamp = timestamp?;
    if signatures.is_empty() {
        return None;
    }

    Some((timestamp, signatures))
}

/// Verify a signature header against the raw request body.
///
/// Checks, in order: header shape, timestamp within `tolerance` of now,
/// and at least one `v1` entry matching the expected HMAC. Comparison is
/// constant-time.
pub fn verify_header(header: &str, payload: &str, secret: &str, tolerance: Duration) -> Result<(), VerifyError> {
    verify_header_at(header, payload, secret, tolerance, chrono::Utc::now().timestamp())
}

/// Verification against an explicit clock, split out for deterministic tests.
pub fn verify_header_at(header: &str, payload: &str, secret: &str, tolerance: Duration, now: i64) -> Result<(), VerifyError> {
    let Some((timestamp, candidates)) = parse_header(header) else {
        return Err(VerifyError::MalformedHeader);
    };

    if (now - timestamp).unsigned_abs() > tolerance.as_secs() {
        return Err(VerifyError::StaleTimestamp);
    }

    let Some(expected) = sign_payload(timestamp, payload, secret) else {
        // Undecodable secret can never match anything
        return Err(VerifyError::Mismatch);
    };

    // Use constant-time comparison to prevent timing attacks
    for candidate in &candidates {
        if constant_time_eq(candidate.as_bytes(), expected.as_bytes()) {
            return Ok(());
        }
    }

    Err(VerifyError::Mismatch)
}

/// Constant-time byte comparison to prevent timing attacks.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}
