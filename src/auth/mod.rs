//! The JWT-like token verifier. Deliberately *not* built on the
//! `jsonwebtoken` crate: that crate's `encode`/`decode` API has no seam for
//! "XOR-obfuscate the serialized payload, then HMAC the obfuscated bytes",
//! and both secrets (signing key and XOR key) must stay mandatory — dropping
//! the XOR layer would silently change the token format and break existing
//! clients. So the token format here is purpose built from `hmac` + `sha2`
//! + `base64`, with `subtle` for the constant-time MAC comparison.
//!
//! Token wire format: `base64url(xor(payload_json, xor_key))` `.`
//! `base64url(hmac_sha256(secret, xored_payload_bytes))`.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{AppError, AppResult};
use crate::tables::AUTH_TOKEN_MAX_BYTES;

type HmacSha256 = Hmac<Sha256>;

/// Decoded, verified token payload: exposes `profile_id`, `scope_entity_id`,
/// and `device_hash`, plus the account id and the issuing IP needed for the
/// binding check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Claims {
    pub account_id: i64,
    pub profile_id: i64,
    /// Non-zero means the token claims authority over a specific tenant-like
    /// scope; zero means "use the profile's default scope".
    pub scope_entity_id: i64,
    /// 32 lowercase hex chars, deterministic fingerprint of client device
    /// properties (computed upstream — this crate only compares, never
    /// computes, the hash).
    pub device_hash: String,
    /// The IP the token was issued to, for the binding check.
    pub ip: String,
    pub iat: i64,
    pub exp: i64,
}

fn xor_bytes(data: &[u8], key: &[u8]) -> Vec<u8> {
    if key.is_empty() {
        return data.to_vec();
    }
    data.iter()
        .enumerate()
        .map(|(i, b)| b ^ key[i % key.len()])
        .collect()
}

fn compute_mac(xored_payload: &[u8], secret: &[u8]) -> AppResult<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|_| AppError::Auth("invalid signing key".into()))?;
    mac.update(xored_payload);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Sign a fresh token. Used by the issuing side (out of this crate's scope
/// in production — tokens are normally minted by the auth/profile service —
/// but required here to exercise and test the verifier end to end).
pub fn sign(claims: &Claims, secret: &str, xor_key: &str) -> AppResult<String> {
    let payload = serde_json::to_vec(claims)
        .map_err(|e| AppError::Auth(format!("failed to serialize claims: {e}")))?;
    let xored = xor_bytes(&payload, xor_key.as_bytes());
    let mac = compute_mac(&xored, secret.as_bytes())?;
    Ok(format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(&xored),
        URL_SAFE_NO_PAD.encode(&mac)
    ))
}

/// Verify signature, expiry, and IP binding. Does **not** perform the scope
/// cross-check — that step requires a loaded `Profile` and lives in
/// [`crate::profile::coerce_scope`], which overwrites an inaccessible scope
/// rather than treating it as a verification failure.
///
/// `remote_addr` is the request's observed peer address; when `trust_proxy`
/// is set the IP-binding check is skipped entirely, on the assumption an
/// upstream proxy already validated the client IP.
pub fn verify(
    token: &str,
    secret: &str,
    xor_key: &str,
    remote_addr: &str,
    trust_proxy: bool,
    now: i64,
) -> AppResult<Claims> {
    if token.is_empty() || token.len() > AUTH_TOKEN_MAX_BYTES {
        return Err(AppError::Auth("token has invalid length".into()));
    }

    let (payload_b64, mac_b64) = token
        .split_once('.')
        .ok_or_else(|| AppError::Auth("malformed token".into()))?;

    let xored = URL_SAFE_NO_PAD
        .decode(payload_b64)
        .map_err(|_| AppError::Auth("malformed token payload".into()))?;
    let presented_mac = URL_SAFE_NO_PAD
        .decode(mac_b64)
        .map_err(|_| AppError::Auth("malformed token signature".into()))?;

    let expected_mac = compute_mac(&xored, secret.as_bytes())?;
    if expected_mac.ct_eq(&presented_mac).unwrap_u8() != 1 {
        return Err(AppError::Auth("invalid token signature".into()));
    }

    let payload = xor_bytes(&xored, xor_key.as_bytes());
    let claims: Claims = serde_json::from_slice(&payload)
        .map_err(|_| AppError::Auth("malformed token claims".into()))?;

    // Zero clock-skew tolerance, per spec.
    if claims.exp <= now {
        return Err(AppError::Auth("token expired".into()));
    }

    if !trust_proxy && claims.ip != remote_addr {
        return Err(AppError::Auth("token is bound to a different IP".into()));
    }

    Ok(claims)
}
