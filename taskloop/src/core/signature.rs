//! HMAC-SHA256 webhook signatures.
//!
//! Header values have the form `sha256=<hex>`. The timestamped variant signs
//! `"{timestamp}." + payload` so recipients can reject replays by checking the
//! `X-Webhook-Timestamp` header for freshness.

use anyhow::{Result, anyhow};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const PREFIX: &str = "sha256=";

/// Sign `payload` with `secret`.
pub fn sign(payload: &[u8], secret: &str) -> Result<String> {
    let mut mac = new_mac(secret)?;
    mac.update(payload);
    Ok(format!("{PREFIX}{}", hex::encode(mac.finalize().into_bytes())))
}

/// Sign `"{timestamp}." + payload` with `secret`.
pub fn sign_timestamped(payload: &[u8], secret: &str, timestamp: i64) -> Result<String> {
    let mut mac = new_mac(secret)?;
    mac.update(format!("{timestamp}.").as_bytes());
    mac.update(payload);
    Ok(format!("{PREFIX}{}", hex::encode(mac.finalize().into_bytes())))
}

/// Constant-time check of a `sha256=<hex>` signature over `payload`.
pub fn verify(payload: &[u8], secret: &str, signature: &str) -> bool {
    let Some(expected) = decode(signature) else {
        return false;
    };
    let Ok(mut mac) = new_mac(secret) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}

/// Timestamped counterpart of [`verify`].
pub fn verify_timestamped(payload: &[u8], secret: &str, timestamp: i64, signature: &str) -> bool {
    let Some(expected) = decode(signature) else {
        return false;
    };
    let Ok(mut mac) = new_mac(secret) else {
        return false;
    };
    mac.update(format!("{timestamp}.").as_bytes());
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}

fn new_mac(secret: &str) -> Result<HmacSha256> {
    HmacSha256::new_from_slice(secret.as_bytes()).map_err(|e| anyhow!("invalid hmac key: {e}"))
}

fn decode(signature: &str) -> Option<Vec<u8>> {
    let hex_part = signature.strip_prefix(PREFIX).unwrap_or(signature);
    hex::decode(hex_part.trim()).ok()
}
