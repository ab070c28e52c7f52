//! HMAC-SHA256 signing of delivery bodies.
//!
//! The signature covers the exact bytes put on the wire, hex encoded.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{Result, VolleyError};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the body signature.
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

fn mac(secret: &str) -> Result<HmacSha256> {
    HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| VolleyError::Other(anyhow::anyhow!("invalid HMAC key: {}", e)))
}

/// Hex HMAC-SHA256 of `body` under `secret`.
pub fn sign(body: &[u8], secret: &str) -> Result<String> {
    let mut mac = mac(secret)?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Check a received signature header against the received body bytes.
///
/// Comparison is constant time. Malformed hex is a mismatch.
pub fn verify_signature(body: &[u8], signature: &str, secret: &str) -> Result<()> {
    let Ok(expected) = hex::decode(signature.trim()) else {
        return Err(VolleyError::SignatureMismatch);
    };
    let mut mac = mac(secret)?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| VolleyError::SignatureMismatch)
}

/// Boolean form of [`verify_signature`].
pub fn is_valid_signature(body: &[u8], signature: &str, secret: &str) -> bool {
    verify_signature(body, signature, secret).is_ok()
}
