//! Attempt ledger records: redacted payload snapshots and truncated responses.

use serde_json::Value;

/// Replacement for redacted values.
pub const REDACTED: &str = "***REDACTED***";

/// Object keys whose values never reach the ledger.
const SECRET_KEYS: &[&str] = &["secret", "webhook_secret", "delivery_secret", "signature"];

/// Copy of `payload` with secret-named keys and any occurrence of `secret` replaced.
pub fn redact_snapshot(payload: &Value, secret: Option<&str>) -> Value {
    let secret = secret.filter(|s| !s.is_empty());
    match payload {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    if SECRET_KEYS.contains(&k.to_ascii_lowercase().as_str()) {
                        (k.clone(), Value::String(REDACTED.to_string()))
                    } else {
                        (k.clone(), redact_snapshot(v, secret))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(|v| redact_snapshot(v, secret)).collect()),
        Value::String(s) => match secret {
            Some(secret) if s.contains(secret) => Value::String(s.replace(secret, REDACTED)),
            _ => payload.clone(),
        },
        other => other.clone(),
    }
}

/// Payload bytes as a redacted JSON value. Bodies that are not JSON are kept as a string.
pub fn snapshot_payload(body: &[u8], secret: Option<&str>) -> Value {
    let value = serde_json::from_slice::<Value>(body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()));
    redact_snapshot(&value, secret)
}

/// At most `limit` characters of `body`, cut on a char boundary.
pub fn truncate_snapshot(body: &str, limit: usize) -> String {
    match body.char_indices().nth(limit) {
        Some((end, _)) => body[..end].to_string(),
        None => body.to_string(),
    }
}
