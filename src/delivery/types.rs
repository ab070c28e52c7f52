//! Delivery-side records: target, per-request progress, ledger entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::request::RequestId;

/// Where a completion callback goes, and how it is signed.
///
/// The secret is accepted on input but never serialized back out.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryTarget {
    pub url: String,
    #[serde(default, skip_serializing)]
    pub secret: Option<String>,
}

impl DeliveryTarget {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            secret: None,
        }
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    /// An empty secret is treated as no secret.
    pub fn signing_secret(&self) -> Option<&str> {
        self.secret.as_deref().filter(|s| !s.is_empty())
    }
}

impl std::fmt::Debug for DeliveryTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryTarget")
            .field("url", &self.url)
            .field("secret", &self.secret.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Delivery progress, tracked independently from the request status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    /// No target configured.
    #[default]
    None,
    /// Target configured, not yet delivered.
    Pending,
    /// A 2xx response was received.
    Sent,
    /// Budget exhausted or the receiver rejected the payload.
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::None => "none",
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(DeliveryStatus::None),
            "pending" => Ok(DeliveryStatus::Pending),
            "sent" => Ok(DeliveryStatus::Sent),
            "failed" => Ok(DeliveryStatus::Failed),
            _ => Err(format!("Invalid delivery status: {}", s)),
        }
    }
}

/// Delivery counters stored on the request row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryState {
    pub status: DeliveryStatus,
    /// Never decreases; never exceeds the configured maximum.
    pub attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl DeliveryState {
    /// Initial state for a newly submitted request.
    pub fn initial(has_target: bool) -> Self {
        Self {
            status: if has_target {
                DeliveryStatus::Pending
            } else {
                DeliveryStatus::None
            },
            attempts: 0,
            last_attempt_at: None,
        }
    }
}

/// One immutable ledger entry per outbound call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub id: Uuid,
    pub request_id: RequestId,
    pub target_url: String,
    /// The sent payload with secrets redacted.
    pub payload_snapshot: serde_json::Value,
    /// 1-based; equals the request's attempt counter once recorded.
    pub attempt_number: u32,
    /// Absent on transport failure.
    pub status_code: Option<u16>,
    pub response_snapshot: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl DeliveryAttempt {
    pub fn succeeded(&self) -> bool {
        self.status_code.is_some_and(|s| (200..300).contains(&s))
    }
}

/// Result of one `deliver` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryOutcome {
    /// The receiver acknowledged with a 2xx.
    Sent,
    /// Budget exhausted or terminal rejection.
    Failed,
    /// Nothing finished now and nothing was lost; try again later.
    Deferred,
}

impl DeliveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryOutcome::Sent => "sent",
            DeliveryOutcome::Failed => "failed",
            DeliveryOutcome::Deferred => "deferred",
        }
    }
}
