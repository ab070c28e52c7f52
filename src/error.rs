//! Error types for request processing and delivery.

use thiserror::Error;

use crate::request::RequestId;

/// Result type alias using the volley error type.
pub type Result<T> = std::result::Result<T, VolleyError>;

/// Main error type for the processing and delivery system.
#[derive(Error, Debug)]
pub enum VolleyError {
    /// Request not found
    #[error("Request not found: {0}")]
    RequestNotFound(RequestId),

    /// Request is in an invalid state for the requested operation
    #[error("Invalid state transition: request {0} is in state '{1}', expected '{2}'")]
    InvalidState(RequestId, String, String),

    /// The fan-out could not run at all (e.g. the step set could not be resolved).
    #[error("Orchestration fault: {reason}")]
    OrchestrationFault { reason: String },

    /// Another writer advanced the delivery counter first.
    #[error("Concurrent delivery detected for request {0}")]
    DeliveryConflict(RequestId),

    /// Delivery was requested for a request without a target.
    #[error("No delivery target configured for request {0}")]
    NoDeliveryTarget(RequestId),

    /// Signature header does not match the body.
    #[error("Signature verification failed")]
    SignatureMismatch,

    /// Submission rejected by the rate limiter.
    #[error("Rate limit exceeded for '{key}'")]
    RateLimited { key: String },

    /// Validation error (e.g. blank input, malformed delivery URL)
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Daemon is shutting down
    #[error("Daemon is shutting down")]
    Shutdown,

    /// HTTP client error
    #[error("HTTP request failed: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// General error from anyhow
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VolleyError {
    /// Returns true if the error came from building the outbound request rather than sending it.
    ///
    /// Such errors (invalid URL, invalid header value) will never succeed on retry.
    pub fn is_request_builder_error(&self) -> bool {
        matches!(self, VolleyError::HttpClient(e) if e.is_builder())
    }
}
