//! Canonical delivery payload.
//!
//! The payload is serialized once per `deliver` call; those exact bytes are signed
//! and sent on every attempt. Every input to the payload comes from persisted state,
//! so the bytes are also identical across separate invocations for the same request.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{Result, VolleyError};
use crate::fanout::outcome::duration_secs;
use crate::fanout::{AggregateResult, StepOutcome, StepStatus};
use crate::request::{AnyRequest, RequestId, RequestStatus};

/// Top-level payload keys. Step names may not use them, since per-step results
/// are flattened into the same object.
pub const RESERVED_PAYLOAD_KEYS: &[&str] = &[
    "request_id",
    "status",
    "error",
    "steps_succeeded",
    "steps_failed",
    "per_step_results",
    "total_duration",
    "completion_timestamp",
];

#[derive(Debug, Serialize)]
struct DeliveryPayload<'a> {
    request_id: RequestId,
    status: RequestStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(flatten)]
    results: &'a BTreeMap<String, serde_json::Value>,
    steps_succeeded: usize,
    steps_failed: usize,
    per_step_results: Vec<StepSummary<'a>>,
    #[serde(with = "duration_secs")]
    total_duration: Duration,
    completion_timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct StepSummary<'a> {
    step_name: &'a str,
    result_data: &'a serde_json::Value,
    #[serde(with = "duration_secs")]
    duration: Duration,
    status: StepStatus,
}

/// Serialize the payload for a terminal request.
///
/// Requests that failed before the fan-out produced anything have no aggregate;
/// their payload carries the failure message and empty results.
pub fn build_payload(
    request: &AnyRequest,
    outcomes: &[StepOutcome],
    aggregate: Option<&AggregateResult>,
) -> Result<Bytes> {
    let Some(completion_timestamp) = request.finished_at() else {
        return Err(VolleyError::InvalidState(
            request.id(),
            request.status().to_string(),
            "completed or failed".into(),
        ));
    };

    let empty = BTreeMap::new();
    let error = match request {
        AnyRequest::Failed(r) => Some(r.state.reason.to_error_message()),
        _ => None,
    };

    let payload = DeliveryPayload {
        request_id: request.id(),
        status: request.status(),
        error,
        results: aggregate.map(|a| &a.results).unwrap_or(&empty),
        steps_succeeded: aggregate.map(|a| a.succeeded).unwrap_or(0),
        steps_failed: aggregate.map(|a| a.failed).unwrap_or(0),
        per_step_results: outcomes
            .iter()
            .map(|o| StepSummary {
                step_name: &o.step_name,
                result_data: &o.result_data,
                duration: o.duration,
                status: o.status,
            })
            .collect(),
        total_duration: aggregate.map(|a| a.total_duration).unwrap_or_default(),
        completion_timestamp,
    };

    Ok(Bytes::from(serde_json::to_vec(&payload)?))
}
