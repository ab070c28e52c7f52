//! Per-step outcomes and the aggregate built from them.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::request::RequestId;

/// Whether a single step produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Success,
    Error,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Success => "success",
            StepStatus::Error => "error",
        }
    }
}

impl std::str::FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(StepStatus::Success),
            "error" => Ok(StepStatus::Error),
            _ => Err(format!("Invalid step status: {}", s)),
        }
    }
}

/// Result of running one step for one request. Written once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub request_id: RequestId,
    pub step_name: String,
    /// `{}` when the step failed.
    pub result_data: serde_json::Value,
    #[serde(with = "duration_secs")]
    pub duration: Duration,
    pub status: StepStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl StepOutcome {
    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Success
    }
}

/// Merged view over every outcome of a request. Exactly one per request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateResult {
    pub request_id: RequestId,
    /// Step name to result data, for every step that ran.
    pub results: BTreeMap<String, serde_json::Value>,
    pub succeeded: usize,
    pub failed: usize,
    #[serde(with = "duration_secs")]
    pub total_duration: Duration,
    pub created_at: DateTime<Utc>,
}

impl AggregateResult {
    pub fn from_outcomes(
        request_id: RequestId,
        outcomes: &[StepOutcome],
        total_duration: Duration,
    ) -> Self {
        let results = outcomes
            .iter()
            .map(|o| (o.step_name.clone(), o.result_data.clone()))
            .collect();
        let succeeded = outcomes.iter().filter(|o| o.is_success()).count();

        Self {
            request_id,
            results,
            succeeded,
            failed: outcomes.len() - succeeded,
            total_duration,
            created_at: Utc::now(),
        }
    }
}

/// Serializes a [`Duration`] as fractional seconds.
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
