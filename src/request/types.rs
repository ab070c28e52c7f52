//! Core request types.
//!
//! This module defines the type-safe request lifecycle using the typestate pattern.
//! Each request progresses through distinct states, enforced at compile time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::delivery::{DeliveryState, DeliveryTarget};

/// How the steps of one request are run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// One step at a time, in declared order.
    #[default]
    Sequential,
    /// All steps launched concurrently, joined on all of them.
    Parallel,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Sequential => "sequential",
            ExecutionMode::Parallel => "parallel",
        }
    }
}

impl std::str::FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sequential" => Ok(ExecutionMode::Sequential),
            "parallel" => Ok(ExecutionMode::Parallel),
            _ => Err(format!("Invalid execution mode: {}", s)),
        }
    }
}

/// Stored status of a request.
///
/// This is the flat value persisted in the `status` column and used for filtering.
/// Transitions only move forward: `Pending -> Processing -> {Completed, Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Processing => "processing",
            RequestStatus::Completed => "completed",
            RequestStatus::Failed => "failed",
        }
    }

    /// Completed and Failed are terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Completed | RequestStatus::Failed)
    }

    /// Whether a stored request in `self` may be moved to `next`.
    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        matches!(
            (self, next),
            (RequestStatus::Pending, RequestStatus::Processing)
                | (RequestStatus::Processing, RequestStatus::Completed)
                | (RequestStatus::Processing, RequestStatus::Failed)
        )
    }

    /// The statuses a request must be in before it can be moved to `self`.
    pub fn predecessors(&self) -> &'static [RequestStatus] {
        match self {
            RequestStatus::Pending => &[],
            RequestStatus::Processing => &[RequestStatus::Pending],
            RequestStatus::Completed | RequestStatus::Failed => &[RequestStatus::Processing],
        }
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RequestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RequestStatus::Pending),
            "processing" => Ok(RequestStatus::Processing),
            "completed" => Ok(RequestStatus::Completed),
            "failed" => Ok(RequestStatus::Failed),
            _ => Err(format!("Invalid request status: {}", s)),
        }
    }
}

/// Marker trait for valid request states.
///
/// This trait enables the typestate pattern, ensuring that operations
/// are only performed on requests in valid states.
pub trait RequestState: Send + Sync {
    /// The flat status this state is stored as.
    const STATUS: RequestStatus;
}

/// A unit of work in the volley system.
///
/// Uses the typestate pattern to ensure type-safe state transitions.
/// The generic parameter `T` represents the current state of the request.
/// Delivery progress is tracked orthogonally in `delivery`.
#[derive(Debug, Clone, Serialize)]
pub struct Request<T: RequestState> {
    /// The current state of the request.
    pub state: T,
    /// The immutable submitted data.
    pub data: RequestData,
    /// Outbound delivery progress.
    pub delivery: DeliveryState,
    /// Last time the stored row changed.
    pub updated_at: DateTime<Utc>,
}

/// Immutable data captured when a request is submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestData {
    /// The ID assigned at submission.
    pub id: RequestId,

    /// Opaque input handed to every step.
    pub input: String,

    /// Sequential or parallel step execution.
    pub execution_mode: ExecutionMode,

    /// Subset of registered steps to run. `None` runs every registered step.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub steps: Option<Vec<String>>,

    /// Where to send the completion callback, if anywhere.
    pub delivery_target: Option<DeliveryTarget>,

    pub created_at: DateTime<Utc>,
}

/// Submission payload accepted by [`crate::daemon::Daemon::submit`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequestInput {
    pub input: String,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    #[serde(default)]
    pub steps: Option<Vec<String>>,
    #[serde(default)]
    pub delivery_target: Option<DeliveryTarget>,
    /// Key used for submission rate limiting. Not persisted.
    #[serde(default)]
    pub client_key: Option<String>,
}

impl RequestInput {
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            ..Default::default()
        }
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = mode;
        self
    }

    pub fn with_steps<I, N>(mut self, steps: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<String>,
    {
        self.steps = Some(steps.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_target(mut self, target: DeliveryTarget) -> Self {
        self.delivery_target = Some(target);
        self
    }

    pub fn with_client_key(mut self, key: impl Into<String>) -> Self {
        self.client_key = Some(key.into());
        self
    }

    /// The data persisted for this submission.
    pub fn into_data(self, id: RequestId) -> RequestData {
        RequestData {
            id,
            input: self.input,
            execution_mode: self.execution_mode,
            steps: self.steps,
            delivery_target: self.delivery_target,
            created_at: Utc::now(),
        }
    }
}

// ============================================================================
// Request States
// ============================================================================

/// Request is waiting to be processed.
///
/// This is the initial state for all newly submitted requests.
#[derive(Debug, Clone, Serialize)]
pub struct Pending {}

impl RequestState for Pending {
    const STATUS: RequestStatus = RequestStatus::Pending;
}

/// Request is being run through its steps.
///
/// Persisted before any step runs so crash recovery can find abandoned work.
#[derive(Debug, Clone, Serialize)]
pub struct Processing {
    pub started_at: DateTime<Utc>,
}

impl RequestState for Processing {
    const STATUS: RequestStatus = RequestStatus::Processing;
}

/// Every step ran and none reported an error.
#[derive(Debug, Clone, Serialize)]
pub struct Completed {
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl RequestState for Completed {
    const STATUS: RequestStatus = RequestStatus::Completed;
}

/// Reason why a request failed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "details")]
pub enum FailureReason {
    /// The fan-out ran, but at least one step reported an error.
    StepErrors { failed_steps: Vec<String> },

    /// The fan-out could not run, or the lifecycle hit an unrecoverable fault.
    OrchestrationFault { error: String },

    /// The request was found in Processing after a restart.
    Abandoned,
}

impl FailureReason {
    /// Returns a human-readable error message for this failure reason.
    pub fn to_error_message(&self) -> String {
        match self {
            FailureReason::StepErrors { failed_steps } => {
                format!("Steps failed: {}", failed_steps.join(", "))
            }
            FailureReason::OrchestrationFault { error } => {
                format!("Orchestration fault: {}", error)
            }
            FailureReason::Abandoned => "Processing was abandoned (process restarted)".to_string(),
        }
    }
}

/// The request reached a failed terminal state.
#[derive(Debug, Clone, Serialize)]
pub struct Failed {
    pub reason: FailureReason,
    /// Absent if the request never recorded a start time.
    pub started_at: Option<DateTime<Utc>>,
    pub failed_at: DateTime<Utc>,
}

impl RequestState for Failed {
    const STATUS: RequestStatus = RequestStatus::Failed;
}

/// Unique identifier for a request in the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub Uuid);

impl RequestId {
    pub fn new() -> Self {
        RequestId(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Display only first 8 characters for readability in logs
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl From<Uuid> for RequestId {
    fn from(uuid: Uuid) -> Self {
        RequestId(uuid)
    }
}

impl std::ops::Deref for RequestId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// ============================================================================
// Unified Request Representation
// ============================================================================

/// Enum that can hold a request in any state.
///
/// This is used for storage and API responses where we need to handle
/// requests uniformly regardless of their current state.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", content = "request", rename_all = "lowercase")]
pub enum AnyRequest {
    Pending(Request<Pending>),
    Processing(Request<Processing>),
    Completed(Request<Completed>),
    Failed(Request<Failed>),
}

impl AnyRequest {
    /// Get the request ID regardless of state.
    pub fn id(&self) -> RequestId {
        self.data().id
    }

    /// Get the stored status.
    pub fn status(&self) -> RequestStatus {
        match self {
            AnyRequest::Pending(_) => RequestStatus::Pending,
            AnyRequest::Processing(_) => RequestStatus::Processing,
            AnyRequest::Completed(_) => RequestStatus::Completed,
            AnyRequest::Failed(_) => RequestStatus::Failed,
        }
    }

    /// Get the request data regardless of state.
    pub fn data(&self) -> &RequestData {
        match self {
            AnyRequest::Pending(r) => &r.data,
            AnyRequest::Processing(r) => &r.data,
            AnyRequest::Completed(r) => &r.data,
            AnyRequest::Failed(r) => &r.data,
        }
    }

    /// Get the delivery progress regardless of state.
    pub fn delivery(&self) -> &DeliveryState {
        match self {
            AnyRequest::Pending(r) => &r.delivery,
            AnyRequest::Processing(r) => &r.delivery,
            AnyRequest::Completed(r) => &r.delivery,
            AnyRequest::Failed(r) => &r.delivery,
        }
    }

    pub fn delivery_mut(&mut self) -> &mut DeliveryState {
        match self {
            AnyRequest::Pending(r) => &mut r.delivery,
            AnyRequest::Processing(r) => &mut r.delivery,
            AnyRequest::Completed(r) => &mut r.delivery,
            AnyRequest::Failed(r) => &mut r.delivery,
        }
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        match self {
            AnyRequest::Pending(r) => r.updated_at,
            AnyRequest::Processing(r) => r.updated_at,
            AnyRequest::Completed(r) => r.updated_at,
            AnyRequest::Failed(r) => r.updated_at,
        }
    }

    /// When the request reached its terminal state, if it has.
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        match self {
            AnyRequest::Completed(r) => Some(r.state.completed_at),
            AnyRequest::Failed(r) => Some(r.state.failed_at),
            _ => None,
        }
    }

    /// Check if this request is in a terminal state (Completed or Failed).
    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// Try to take as a Pending request, consuming self.
    pub fn into_pending(self) -> Option<Request<Pending>> {
        match self {
            AnyRequest::Pending(r) => Some(r),
            _ => None,
        }
    }

    /// Try to take as a Processing request, consuming self.
    pub fn into_processing(self) -> Option<Request<Processing>> {
        match self {
            AnyRequest::Processing(r) => Some(r),
            _ => None,
        }
    }
}

// Conversion traits for going from typed Request to AnyRequest

impl From<Request<Pending>> for AnyRequest {
    fn from(r: Request<Pending>) -> Self {
        AnyRequest::Pending(r)
    }
}

impl From<Request<Processing>> for AnyRequest {
    fn from(r: Request<Processing>) -> Self {
        AnyRequest::Processing(r)
    }
}

impl From<Request<Completed>> for AnyRequest {
    fn from(r: Request<Completed>) -> Self {
        AnyRequest::Completed(r)
    }
}

impl From<Request<Failed>> for AnyRequest {
    fn from(r: Request<Failed>) -> Self {
        AnyRequest::Failed(r)
    }
}
