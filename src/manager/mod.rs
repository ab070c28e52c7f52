//! Storage contract for requests, step outcomes, aggregates and the delivery ledger.
//!
//! A request owns its outcomes, its aggregate and its ledger rows; deleting the
//! request removes all of them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::delivery::{DeliveryAttempt, DeliveryState, DeliveryStatus};
use crate::error::Result;
use crate::fanout::{AggregateResult, StepOutcome};
use crate::request::{
    AnyRequest, Pending, Request, RequestId, RequestInput, RequestState, RequestStatus,
};

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::InMemoryStorage;

/// Selection for the reconciliation sweep.
///
/// Matches requests that have a delivery target, are Completed, have
/// `delivery_attempts < max_attempts`, and whose delivery either
/// - is Failed, or
/// - is still Pending with no activity since `stalled_before`.
#[derive(Debug, Clone)]
pub struct ReconcileCriteria {
    pub max_attempts: u32,
    pub stalled_before: DateTime<Utc>,
    pub limit: usize,
}

impl ReconcileCriteria {
    /// Evaluate the predicate against one stored request.
    pub fn matches(&self, request: &AnyRequest) -> bool {
        if request.status() != RequestStatus::Completed
            || request.data().delivery_target.is_none()
        {
            return false;
        }
        let delivery = request.delivery();
        if delivery.attempts >= self.max_attempts {
            return false;
        }
        match delivery.status {
            DeliveryStatus::Failed => true,
            DeliveryStatus::Pending => {
                delivery.last_attempt_at.unwrap_or(request.updated_at()) < self.stalled_before
            }
            DeliveryStatus::None | DeliveryStatus::Sent => false,
        }
    }
}

/// Storage trait for persisting and querying requests.
///
/// Request writes are forward-only: `persist` refuses to store a state whose
/// predecessor is not the currently stored status, so no status is ever revisited.
/// Delivery counters are only changed through the delivery methods.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Insert a new request in the Pending state.
    async fn create_request(&self, input: RequestInput) -> Result<Request<Pending>>;

    /// Get a request by ID.
    async fn get_request(&self, id: RequestId) -> Result<AnyRequest>;

    /// Store a new state for an existing request.
    ///
    /// Fails with `InvalidState` if the stored status cannot move to `T::STATUS`.
    async fn persist<T: RequestState + Clone>(&self, request: &Request<T>) -> Result<()>
    where
        AnyRequest: From<Request<T>>;

    /// All requests in `status`, oldest first.
    async fn list_requests_by_status(&self, status: RequestStatus) -> Result<Vec<AnyRequest>>;

    /// Store the step outcomes and the aggregate of a request. Allowed once.
    async fn save_results(
        &self,
        id: RequestId,
        outcomes: &[StepOutcome],
        aggregate: &AggregateResult,
    ) -> Result<()>;

    /// Outcomes in the order they were produced.
    async fn get_step_outcomes(&self, id: RequestId) -> Result<Vec<StepOutcome>>;

    async fn get_aggregate(&self, id: RequestId) -> Result<Option<AggregateResult>>;

    /// Append a ledger row and advance the request's delivery counters, atomically.
    ///
    /// The write only happens if the stored `delivery_attempts` still equals
    /// `expected_previous` and `attempt.attempt_number == expected_previous + 1`;
    /// otherwise `DeliveryConflict` is returned and nothing changes. When
    /// `status` is given, the delivery status is updated in the same write.
    async fn record_delivery_attempt(
        &self,
        attempt: &DeliveryAttempt,
        expected_previous: u32,
        status: Option<DeliveryStatus>,
    ) -> Result<DeliveryState>;

    /// Set the delivery status without recording an attempt.
    async fn set_delivery_status(&self, id: RequestId, status: DeliveryStatus) -> Result<()>;

    /// Ledger rows for a request, newest first.
    async fn list_delivery_attempts(&self, id: RequestId) -> Result<Vec<DeliveryAttempt>>;

    /// Delete ledger rows created before `older_than`. Returns the number deleted.
    async fn prune_delivery_attempts(&self, older_than: DateTime<Utc>) -> Result<u64>;

    /// IDs of requests matching `criteria`, least recently touched first.
    async fn find_reconcilable(&self, criteria: &ReconcileCriteria) -> Result<Vec<RequestId>>;

    /// Delete a request with its outcomes, aggregate and ledger rows.
    async fn delete_request(&self, id: RequestId) -> Result<()>;
}
