//! In-process storage backend.
//!
//! Every operation takes a single lock, so each write is atomic with respect to
//! every other. Used by tests and by single-process deployments that do not need
//! durability.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{ReconcileCriteria, Storage};
use crate::delivery::{DeliveryAttempt, DeliveryState, DeliveryStatus};
use crate::error::{Result, VolleyError};
use crate::fanout::{AggregateResult, StepOutcome};
use crate::request::{
    AnyRequest, Pending, Request, RequestId, RequestInput, RequestState, RequestStatus,
};

struct Row {
    request: AnyRequest,
    outcomes: Vec<StepOutcome>,
    aggregate: Option<AggregateResult>,
    /// Oldest first.
    attempts: Vec<DeliveryAttempt>,
    history: Vec<RequestStatus>,
}

/// Storage backed by a map behind a mutex.
#[derive(Default)]
pub struct InMemoryStorage {
    rows: Mutex<HashMap<RequestId, Row>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every status the request has been stored with, in order.
    pub fn status_history(&self, id: RequestId) -> Vec<RequestStatus> {
        self.rows
            .lock()
            .get(&id)
            .map(|row| row.history.clone())
            .unwrap_or_default()
    }

    /// Number of stored requests.
    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }

    /// Total ledger rows across all requests.
    pub fn attempt_count(&self) -> usize {
        self.rows.lock().values().map(|r| r.attempts.len()).sum()
    }

    /// Overwrite a request's delivery counters. Test setup only; bypasses the
    /// compare-and-swap.
    pub fn force_delivery_state(&self, id: RequestId, state: DeliveryState) -> Result<()> {
        let mut rows = self.rows.lock();
        let row = rows.get_mut(&id).ok_or(VolleyError::RequestNotFound(id))?;
        *row.request.delivery_mut() = state;
        Ok(())
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn create_request(&self, input: RequestInput) -> Result<Request<Pending>> {
        let id = RequestId::new();
        let data = input.into_data(id);
        let request = Request {
            state: Pending {},
            delivery: DeliveryState::initial(data.delivery_target.is_some()),
            updated_at: data.created_at,
            data,
        };

        self.rows.lock().insert(
            id,
            Row {
                request: AnyRequest::Pending(request.clone()),
                outcomes: Vec::new(),
                aggregate: None,
                attempts: Vec::new(),
                history: vec![RequestStatus::Pending],
            },
        );
        Ok(request)
    }

    async fn get_request(&self, id: RequestId) -> Result<AnyRequest> {
        self.rows
            .lock()
            .get(&id)
            .map(|row| row.request.clone())
            .ok_or(VolleyError::RequestNotFound(id))
    }

    async fn persist<T: RequestState + Clone>(&self, request: &Request<T>) -> Result<()>
    where
        AnyRequest: From<Request<T>>,
    {
        let id = request.data.id;
        let mut rows = self.rows.lock();
        let row = rows.get_mut(&id).ok_or(VolleyError::RequestNotFound(id))?;

        let current = row.request.status();
        if !current.can_transition_to(T::STATUS) {
            return Err(VolleyError::InvalidState(
                id,
                current.to_string(),
                T::STATUS
                    .predecessors()
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(" or "),
            ));
        }

        let delivery = row.request.delivery().clone();
        let mut next = AnyRequest::from(request.clone());
        *next.delivery_mut() = delivery;
        row.request = next;
        row.history.push(T::STATUS);
        Ok(())
    }

    async fn list_requests_by_status(&self, status: RequestStatus) -> Result<Vec<AnyRequest>> {
        let mut found: Vec<AnyRequest> = self
            .rows
            .lock()
            .values()
            .filter(|row| row.request.status() == status)
            .map(|row| row.request.clone())
            .collect();
        found.sort_by_key(|r| r.data().created_at);
        Ok(found)
    }

    async fn save_results(
        &self,
        id: RequestId,
        outcomes: &[StepOutcome],
        aggregate: &AggregateResult,
    ) -> Result<()> {
        let mut rows = self.rows.lock();
        let row = rows.get_mut(&id).ok_or(VolleyError::RequestNotFound(id))?;
        if row.aggregate.is_some() {
            return Err(VolleyError::InvalidState(
                id,
                "results recorded".into(),
                "no results".into(),
            ));
        }
        row.outcomes = outcomes.to_vec();
        row.aggregate = Some(aggregate.clone());
        Ok(())
    }

    async fn get_step_outcomes(&self, id: RequestId) -> Result<Vec<StepOutcome>> {
        self.rows
            .lock()
            .get(&id)
            .map(|row| row.outcomes.clone())
            .ok_or(VolleyError::RequestNotFound(id))
    }

    async fn get_aggregate(&self, id: RequestId) -> Result<Option<AggregateResult>> {
        self.rows
            .lock()
            .get(&id)
            .map(|row| row.aggregate.clone())
            .ok_or(VolleyError::RequestNotFound(id))
    }

    async fn record_delivery_attempt(
        &self,
        attempt: &DeliveryAttempt,
        expected_previous: u32,
        status: Option<DeliveryStatus>,
    ) -> Result<DeliveryState> {
        let id = attempt.request_id;
        let mut rows = self.rows.lock();
        let row = rows.get_mut(&id).ok_or(VolleyError::RequestNotFound(id))?;

        let delivery = row.request.delivery_mut();
        if delivery.attempts != expected_previous
            || attempt.attempt_number != expected_previous + 1
        {
            return Err(VolleyError::DeliveryConflict(id));
        }

        delivery.attempts = attempt.attempt_number;
        delivery.last_attempt_at = Some(attempt.created_at);
        if let Some(status) = status {
            delivery.status = status;
        }
        let state = delivery.clone();
        row.attempts.push(attempt.clone());
        Ok(state)
    }

    async fn set_delivery_status(&self, id: RequestId, status: DeliveryStatus) -> Result<()> {
        let mut rows = self.rows.lock();
        let row = rows.get_mut(&id).ok_or(VolleyError::RequestNotFound(id))?;
        row.request.delivery_mut().status = status;
        Ok(())
    }

    async fn list_delivery_attempts(&self, id: RequestId) -> Result<Vec<DeliveryAttempt>> {
        self.rows
            .lock()
            .get(&id)
            .map(|row| row.attempts.iter().rev().cloned().collect())
            .ok_or(VolleyError::RequestNotFound(id))
    }

    async fn prune_delivery_attempts(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut deleted = 0u64;
        for row in self.rows.lock().values_mut() {
            let before = row.attempts.len();
            row.attempts.retain(|a| a.created_at >= older_than);
            deleted += (before - row.attempts.len()) as u64;
        }
        Ok(deleted)
    }

    async fn find_reconcilable(&self, criteria: &ReconcileCriteria) -> Result<Vec<RequestId>> {
        let rows = self.rows.lock();
        let mut matched: Vec<(DateTime<Utc>, RequestId)> = rows
            .values()
            .filter(|row| criteria.matches(&row.request))
            .map(|row| {
                let touched = row
                    .request
                    .delivery()
                    .last_attempt_at
                    .unwrap_or(row.request.updated_at());
                (touched, row.request.id())
            })
            .collect();
        matched.sort();
        Ok(matched
            .into_iter()
            .take(criteria.limit)
            .map(|(_, id)| id)
            .collect())
    }

    async fn delete_request(&self, id: RequestId) -> Result<()> {
        self.rows
            .lock()
            .remove(&id)
            .map(|_| ())
            .ok_or(VolleyError::RequestNotFound(id))
    }
}
