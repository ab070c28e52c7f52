//! At-least-once, signed delivery of completion callbacks.
//!
//! # Protocol
//!
//! ```text
//! deliver(id)
//!   ├─ guard held by another caller ─────────────────────────────> Deferred
//!   ├─ load request; not terminal ───────────────────────────────> Deferred
//!   ├─ delivery already Sent ────────────────────────────────────> Sent
//!   ├─ attempts >= max ──────────────────────────────────────────> Failed
//!   └─ for attempt in attempts+1 ..= max:
//!        POST signed payload
//!        record ledger row + counters (CAS on attempts) ── lost ─> Deferred
//!        2xx ────────────────────────────────────────────────────> Sent
//!        terminal 4xx / unbuildable request ─────────────────────> Failed
//!        retryable and last attempt ─────────────────────────────> Failed
//!        retryable: sleep delay[min(attempt-1, len-1)]; shutdown ─> Deferred
//! ```
//!
//! The attempt counter lives in storage, so any number of `deliver` calls (inline,
//! manual retry, reconciliation) share one budget and never exceed it.

use std::sync::Arc;

use metrics::counter;
use tokio_util::sync::CancellationToken;

use crate::config::DeliveryConfig;
use crate::error::{Result, VolleyError};
use crate::http::{HttpClient, HttpResponse, OutboundRequest};
use crate::manager::Storage;
use crate::request::{AnyRequest, RequestId, RequestStatus};

pub mod classify;
pub mod guards;
pub mod ledger;
pub mod payload;
pub mod signature;
pub mod types;

pub use classify::{AttemptClass, classify};
pub use guards::{DeliveryGuard, DeliveryGuards};
pub use signature::{SIGNATURE_HEADER, is_valid_signature, sign, verify_signature};
pub use types::{
    DeliveryAttempt, DeliveryOutcome, DeliveryState, DeliveryStatus, DeliveryTarget,
};

/// Drives delivery attempts for terminal requests.
pub struct DeliveryEngine<S, H>
where
    S: Storage,
    H: HttpClient,
{
    storage: Arc<S>,
    http_client: Arc<H>,
    config: DeliveryConfig,
    guards: DeliveryGuards,
    shutdown: CancellationToken,
}

impl<S, H> DeliveryEngine<S, H>
where
    S: Storage,
    H: HttpClient,
{
    pub fn new(
        storage: Arc<S>,
        http_client: Arc<H>,
        config: DeliveryConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            storage,
            http_client,
            config,
            guards: DeliveryGuards::new(),
            shutdown,
        }
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    pub fn guards(&self) -> &DeliveryGuards {
        &self.guards
    }

    /// Manually re-trigger delivery for a request.
    ///
    /// Only Completed requests with a target qualify. Shares the attempt budget
    /// and the per-request guard with every other caller.
    pub async fn retry(&self, id: RequestId) -> Result<DeliveryOutcome> {
        let request = self.storage.get_request(id).await?;
        if request.data().delivery_target.is_none() {
            return Err(VolleyError::NoDeliveryTarget(id));
        }
        if request.status() != RequestStatus::Completed {
            return Err(VolleyError::InvalidState(
                id,
                request.status().to_string(),
                RequestStatus::Completed.to_string(),
            ));
        }
        tracing::info!(request_id = %id, attempts = request.delivery().attempts, "Manual delivery retry");
        self.deliver(id).await
    }

    /// Deliver the completion callback for a request.
    #[tracing::instrument(skip(self), fields(request_id = %id))]
    pub async fn deliver(&self, id: RequestId) -> Result<DeliveryOutcome> {
        let Some(_guard) = self.guards.try_acquire(id) else {
            tracing::debug!("Delivery already in progress elsewhere, deferring");
            counter!("volley_deliveries_total", "outcome" => "deferred").increment(1);
            return Ok(DeliveryOutcome::Deferred);
        };

        let outcome = self.deliver_guarded(id).await?;
        counter!("volley_deliveries_total", "outcome" => outcome.as_str()).increment(1);
        Ok(outcome)
    }

    async fn deliver_guarded(&self, id: RequestId) -> Result<DeliveryOutcome> {
        let request = self.storage.get_request(id).await?;
        let Some(target) = request.data().delivery_target.clone() else {
            return Err(VolleyError::NoDeliveryTarget(id));
        };
        if !request.is_terminal() {
            tracing::debug!(status = %request.status(), "Request not finished, deferring delivery");
            return Ok(DeliveryOutcome::Deferred);
        }

        let delivery = request.delivery().clone();
        if delivery.status == DeliveryStatus::Sent {
            tracing::debug!("Already delivered");
            return Ok(DeliveryOutcome::Sent);
        }
        let max_attempts = self.config.max_attempts;
        if delivery.attempts >= max_attempts {
            if delivery.status != DeliveryStatus::Failed {
                self.storage
                    .set_delivery_status(id, DeliveryStatus::Failed)
                    .await?;
            }
            tracing::debug!(attempts = delivery.attempts, "Delivery budget exhausted");
            return Ok(DeliveryOutcome::Failed);
        }

        let outbound = self.prepare(&request, &target).await?;
        let snapshot = ledger::snapshot_payload(&outbound.body, target.signing_secret());

        let mut previous = delivery.attempts;
        for attempt in (delivery.attempts + 1)..=max_attempts {
            let result = self
                .http_client
                .execute(&outbound, self.config.timeout_ms)
                .await;
            let class = classify(&result, &self.config.should_retry);
            let is_last = attempt == max_attempts;

            let final_status = match class {
                AttemptClass::Success => Some(DeliveryStatus::Sent),
                AttemptClass::Terminal => Some(DeliveryStatus::Failed),
                AttemptClass::Retryable if is_last => Some(DeliveryStatus::Failed),
                AttemptClass::Retryable => None,
            };

            let record = self.attempt_record(id, &target.url, &snapshot, attempt, &result);
            match self
                .storage
                .record_delivery_attempt(&record, previous, final_status)
                .await
            {
                Ok(_) => {}
                Err(VolleyError::DeliveryConflict(_)) => {
                    tracing::warn!(attempt, "Attempt counter moved concurrently, deferring");
                    return Ok(DeliveryOutcome::Deferred);
                }
                Err(e) => return Err(e),
            }
            previous = attempt;

            counter!("volley_delivery_attempts_total", "class" => class.as_str()).increment(1);
            tracing::info!(
                attempt,
                max_attempts,
                status_code = ?record.status_code,
                class = class.as_str(),
                "Delivery attempt recorded"
            );

            match class {
                AttemptClass::Success => return Ok(DeliveryOutcome::Sent),
                AttemptClass::Terminal => {
                    tracing::warn!(attempt, "Delivery rejected by receiver, not retrying");
                    return Ok(DeliveryOutcome::Failed);
                }
                AttemptClass::Retryable if is_last => {
                    tracing::warn!(attempt, "Delivery attempts exhausted");
                    return Ok(DeliveryOutcome::Failed);
                }
                AttemptClass::Retryable => {
                    let delay = self.config.backoff_after(attempt);
                    tracing::debug!(delay = ?delay, "Backing off before next attempt");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shutdown.cancelled() => {
                            tracing::info!(attempt, "Shutdown during back-off, deferring delivery");
                            return Ok(DeliveryOutcome::Deferred);
                        }
                    }
                }
            }
        }

        Ok(DeliveryOutcome::Failed)
    }

    /// Serialize and sign the payload once; every attempt sends these bytes.
    async fn prepare(&self, request: &AnyRequest, target: &DeliveryTarget) -> Result<OutboundRequest> {
        let id = request.id();
        let outcomes = self.storage.get_step_outcomes(id).await?;
        let aggregate = self.storage.get_aggregate(id).await?;
        let body = payload::build_payload(request, &outcomes, aggregate.as_ref())?;
        let signature = target
            .signing_secret()
            .map(|secret| sign(&body, secret))
            .transpose()?;

        Ok(OutboundRequest {
            request_id: id,
            url: target.url.clone(),
            body,
            signature,
            // Snapshot limit is in chars; a char is at most four bytes.
            response_limit: self.config.response_snapshot_limit.saturating_mul(4),
        })
    }

    fn attempt_record(
        &self,
        request_id: RequestId,
        url: &str,
        snapshot: &serde_json::Value,
        attempt_number: u32,
        result: &Result<HttpResponse>,
    ) -> DeliveryAttempt {
        let limit = self.config.response_snapshot_limit;
        let (status_code, response_snapshot, error_message) = match result {
            Ok(response) => {
                let error_message = if !response.is_success() {
                    Some(format!("HTTP {}", response.status))
                } else {
                    response
                        .body_error
                        .as_ref()
                        .map(|e| format!("Response body unreadable: {e}"))
                };
                (
                    Some(response.status),
                    Some(ledger::truncate_snapshot(&response.body, limit)),
                    error_message,
                )
            }
            Err(e) => (None, None, Some(ledger::truncate_snapshot(&e.to_string(), limit))),
        };

        DeliveryAttempt {
            id: uuid::Uuid::new_v4(),
            request_id,
            target_url: url.to_string(),
            payload_snapshot: snapshot.clone(),
            attempt_number,
            status_code,
            response_snapshot,
            error_message,
            created_at: chrono::Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::MockHttpClient;
    use crate::manager::InMemoryStorage;
    use crate::request::RequestInput;
    use std::time::Duration;

    const URL: &str = "https://hooks.example.com/done";

    fn engine(
        storage: Arc<InMemoryStorage>,
        http: Arc<MockHttpClient>,
        max_attempts: u32,
    ) -> DeliveryEngine<InMemoryStorage, MockHttpClient> {
        let config = DeliveryConfig {
            max_attempts,
            retry_delays: vec![Duration::from_millis(10)],
            ..DeliveryConfig::default()
        };
        DeliveryEngine::new(storage, http, config, CancellationToken::new())
    }

    async fn completed(storage: &InMemoryStorage, secret: Option<&str>) -> RequestId {
        let mut target = DeliveryTarget::new(URL);
        if let Some(secret) = secret {
            target = target.with_secret(secret);
        }
        let pending = storage
            .create_request(RequestInput::new("text").with_target(target))
            .await
            .unwrap();
        let id = pending.data.id;
        pending.start(storage).await.unwrap().complete(storage).await.unwrap();
        id
    }

    #[tokio::test]
    async fn signs_the_exact_bytes_sent() {
        let storage = Arc::new(InMemoryStorage::new());
        let http = Arc::new(MockHttpClient::new());
        http.add_statuses(URL, 200, 1);
        let id = completed(&storage, Some("topsecret")).await;

        let outcome = engine(storage.clone(), http.clone(), 3).deliver(id).await.unwrap();
        assert_eq!(outcome, DeliveryOutcome::Sent);

        let call = &http.get_calls()[0];
        let signature = call.signature.as_deref().unwrap();
        verify_signature(&call.body, signature, "topsecret").unwrap();

        let attempts = storage.list_delivery_attempts(id).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert!(attempts[0].succeeded());
        assert!(!attempts[0].payload_snapshot.to_string().contains("topsecret"));
    }

    #[tokio::test]
    async fn unsigned_without_secret() {
        let storage = Arc::new(InMemoryStorage::new());
        let http = Arc::new(MockHttpClient::new());
        http.add_statuses(URL, 204, 1);
        let id = completed(&storage, None).await;

        engine(storage, http.clone(), 3).deliver(id).await.unwrap();
        assert!(http.get_calls()[0].signature.is_none());
    }

    #[tokio::test]
    async fn already_sent_is_not_resent() {
        let storage = Arc::new(InMemoryStorage::new());
        let http = Arc::new(MockHttpClient::new());
        http.add_statuses(URL, 200, 1);
        let id = completed(&storage, None).await;
        let engine = engine(storage.clone(), http.clone(), 3);

        assert_eq!(engine.deliver(id).await.unwrap(), DeliveryOutcome::Sent);
        assert_eq!(engine.deliver(id).await.unwrap(), DeliveryOutcome::Sent);
        assert_eq!(http.call_count(), 1);
    }

    #[tokio::test]
    async fn guard_held_defers_without_sending() {
        let storage = Arc::new(InMemoryStorage::new());
        let http = Arc::new(MockHttpClient::new());
        let id = completed(&storage, None).await;
        let engine = engine(storage.clone(), http.clone(), 3);

        let _held = engine.guards().try_acquire(id).unwrap();
        assert_eq!(engine.deliver(id).await.unwrap(), DeliveryOutcome::Deferred);
        assert_eq!(http.call_count(), 0);
    }

    #[tokio::test]
    async fn pending_request_is_deferred() {
        let storage = Arc::new(InMemoryStorage::new());
        let http = Arc::new(MockHttpClient::new());
        let pending = storage
            .create_request(RequestInput::new("x").with_target(DeliveryTarget::new(URL)))
            .await
            .unwrap();

        let outcome = engine(storage, http.clone(), 3)
            .deliver(pending.data.id)
            .await
            .unwrap();
        assert_eq!(outcome, DeliveryOutcome::Deferred);
        assert_eq!(http.call_count(), 0);
    }

    #[tokio::test]
    async fn missing_target_is_an_error() {
        let storage = Arc::new(InMemoryStorage::new());
        let http = Arc::new(MockHttpClient::new());
        let pending = storage.create_request(RequestInput::new("x")).await.unwrap();
        let id = pending.data.id;
        pending.start(&*storage).await.unwrap().complete(&*storage).await.unwrap();

        let err = engine(storage, http, 3).deliver(id).await.unwrap_err();
        assert!(matches!(err, VolleyError::NoDeliveryTarget(_)));
    }

    #[tokio::test]
    async fn transport_errors_are_retried_and_recorded() {
        let storage = Arc::new(InMemoryStorage::new());
        let http = Arc::new(MockHttpClient::new());
        http.add_response(URL, Err(VolleyError::Other(anyhow::anyhow!("connection reset"))));
        http.add_statuses(URL, 200, 1);
        let id = completed(&storage, None).await;

        let outcome = engine(storage.clone(), http, 3).deliver(id).await.unwrap();
        assert_eq!(outcome, DeliveryOutcome::Sent);

        let attempts = storage.list_delivery_attempts(id).await.unwrap();
        assert_eq!(attempts.len(), 2);
        let first = &attempts[1];
        assert_eq!(first.attempt_number, 1);
        assert!(first.status_code.is_none());
        assert!(first.error_message.as_deref().unwrap().contains("connection reset"));
    }

    #[tokio::test]
    async fn response_snapshot_is_truncated() {
        let storage = Arc::new(InMemoryStorage::new());
        let http = Arc::new(MockHttpClient::new());
        http.add_response(URL, Ok(HttpResponse::new(200, "y".repeat(4000))));
        let id = completed(&storage, None).await;

        engine(storage.clone(), http, 3).deliver(id).await.unwrap();
        let attempts = storage.list_delivery_attempts(id).await.unwrap();
        assert_eq!(attempts[0].response_snapshot.as_ref().unwrap().len(), 1000);
    }

    #[tokio::test]
    async fn manual_retry_requires_completed_request() {
        let storage = Arc::new(InMemoryStorage::new());
        let http = Arc::new(MockHttpClient::new());
        let pending = storage
            .create_request(RequestInput::new("x").with_target(DeliveryTarget::new(URL)))
            .await
            .unwrap();
        let id = pending.data.id;
        pending
            .start(&*storage)
            .await
            .unwrap()
            .fail(crate::request::FailureReason::Abandoned, &*storage)
            .await
            .unwrap();

        let err = engine(storage, http.clone(), 3).retry(id).await.unwrap_err();
        assert!(matches!(err, VolleyError::InvalidState(..)));
        assert_eq!(http.call_count(), 0);
    }
}
