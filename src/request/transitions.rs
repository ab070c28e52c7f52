//! State transitions for requests using the typestate pattern.
//!
//! ```text
//! Request<Pending> ──start()──> Request<Processing> ──finish()──> Request<Completed>
//!                                        │                 └────> Request<Failed>  (any step errored)
//!                                        └──fail()──────────────> Request<Failed>  (orchestration fault)
//! ```
//!
//! Every transition persists the new state before returning it. The storage layer
//! refuses any write that would move a request backwards, so a stale in-memory
//! copy can never resurrect a terminal request.

use metrics::counter;

use crate::error::Result;
use crate::fanout::ExecutionReport;
use crate::manager::Storage;

use super::types::{Completed, Failed, FailureReason, Pending, Processing, Request};

/// Result of finishing a processing request.
#[derive(Debug)]
pub enum RequestCompletionResult {
    /// Every step succeeded.
    Completed(Request<Completed>),
    /// At least one step failed, or the fan-out could not run.
    Failed(Request<Failed>),
}

impl RequestCompletionResult {
    pub fn is_completed(&self) -> bool {
        matches!(self, RequestCompletionResult::Completed(_))
    }
}

impl Request<Pending> {
    /// Mark the request as Processing.
    ///
    /// Must be committed before any step runs.
    pub async fn start<S: Storage + ?Sized>(self, storage: &S) -> Result<Request<Processing>> {
        let now = chrono::Utc::now();
        let request = Request {
            data: self.data,
            delivery: self.delivery,
            state: Processing { started_at: now },
            updated_at: now,
        };
        storage.persist(&request).await?;
        tracing::debug!(request_id = %request.data.id, "Request processing started");
        Ok(request)
    }
}

impl Request<Processing> {
    /// Persist step outcomes and the aggregate, then move to the terminal status the
    /// report implies.
    pub async fn finish<S: Storage + ?Sized>(
        self,
        report: &ExecutionReport,
        storage: &S,
    ) -> Result<RequestCompletionResult> {
        storage
            .save_results(self.data.id, &report.outcomes, &report.aggregate)
            .await?;

        let failed_steps = report.failed_steps();
        if failed_steps.is_empty() {
            Ok(RequestCompletionResult::Completed(self.complete(storage).await?))
        } else {
            let reason = FailureReason::StepErrors { failed_steps };
            Ok(RequestCompletionResult::Failed(self.fail(reason, storage).await?))
        }
    }

    pub async fn complete<S: Storage + ?Sized>(self, storage: &S) -> Result<Request<Completed>> {
        let now = chrono::Utc::now();
        let request = Request {
            data: self.data,
            delivery: self.delivery,
            state: Completed {
                started_at: self.state.started_at,
                completed_at: now,
            },
            updated_at: now,
        };
        storage.persist(&request).await?;
        counter!("volley_requests_total", "status" => "completed").increment(1);
        Ok(request)
    }

    pub async fn fail<S: Storage + ?Sized>(
        self,
        reason: FailureReason,
        storage: &S,
    ) -> Result<Request<Failed>> {
        let now = chrono::Utc::now();
        let request = Request {
            data: self.data,
            delivery: self.delivery,
            state: Failed {
                reason,
                started_at: Some(self.state.started_at),
                failed_at: now,
            },
            updated_at: now,
        };
        storage.persist(&request).await?;
        counter!("volley_requests_total", "status" => "failed").increment(1);
        tracing::warn!(
            request_id = %request.data.id,
            reason = %request.state.reason.to_error_message(),
            "Request failed"
        );
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanout::{AggregateResult, StepOutcome, StepStatus};
    use crate::manager::memory::InMemoryStorage;
    use crate::request::{AnyRequest, RequestInput, RequestStatus};
    use std::time::Duration;

    fn report_with(statuses: &[(&str, StepStatus)]) -> ExecutionReport {
        let request_id = crate::request::RequestId::new();
        let outcomes: Vec<StepOutcome> = statuses
            .iter()
            .map(|(name, status)| StepOutcome {
                request_id,
                step_name: name.to_string(),
                result_data: serde_json::json!({}),
                duration: Duration::from_millis(5),
                status: *status,
                error_message: match status {
                    StepStatus::Error => Some("boom".to_string()),
                    StepStatus::Success => None,
                },
                created_at: chrono::Utc::now(),
            })
            .collect();
        let aggregate = AggregateResult::from_outcomes(request_id, &outcomes, Duration::from_millis(5));
        ExecutionReport { outcomes, aggregate }
    }

    #[tokio::test]
    async fn finish_without_errors_completes() {
        let storage = InMemoryStorage::new();
        let pending = storage.create_request(RequestInput::new("text")).await.unwrap();
        let id = pending.data.id;

        let processing = pending.start(&storage).await.unwrap();
        let report = report_with(&[("a", StepStatus::Success), ("b", StepStatus::Success)]);
        let result = processing.finish(&report, &storage).await.unwrap();
        assert!(result.is_completed());

        let stored = storage.get_request(id).await.unwrap();
        assert!(matches!(stored, AnyRequest::Completed(_)));
        assert_eq!(storage.get_step_outcomes(id).await.unwrap().len(), 2);
        assert!(storage.get_aggregate(id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn finish_with_a_step_error_fails_but_keeps_results() {
        let storage = InMemoryStorage::new();
        let pending = storage.create_request(RequestInput::new("text")).await.unwrap();
        let id = pending.data.id;

        let processing = pending.start(&storage).await.unwrap();
        let report = report_with(&[("a", StepStatus::Success), ("b", StepStatus::Error)]);
        match processing.finish(&report, &storage).await.unwrap() {
            RequestCompletionResult::Failed(failed) => {
                assert_eq!(
                    failed.state.reason,
                    FailureReason::StepErrors {
                        failed_steps: vec!["b".to_string()]
                    }
                );
            }
            other => panic!("expected failure, got {:?}", other),
        }

        assert_eq!(storage.get_step_outcomes(id).await.unwrap().len(), 2);
        assert!(storage.get_aggregate(id).await.unwrap().is_some());
        assert_eq!(
            storage.status_history(id),
            vec![
                RequestStatus::Pending,
                RequestStatus::Processing,
                RequestStatus::Failed
            ]
        );
    }

    #[tokio::test]
    async fn stale_copy_cannot_revisit_a_state() {
        let storage = InMemoryStorage::new();
        let pending = storage.create_request(RequestInput::new("text")).await.unwrap();

        let stale = pending.clone();
        let processing = pending.start(&storage).await.unwrap();
        processing.complete(&storage).await.unwrap();

        // A second worker holding the old Pending copy must not restart it.
        let err = stale.start(&storage).await.unwrap_err();
        assert!(matches!(err, crate::VolleyError::InvalidState(..)));
    }
}
