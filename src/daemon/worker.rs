//! Worker pool and supervisor.
//!
//! The worker loop takes request ids off the submission queue and runs each one
//! in its own task, at most `worker_concurrency` at a time. A task that panics is
//! restarted while its request is still Pending; otherwise the request is failed.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use futures::FutureExt;
use metrics::counter;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::{JoinError, JoinSet};

use super::Daemon;
use super::types::TaskStatus;
use crate::delivery::{DeliveryOutcome, DeliveryStatus};
use crate::error::{Result, VolleyError};
use crate::fanout::panic_message;
use crate::http::HttpClient;
use crate::manager::Storage;
use crate::request::{AnyRequest, FailureReason, RequestId, RequestStatus};

/// What a worker task hands back to the supervisor.
type TaskExit = (RequestId, std::thread::Result<Result<()>>);

impl<S, H> Daemon<S, H>
where
    S: Storage + 'static,
    H: HttpClient + 'static,
{
    pub(super) async fn worker_loop(self: Arc<Self>, mut queue_rx: mpsc::Receiver<RequestId>) {
        let semaphore = Arc::new(Semaphore::new(self.config.worker_concurrency));
        let mut join_set: JoinSet<TaskExit> = JoinSet::new();

        loop {
            let permit = tokio::select! {
                _ = self.shutdown_token.cancelled() => break,
                Some(joined) = join_set.join_next() => {
                    self.on_task_exit(joined).await;
                    continue;
                }
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let id = tokio::select! {
                _ = self.shutdown_token.cancelled() => break,
                Some(joined) = join_set.join_next() => {
                    self.on_task_exit(joined).await;
                    continue;
                }
                id = queue_rx.recv() => match id {
                    Some(id) => id,
                    None => break,
                },
            };

            self.spawn_worker(&mut join_set, id, permit);
        }

        tracing::info!(in_flight = join_set.len(), "Worker loop stopping, waiting for running tasks");
        while let Some(joined) = join_set.join_next().await {
            self.on_task_exit(joined).await;
        }
        tracing::info!("Worker loop stopped");
    }

    fn spawn_worker(
        self: &Arc<Self>,
        join_set: &mut JoinSet<TaskExit>,
        id: RequestId,
        permit: OwnedSemaphorePermit,
    ) {
        self.tasks.insert(id, TaskStatus::Running);
        self.counters.requests_in_flight.fetch_add(1, Ordering::Relaxed);

        let this = self.clone();
        join_set.spawn(async move {
            // Permit is held for the duration of this task
            let _permit = permit;
            let _in_flight = scopeguard::guard(this.counters.clone(), |counters| {
                counters.requests_in_flight.fetch_sub(1, Ordering::Relaxed);
            });

            let result = AssertUnwindSafe(this.process(id)).catch_unwind().await;
            (id, result)
        });
    }

    async fn on_task_exit(&self, joined: std::result::Result<TaskExit, JoinError>) {
        match joined {
            Ok((id, Ok(Ok(())))) => {
                self.tasks.insert(id, TaskStatus::Finished);
                self.restarts.remove(&id);
            }
            Ok((id, Ok(Err(e)))) => {
                tracing::error!(request_id = %id, error = %e, "Unexpected error processing request");
                if let Err(e) = self.fail_unfinished(id, e.to_string()).await {
                    tracing::error!(request_id = %id, error = %e, "Failed to mark request as failed");
                }
                self.tasks.insert(id, TaskStatus::Finished);
                self.restarts.remove(&id);
            }
            Ok((id, Err(panic))) => self.on_task_panic(id, panic_message(&*panic)).await,
            Err(join_error) => {
                tracing::error!(error = %join_error, "Worker task aborted");
            }
        }
    }

    async fn on_task_panic(&self, id: RequestId, message: String) {
        self.counters.tasks_crashed.fetch_add(1, Ordering::Relaxed);
        counter!("volley_tasks_crashed_total").increment(1);

        let restarts = {
            let mut entry = self.restarts.entry(id).or_insert(0);
            *entry += 1;
            *entry
        };
        self.tasks.insert(id, TaskStatus::Crashed { restarts });
        tracing::error!(request_id = %id, restarts, panic = %message, "Worker task panicked");

        let still_pending = matches!(
            self.storage.get_request(id).await,
            Ok(ref request) if request.status() == RequestStatus::Pending
        );
        if still_pending
            && restarts <= self.config.max_task_restarts
            && !self.shutdown_token.is_cancelled()
        {
            match self.queue_tx.try_send(id) {
                Ok(()) => {
                    tracing::info!(request_id = %id, restarts, "Restarting crashed worker task");
                    return;
                }
                Err(e) => {
                    tracing::warn!(request_id = %id, error = %e, "Could not requeue crashed request");
                }
            }
        }

        if let Err(e) = self
            .fail_unfinished(id, format!("worker task panicked: {message}"))
            .await
        {
            tracing::error!(request_id = %id, error = %e, "Failed to mark crashed request as failed");
        }
        self.restarts.remove(&id);
    }

    /// Run one request through its lifecycle and deliver the result.
    #[tracing::instrument(skip(self), fields(request_id = %id))]
    pub(super) async fn process(&self, id: RequestId) -> Result<()> {
        let storage = self.storage.as_ref();
        let Some(pending) = storage.get_request(id).await?.into_pending() else {
            tracing::debug!("Request is no longer pending, skipping");
            return Ok(());
        };

        let processing = match pending.start(storage).await {
            Ok(processing) => processing,
            Err(VolleyError::InvalidState(..)) => {
                tracing::debug!("Request was started by another worker, skipping");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let has_target = processing.data.delivery_target.is_some();
        tracing::info!("Processing request");

        let completed = match self.fan_out.run(&processing.data).await {
            Ok(report) => match processing.clone().finish(&report, storage).await {
                Ok(result) => result.is_completed(),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to store fan-out results");
                    let reason = FailureReason::OrchestrationFault {
                        error: e.to_string(),
                    };
                    processing.fail(reason, storage).await?;
                    false
                }
            },
            Err(e) => {
                let error = match e {
                    VolleyError::OrchestrationFault { reason } => reason,
                    other => other.to_string(),
                };
                tracing::warn!(error = %error, "Fan-out could not run");
                processing
                    .fail(FailureReason::OrchestrationFault { error }, storage)
                    .await?;
                false
            }
        };

        if completed {
            self.counters.requests_processed.fetch_add(1, Ordering::Relaxed);
            tracing::info!("Request completed successfully");
        } else {
            self.counters.requests_failed.fetch_add(1, Ordering::Relaxed);
        }

        if has_target {
            match self.delivery.deliver(id).await {
                Ok(DeliveryOutcome::Deferred) if !completed && self.shutdown_token.is_cancelled() => {
                    self.counters.record_delivery(DeliveryOutcome::Deferred);
                    self.settle_interrupted_delivery(id).await?;
                }
                Ok(outcome) => self.counters.record_delivery(outcome),
                Err(e) => tracing::error!(error = %e, "Inline delivery failed"),
            }
        }
        Ok(())
    }

    /// Close a Failed request's delivery that shutdown cut short. Reconciliation
    /// only resumes Completed requests, so it would otherwise stay Pending.
    async fn settle_interrupted_delivery(&self, id: RequestId) -> Result<()> {
        let request = self.storage.get_request(id).await?;
        if request.delivery().status == DeliveryStatus::Pending {
            self.storage
                .set_delivery_status(id, DeliveryStatus::Failed)
                .await?;
            tracing::info!(
                attempts = request.delivery().attempts,
                "Delivery for failed request interrupted by shutdown, closing as failed"
            );
        }
        Ok(())
    }

    /// Move a request that is not yet terminal to Failed.
    async fn fail_unfinished(&self, id: RequestId, error: String) -> Result<()> {
        let storage = self.storage.as_ref();
        let reason = FailureReason::OrchestrationFault { error };
        match storage.get_request(id).await? {
            AnyRequest::Pending(pending) => {
                pending.start(storage).await?.fail(reason, storage).await?;
            }
            AnyRequest::Processing(processing) => {
                processing.fail(reason, storage).await?;
            }
            AnyRequest::Completed(_) | AnyRequest::Failed(_) => return Ok(()),
        }
        self.counters.requests_failed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
