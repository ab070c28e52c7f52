//! Daemon for processing submitted requests and delivering their results.
//!
//! A [`Daemon`] owns the submission queue, the worker pool, the delivery engine
//! and the two periodic sweeps. Callers submit work with [`Daemon::submit`] and
//! observe its progress only by polling storage.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{DaemonConfig, DeliveryConfig};
use crate::delivery::{DeliveryAttempt, DeliveryEngine, DeliveryOutcome};
use crate::error::{Result, VolleyError};
use crate::fanout::{AggregateResult, FanOut, StepOutcome};
use crate::http::HttpClient;
use crate::limiter::SubmissionLimiter;
use crate::manager::{ReconcileCriteria, Storage};
use crate::request::{AnyRequest, RequestId, RequestInput, RequestStatus};
use crate::step::StepRegistry;

pub mod periodic;
pub mod sweeps;
pub mod types;
mod worker;

pub use periodic::PeriodicTask;
pub use types::{DaemonStats, ReconcileReport, RetentionReport, TaskStatus};

use types::Counters;

/// Runs submitted requests through the fan-out and delivers their results.
pub struct Daemon<S, H>
where
    S: Storage,
    H: HttpClient,
{
    storage: Arc<S>,
    fan_out: FanOut,
    delivery: Arc<DeliveryEngine<S, H>>,
    config: DaemonConfig,
    limiter: Option<SubmissionLimiter>,
    queue_tx: mpsc::Sender<RequestId>,
    queue_rx: parking_lot::Mutex<Option<mpsc::Receiver<RequestId>>>,
    tasks: Arc<DashMap<RequestId, TaskStatus>>,
    restarts: DashMap<RequestId, u32>,
    counters: Arc<Counters>,
    shutdown_token: CancellationToken,
    reconciliation: PeriodicTask,
    retention: PeriodicTask,
}

impl<S, H> Daemon<S, H>
where
    S: Storage + 'static,
    H: HttpClient + 'static,
{
    pub fn new(
        storage: Arc<S>,
        http_client: Arc<H>,
        registry: Arc<StepRegistry>,
        config: DaemonConfig,
        shutdown_token: CancellationToken,
    ) -> Result<Self> {
        config.validate()?;
        if registry.is_empty() {
            return Err(VolleyError::Config("at least one step must be registered".into()));
        }

        let limiter = config.rate_limit.map(SubmissionLimiter::new).transpose()?;
        let delivery = DeliveryEngine::new(
            storage.clone(),
            http_client,
            DeliveryConfig::from(&config),
            shutdown_token.clone(),
        );
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity);

        Ok(Self {
            storage,
            fan_out: FanOut::new(registry),
            delivery: Arc::new(delivery),
            limiter,
            queue_tx,
            queue_rx: parking_lot::Mutex::new(Some(queue_rx)),
            tasks: Arc::new(DashMap::new()),
            restarts: DashMap::new(),
            counters: Arc::new(Counters::default()),
            shutdown_token,
            reconciliation: PeriodicTask::new(
                "reconciliation",
                Duration::from_millis(config.reconciliation_interval_ms),
            ),
            retention: PeriodicTask::new(
                "retention",
                Duration::from_millis(config.retention_interval_ms),
            ),
            config,
        })
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    pub fn limiter(&self) -> Option<&SubmissionLimiter> {
        self.limiter.as_ref()
    }

    /// Accept a request, persist it as Pending and queue it for processing.
    ///
    /// Returns as soon as the request is queued; processing runs detached.
    pub async fn submit(&self, input: RequestInput) -> Result<RequestId> {
        if self.shutdown_token.is_cancelled() {
            return Err(VolleyError::Shutdown);
        }
        self.validate_input(&input)?;
        if let Some(limiter) = &self.limiter {
            limiter.check(input.client_key.as_deref())?;
        }

        let pending = self.storage.create_request(input).await?;
        let id = pending.data.id;
        self.tasks.insert(id, TaskStatus::Queued);

        tokio::select! {
            sent = self.queue_tx.send(id) => {
                sent.map_err(|_| VolleyError::Shutdown)?;
            }
            _ = self.shutdown_token.cancelled() => {
                // Still Pending in storage; the next start picks it up.
                tracing::info!(request_id = %id, "Shutdown while queueing request");
                return Err(VolleyError::Shutdown);
            }
        }

        tracing::debug!(request_id = %id, "Request submitted");
        Ok(id)
    }

    fn validate_input(&self, input: &RequestInput) -> Result<()> {
        if input.input.trim().is_empty() {
            return Err(VolleyError::ValidationError("input must not be blank".into()));
        }
        let length = input.input.chars().count();
        if length > self.config.max_input_length {
            return Err(VolleyError::ValidationError(format!(
                "input is {length} characters, maximum is {}",
                self.config.max_input_length
            )));
        }
        if let Some(target) = &input.delivery_target {
            let url = reqwest::Url::parse(&target.url).map_err(|e| {
                VolleyError::ValidationError(format!("invalid delivery URL '{}': {e}", target.url))
            })?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(VolleyError::ValidationError(format!(
                    "delivery URL must use http or https, got '{}'",
                    url.scheme()
                )));
            }
        }
        Ok(())
    }

    /// Manually re-run delivery for a Completed request.
    pub async fn retry_delivery(&self, id: RequestId) -> Result<DeliveryOutcome> {
        let outcome = self.delivery.retry(id).await?;
        self.counters.record_delivery(outcome);
        Ok(outcome)
    }

    pub async fn get_request(&self, id: RequestId) -> Result<AnyRequest> {
        self.storage.get_request(id).await
    }

    pub async fn get_step_outcomes(&self, id: RequestId) -> Result<Vec<StepOutcome>> {
        self.storage.get_step_outcomes(id).await
    }

    pub async fn get_aggregate(&self, id: RequestId) -> Result<Option<AggregateResult>> {
        self.storage.get_aggregate(id).await
    }

    /// Ledger rows for a request, newest first.
    pub async fn list_delivery_attempts(&self, id: RequestId) -> Result<Vec<DeliveryAttempt>> {
        self.storage.list_delivery_attempts(id).await
    }

    /// Worker task status for a request submitted to this daemon.
    ///
    /// Settled entries are dropped by the retention pass, after which this is `None`.
    pub fn task_status(&self, id: RequestId) -> Option<TaskStatus> {
        self.tasks.get(&id).map(|entry| *entry)
    }

    pub fn stats(&self) -> DaemonStats {
        self.counters.snapshot()
    }

    /// Run a reconciliation pass now.
    ///
    /// Returns `None` if a pass is already running.
    pub async fn reconcile_now(&self) -> Result<Option<ReconcileReport>> {
        self.reconciliation
            .run_now(|| self.reconciliation_pass())
            .await
            .transpose()
    }

    /// Run a retention pass now.
    ///
    /// Returns `None` if a pass is already running.
    pub async fn prune_now(&self) -> Result<Option<RetentionReport>> {
        self.retention
            .run_now(|| self.retention_pass())
            .await
            .transpose()
    }

    async fn reconciliation_pass(&self) -> Result<ReconcileReport> {
        let now = Utc::now();
        let processing_cutoff =
            now - chrono::Duration::milliseconds(self.config.processing_timeout_ms as i64);
        let abandoned = sweeps::abandon_stale(self.storage.as_ref(), processing_cutoff).await?;
        self.counters
            .requests_failed
            .fetch_add(abandoned as u64, std::sync::atomic::Ordering::Relaxed);

        let criteria = ReconcileCriteria {
            max_attempts: self.delivery.config().max_attempts,
            stalled_before: now
                - chrono::Duration::milliseconds(self.config.delivery_stall_ms as i64),
            limit: self.config.reconciliation_batch_size,
        };
        let mut report = sweeps::reconcile(
            self.storage.as_ref(),
            &self.delivery,
            &criteria,
            self.config.reconciliation_concurrency,
        )
        .await?;
        report.abandoned = abandoned;

        for (outcome, count) in [
            (DeliveryOutcome::Sent, report.sent),
            (DeliveryOutcome::Failed, report.failed),
            (DeliveryOutcome::Deferred, report.deferred),
        ] {
            for _ in 0..count {
                self.counters.record_delivery(outcome);
            }
        }
        Ok(report)
    }

    async fn retention_pass(&self) -> Result<RetentionReport> {
        let older_than = Utc::now() - self.config.retention_window();
        let mut report = sweeps::prune(self.storage.as_ref(), older_than).await?;
        if let Some(limiter) = &self.limiter {
            limiter.retain_recent();
        }
        report.tasks_pruned = self.prune_settled_tasks();
        Ok(report)
    }

    /// Forget task statuses of requests no worker will touch again.
    fn prune_settled_tasks(&self) -> usize {
        let before = self.tasks.len();
        self.tasks
            .retain(|id, status| !status.is_settled(self.restarts.contains_key(id)));
        let pruned = before.saturating_sub(self.tasks.len());
        if pruned > 0 {
            tracing::debug!(pruned, tracked = self.tasks.len(), "Pruned settled task statuses");
        }
        pruned
    }

    /// Fail requests a previous process left in Processing and requeue the
    /// Pending ones that are not already queued.
    async fn recover(&self, started_at: chrono::DateTime<Utc>) -> Result<()> {
        let abandoned = sweeps::abandon_stale(self.storage.as_ref(), started_at).await?;
        self.counters
            .requests_failed
            .fetch_add(abandoned as u64, std::sync::atomic::Ordering::Relaxed);

        let pending = self
            .storage
            .list_requests_by_status(RequestStatus::Pending)
            .await?;
        let mut requeued = 0usize;
        for request in pending {
            let id = request.id();
            // Anything newer was submitted to this daemon and is already queued.
            if request.data().created_at >= started_at || self.tasks.contains_key(&id) {
                continue;
            }
            self.tasks.insert(id, TaskStatus::Queued);
            tokio::select! {
                sent = self.queue_tx.send(id) => {
                    if sent.is_err() {
                        break;
                    }
                }
                _ = self.shutdown_token.cancelled() => break,
            }
            requeued += 1;
        }

        tracing::info!(abandoned, requeued, "Recovered unfinished requests");
        Ok(())
    }

    /// Run the daemon until the shutdown token is cancelled.
    ///
    /// Spawns the worker loop, recovers work left by a previous process, then
    /// starts the reconciliation sweep, the retention sweep and the status log.
    #[tracing::instrument(skip(self))]
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let Some(queue_rx) = self.queue_rx.lock().take() else {
            return Err(VolleyError::Config("daemon is already running".into()));
        };
        tracing::info!(
            worker_concurrency = self.config.worker_concurrency,
            steps = ?self.fan_out.registry().names(),
            "Daemon starting"
        );

        let started_at = Utc::now();
        let worker = tokio::spawn(self.clone().worker_loop(queue_rx));

        if let Err(e) = self.recover(started_at).await {
            tracing::error!(error = %e, "Crash recovery failed");
        }

        let mut periodic = Vec::new();

        let this = self.clone();
        periodic.push(self.reconciliation.spawn(self.shutdown_token.clone(), move || {
            let this = this.clone();
            async move {
                if let Err(e) = this.reconciliation_pass().await {
                    tracing::error!(error = %e, "Reconciliation pass failed");
                }
            }
        }));

        let this = self.clone();
        periodic.push(self.retention.spawn(self.shutdown_token.clone(), move || {
            let this = this.clone();
            async move {
                if let Err(e) = this.retention_pass().await {
                    tracing::error!(error = %e, "Retention pass failed");
                }
            }
        }));

        if let Some(interval_ms) = self.config.status_log_interval_ms {
            let status_log = PeriodicTask::new("status_log", Duration::from_millis(interval_ms));
            let counters = self.counters.clone();
            let tasks = self.tasks.clone();
            let queue_tx = self.queue_tx.clone();
            periodic.push(status_log.spawn(self.shutdown_token.clone(), move || {
                let stats = counters.snapshot();
                let tracked = tasks.len();
                let queue_free = queue_tx.capacity();
                async move {
                    tracing::info!(
                        requests_in_flight = stats.requests_in_flight,
                        requests_processed = stats.requests_processed,
                        requests_failed = stats.requests_failed,
                        tasks_crashed = stats.tasks_crashed,
                        deliveries_sent = stats.deliveries_sent,
                        deliveries_failed = stats.deliveries_failed,
                        tracked_tasks = tracked,
                        queue_free,
                        "Daemon status"
                    );
                }
            }));
        }

        if let Err(e) = worker.await {
            tracing::error!(error = %e, "Worker loop panicked");
        }
        for handle in periodic {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Periodic task panicked");
            }
        }

        tracing::info!("Daemon stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitConfig;
    use crate::delivery::DeliveryTarget;
    use crate::http::MockHttpClient;
    use crate::manager::InMemoryStorage;
    use crate::step::MockStep;

    fn daemon(config: DaemonConfig) -> Daemon<InMemoryStorage, MockHttpClient> {
        let registry = StepRegistry::new().with_step("echo", MockStep::echo()).unwrap();
        Daemon::new(
            Arc::new(InMemoryStorage::new()),
            Arc::new(MockHttpClient::new()),
            Arc::new(registry),
            config,
            CancellationToken::new(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn submit_rejects_invalid_input() {
        let daemon = daemon(DaemonConfig {
            max_input_length: 5,
            ..Default::default()
        });

        for input in [
            RequestInput::new("   "),
            RequestInput::new("way too long"),
            RequestInput::new("ok").with_target(DeliveryTarget::new("not a url")),
            RequestInput::new("ok").with_target(DeliveryTarget::new("ftp://example.com/hook")),
        ] {
            let err = daemon.submit(input).await.unwrap_err();
            assert!(matches!(err, VolleyError::ValidationError(_)), "got {err:?}");
        }
        assert!(daemon.storage().is_empty());
    }

    #[tokio::test]
    async fn submit_persists_pending_and_queues() {
        let daemon = daemon(DaemonConfig::default());
        let id = daemon
            .submit(RequestInput::new("héllo").with_target(DeliveryTarget::new("https://example.com/h")))
            .await
            .unwrap();

        let request = daemon.get_request(id).await.unwrap();
        assert_eq!(request.status(), RequestStatus::Pending);
        assert_eq!(
            request.delivery().status,
            crate::delivery::DeliveryStatus::Pending
        );
        assert_eq!(daemon.task_status(id), Some(TaskStatus::Queued));
    }

    #[tokio::test]
    async fn submit_applies_rate_limit_per_client() {
        let daemon = daemon(DaemonConfig {
            rate_limit: Some(RateLimitConfig {
                max_requests: 2,
                window_ms: 60_000,
            }),
            ..Default::default()
        });

        for _ in 0..2 {
            daemon
                .submit(RequestInput::new("x").with_client_key("a"))
                .await
                .unwrap();
        }
        let err = daemon
            .submit(RequestInput::new("x").with_client_key("a"))
            .await
            .unwrap_err();
        assert!(matches!(err, VolleyError::RateLimited { .. }));

        daemon
            .submit(RequestInput::new("x").with_client_key("b"))
            .await
            .unwrap();

        daemon.limiter().unwrap().reset().unwrap();
        daemon
            .submit(RequestInput::new("x").with_client_key("a"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn retention_pass_drops_settled_task_statuses() {
        let daemon = daemon(DaemonConfig::default());
        let ids: Vec<RequestId> = (0..5).map(|_| RequestId::new()).collect();
        daemon.tasks.insert(ids[0], TaskStatus::Finished);
        daemon.tasks.insert(ids[1], TaskStatus::Crashed { restarts: 2 });
        daemon.tasks.insert(ids[2], TaskStatus::Crashed { restarts: 1 });
        daemon.restarts.insert(ids[2], 1);
        daemon.tasks.insert(ids[3], TaskStatus::Queued);
        daemon.tasks.insert(ids[4], TaskStatus::Running);

        let report = daemon.prune_now().await.unwrap().unwrap();
        assert_eq!(report.tasks_pruned, 2);
        assert_eq!(daemon.task_status(ids[0]), None);
        assert_eq!(daemon.task_status(ids[1]), None);
        assert_eq!(
            daemon.task_status(ids[2]),
            Some(TaskStatus::Crashed { restarts: 1 })
        );
        assert_eq!(daemon.task_status(ids[3]), Some(TaskStatus::Queued));
        assert_eq!(daemon.task_status(ids[4]), Some(TaskStatus::Running));
    }

    #[tokio::test]
    async fn submit_after_shutdown_is_refused() {
        let daemon = daemon(DaemonConfig::default());
        daemon.shutdown_token.cancel();
        let err = daemon.submit(RequestInput::new("x")).await.unwrap_err();
        assert!(matches!(err, VolleyError::Shutdown));
    }

    #[test]
    fn new_rejects_invalid_config_and_empty_registry() {
        let err = Daemon::new(
            Arc::new(InMemoryStorage::new()),
            Arc::new(MockHttpClient::new()),
            Arc::new(StepRegistry::new()),
            DaemonConfig::default(),
            CancellationToken::new(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, VolleyError::Config(_)));

        let registry = StepRegistry::new().with_step("echo", MockStep::echo()).unwrap();
        let err = Daemon::new(
            Arc::new(InMemoryStorage::new()),
            Arc::new(MockHttpClient::new()),
            Arc::new(registry),
            DaemonConfig {
                max_delivery_attempts: 0,
                ..Default::default()
            },
            CancellationToken::new(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, VolleyError::Config(_)));
    }
}
