//! Daemon observability types.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;

/// Lifecycle of the worker task for one submitted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting in the submission queue.
    Queued,
    /// A worker is running the request.
    Running,
    /// The worker returned; see the request for the outcome.
    Finished,
    /// The worker panicked `restarts` times so far.
    Crashed { restarts: u32 },
}

impl TaskStatus {
    /// No worker will run the request again. A crashed task is settled once
    /// no restart is pending for it.
    pub fn is_settled(&self, restart_pending: bool) -> bool {
        match self {
            TaskStatus::Finished => true,
            TaskStatus::Crashed { .. } => !restart_pending,
            TaskStatus::Queued | TaskStatus::Running => false,
        }
    }
}

/// Statistics tracked for the daemon.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DaemonStats {
    /// Requests that reached Completed.
    pub requests_processed: u64,
    /// Requests that reached Failed.
    pub requests_failed: u64,
    /// Requests currently being run.
    pub requests_in_flight: usize,
    /// Worker tasks that panicked.
    pub tasks_crashed: u64,
    pub deliveries_sent: u64,
    pub deliveries_failed: u64,
    pub deliveries_deferred: u64,
}

/// Live counters behind [`DaemonStats`].
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub requests_processed: AtomicU64,
    pub requests_failed: AtomicU64,
    pub requests_in_flight: AtomicUsize,
    pub tasks_crashed: AtomicU64,
    pub deliveries_sent: AtomicU64,
    pub deliveries_failed: AtomicU64,
    pub deliveries_deferred: AtomicU64,
}

impl Counters {
    pub fn snapshot(&self) -> DaemonStats {
        DaemonStats {
            requests_processed: self.requests_processed.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            requests_in_flight: self.requests_in_flight.load(Ordering::Relaxed),
            tasks_crashed: self.tasks_crashed.load(Ordering::Relaxed),
            deliveries_sent: self.deliveries_sent.load(Ordering::Relaxed),
            deliveries_failed: self.deliveries_failed.load(Ordering::Relaxed),
            deliveries_deferred: self.deliveries_deferred.load(Ordering::Relaxed),
        }
    }

    pub fn record_delivery(&self, outcome: crate::delivery::DeliveryOutcome) {
        use crate::delivery::DeliveryOutcome;
        let counter = match outcome {
            DeliveryOutcome::Sent => &self.deliveries_sent,
            DeliveryOutcome::Failed => &self.deliveries_failed,
            DeliveryOutcome::Deferred => &self.deliveries_deferred,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Result of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Requests matching the selection.
    pub selected: usize,
    pub sent: usize,
    pub failed: usize,
    pub deferred: usize,
    /// Deliveries that returned an error.
    pub errors: usize,
    /// Requests stuck in Processing that were marked failed.
    pub abandoned: usize,
}

/// Result of one retention pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetentionReport {
    pub attempts_deleted: u64,
    /// Task status entries dropped for requests whose worker is done.
    pub tasks_pruned: usize,
}
