//! Cancellable, single-flight periodic jobs.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// A job run on a fixed interval until cancelled.
///
/// At most one run is active at a time: a tick or a [`run_now`](Self::run_now)
/// that arrives while a run is in progress is skipped, not queued.
#[derive(Clone, Debug)]
pub struct PeriodicTask {
    name: &'static str,
    period: Duration,
    running: Arc<Mutex<()>>,
}

impl PeriodicTask {
    pub fn new(name: &'static str, period: Duration) -> Self {
        Self {
            name,
            period,
            running: Arc::new(Mutex::new(())),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_running(&self) -> bool {
        self.running.try_lock().is_err()
    }

    /// Run the job once now, or return `None` if a run is already active.
    pub async fn run_now<F, Fut, T>(&self, job: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let Ok(_running) = self.running.try_lock() else {
            tracing::debug!(task = self.name, "Previous run still active, skipping");
            return None;
        };
        Some(job().await)
    }

    /// Spawn the ticker. The first run happens one period after spawning.
    pub fn spawn<F, Fut>(&self, shutdown: CancellationToken, job: F) -> JoinHandle<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let task = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + task.period, task.period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            tracing::info!(
                task = task.name,
                interval = ?task.period,
                "Periodic task started"
            );

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        // A cancelled run stops at its next await point.
                        tokio::select! {
                            _ = task.run_now(&job) => {}
                            _ = shutdown.cancelled() => break,
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
            tracing::info!(task = task.name, "Periodic task stopped");
        })
    }
}
