//! Daemon and delivery configuration.
//!
//! [`DaemonConfig`] carries every knob with production defaults. It can be
//! deserialized, built in code, or overlaid from `VOLLEY_*` environment variables
//! with [`DaemonConfig::from_env`]. [`DeliveryConfig`] is the subset the delivery
//! engine needs and is derived from it.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VolleyError};
use crate::http::HttpResponse;

/// Predicate function to determine if a delivery response should be retried.
///
/// Only consulted for non-2xx responses. Transport failures are classified separately.
pub type ShouldRetryFn = Arc<dyn Fn(&HttpResponse) -> bool + Send + Sync>;

/// Default retry predicate: every non-2xx status is retried except 4xx, where
/// only 429 is. Other 4xx responses are terminal rejections.
pub fn default_should_retry(response: &HttpResponse) -> bool {
    response.status == 429 || !(400..500).contains(&response.status)
}

fn default_should_retry_fn() -> ShouldRetryFn {
    Arc::new(default_should_retry)
}

/// Sliding-window submission limit per client key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub max_requests: usize,
    pub window_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window_ms: 60_000,
        }
    }
}

/// Configuration for the daemon.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Maximum number of requests processed at once
    pub worker_concurrency: usize,

    /// Capacity of the submission queue
    pub queue_capacity: usize,

    /// Interval for logging daemon status in milliseconds.
    /// Set to None to disable periodic status logging
    pub status_log_interval_ms: Option<u64>,

    /// How many times a worker task that panicked is restarted before the
    /// request is marked failed
    pub max_task_restarts: u32,

    /// Requests found in "processing" at startup for longer than this are marked
    /// failed (milliseconds). This handles crashes mid fan-out.
    pub processing_timeout_ms: u64,

    /// Maximum accepted input length in characters
    pub max_input_length: usize,

    /// Submission rate limit. None disables it.
    pub rate_limit: Option<RateLimitConfig>,

    /// How often the reconciliation sweep runs (milliseconds)
    pub reconciliation_interval_ms: u64,

    /// Maximum number of requests one reconciliation pass picks up
    pub reconciliation_batch_size: usize,

    /// Maximum number of deliveries one reconciliation pass runs at once
    pub reconciliation_concurrency: usize,

    /// A pending delivery with no activity for this long is considered stalled
    /// and picked up by the reconciliation sweep (milliseconds)
    pub delivery_stall_ms: u64,

    /// How often the retention sweep runs (milliseconds)
    pub retention_interval_ms: u64,

    /// Ledger rows older than this many days are pruned
    pub retention_days: u32,

    /// Maximum delivery attempts per request, across all invocations
    pub max_delivery_attempts: u32,

    /// Back-off schedule between delivery attempts. The last value repeats.
    pub retry_delays_ms: Vec<u64>,

    /// Timeout for each delivery attempt in milliseconds
    pub delivery_timeout_ms: u64,

    /// Maximum number of characters of a response body kept in the ledger
    pub response_snapshot_limit: usize,

    /// Predicate function to determine if a non-2xx response should be retried.
    /// Defaults to retrying 5xx and 429 status codes.
    #[serde(skip, default = "default_should_retry_fn")]
    pub should_retry: ShouldRetryFn,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            worker_concurrency: 10,
            queue_capacity: 1024,
            status_log_interval_ms: Some(30_000),
            max_task_restarts: 1,
            processing_timeout_ms: 600_000, // 10 minutes
            max_input_length: 10_000,
            rate_limit: Some(RateLimitConfig::default()),
            reconciliation_interval_ms: 300_000, // 5 minutes
            reconciliation_batch_size: 100,
            reconciliation_concurrency: 4,
            delivery_stall_ms: 600_000,        // 10 minutes
            retention_interval_ms: 86_400_000, // daily
            retention_days: 30,
            max_delivery_attempts: 3,
            retry_delays_ms: vec![1_000, 5_000, 15_000],
            delivery_timeout_ms: 30_000,
            response_snapshot_limit: 1_000,
            should_retry: Arc::new(default_should_retry),
        }
    }
}

impl std::fmt::Debug for DaemonConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonConfig")
            .field("worker_concurrency", &self.worker_concurrency)
            .field("queue_capacity", &self.queue_capacity)
            .field("max_task_restarts", &self.max_task_restarts)
            .field("rate_limit", &self.rate_limit)
            .field("reconciliation_interval_ms", &self.reconciliation_interval_ms)
            .field("retention_interval_ms", &self.retention_interval_ms)
            .field("retention_days", &self.retention_days)
            .field("max_delivery_attempts", &self.max_delivery_attempts)
            .field("retry_delays_ms", &self.retry_delays_ms)
            .field("delivery_timeout_ms", &self.delivery_timeout_ms)
            .finish_non_exhaustive()
    }
}

impl DaemonConfig {
    /// Defaults overlaid with `VOLLEY_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overlaid with values from `lookup`, keyed by environment variable name.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let mut config = Self::default();

        if let Some(v) = env.usize("VOLLEY_WORKER_CONCURRENCY")? {
            config.worker_concurrency = v;
        }
        if let Some(v) = env.usize("VOLLEY_QUEUE_CAPACITY")? {
            config.queue_capacity = v;
        }
        if let Some(v) = env.u64("VOLLEY_STATUS_LOG_INTERVAL_MS")? {
            config.status_log_interval_ms = (v > 0).then_some(v);
        }
        if let Some(v) = env.u32("VOLLEY_MAX_TASK_RESTARTS")? {
            config.max_task_restarts = v;
        }
        if let Some(v) = env.u64("VOLLEY_PROCESSING_TIMEOUT_MS")? {
            config.processing_timeout_ms = v;
        }
        if let Some(v) = env.usize("VOLLEY_MAX_INPUT_LENGTH")? {
            config.max_input_length = v;
        }
        if let Some(v) = env.usize("VOLLEY_RATE_LIMIT_REQUESTS")? {
            config.rate_limit = if v == 0 {
                None
            } else {
                Some(RateLimitConfig {
                    max_requests: v,
                    ..config.rate_limit.unwrap_or_default()
                })
            };
        }
        if let Some(v) = env.u64("VOLLEY_RATE_LIMIT_WINDOW_MS")?
            && let Some(limit) = config.rate_limit.as_mut()
        {
            limit.window_ms = v;
        }
        if let Some(v) = env.u64("VOLLEY_RECONCILIATION_INTERVAL_MS")? {
            config.reconciliation_interval_ms = v;
        }
        if let Some(v) = env.usize("VOLLEY_RECONCILIATION_BATCH_SIZE")? {
            config.reconciliation_batch_size = v;
        }
        if let Some(v) = env.usize("VOLLEY_RECONCILIATION_CONCURRENCY")? {
            config.reconciliation_concurrency = v;
        }
        if let Some(v) = env.u64("VOLLEY_DELIVERY_STALL_MS")? {
            config.delivery_stall_ms = v;
        }
        if let Some(v) = env.u64("VOLLEY_RETENTION_INTERVAL_MS")? {
            config.retention_interval_ms = v;
        }
        if let Some(v) = env.u32("VOLLEY_RETENTION_DAYS")? {
            config.retention_days = v;
        }
        if let Some(v) = env.u32("VOLLEY_WEBHOOK_MAX_ATTEMPTS")? {
            config.max_delivery_attempts = v;
        }
        if let Some(v) = env.list_u64("VOLLEY_WEBHOOK_RETRY_DELAYS_MS")? {
            config.retry_delays_ms = v;
        }
        if let Some(v) = env.u64("VOLLEY_WEBHOOK_TIMEOUT_MS")? {
            config.delivery_timeout_ms = v;
        }
        if let Some(v) = env.usize("VOLLEY_RESPONSE_SNAPSHOT_LIMIT")? {
            config.response_snapshot_limit = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the daemon cannot run with.
    pub fn validate(&self) -> Result<()> {
        if !(1..=10).contains(&self.max_delivery_attempts) {
            return Err(VolleyError::Config(format!(
                "max_delivery_attempts must be between 1 and 10, got {}",
                self.max_delivery_attempts
            )));
        }
        if !(1_000..=300_000).contains(&self.delivery_timeout_ms) {
            return Err(VolleyError::Config(format!(
                "delivery_timeout_ms must be between 1000 and 300000, got {}",
                self.delivery_timeout_ms
            )));
        }
        if self.retry_delays_ms.is_empty() {
            return Err(VolleyError::Config(
                "retry_delays_ms must contain at least one delay".into(),
            ));
        }

        let non_zero = [
            ("worker_concurrency", self.worker_concurrency as u64),
            ("queue_capacity", self.queue_capacity as u64),
            ("reconciliation_interval_ms", self.reconciliation_interval_ms),
            ("reconciliation_batch_size", self.reconciliation_batch_size as u64),
            ("reconciliation_concurrency", self.reconciliation_concurrency as u64),
            ("retention_interval_ms", self.retention_interval_ms),
            ("max_input_length", self.max_input_length as u64),
        ];
        for (name, value) in non_zero {
            if value == 0 {
                return Err(VolleyError::Config(format!("{name} must be greater than 0")));
            }
        }
        if let Some(limit) = self.rate_limit
            && (limit.max_requests == 0 || limit.window_ms == 0)
        {
            return Err(VolleyError::Config(
                "rate_limit requires non-zero max_requests and window_ms".into(),
            ));
        }
        if matches!(self.status_log_interval_ms, Some(0)) {
            return Err(VolleyError::Config(
                "status_log_interval_ms must be greater than 0 when set".into(),
            ));
        }
        Ok(())
    }

    pub fn retention_window(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days))
    }
}

/// Settings the delivery engine runs with.
#[derive(Clone)]
pub struct DeliveryConfig {
    pub max_attempts: u32,
    pub retry_delays: Vec<Duration>,
    pub timeout_ms: u64,
    pub response_snapshot_limit: usize,
    pub should_retry: ShouldRetryFn,
}

impl DeliveryConfig {
    /// Sleep taken after a retryable failure of `attempt` (1-based).
    ///
    /// `delay[min(attempt - 1, len - 1)]`: the last value repeats.
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let Some(last) = self.retry_delays.len().checked_sub(1) else {
            return Duration::ZERO;
        };
        let index = (attempt.saturating_sub(1) as usize).min(last);
        self.retry_delays[index]
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        (&DaemonConfig::default()).into()
    }
}

impl From<&DaemonConfig> for DeliveryConfig {
    fn from(config: &DaemonConfig) -> Self {
        DeliveryConfig {
            max_attempts: config.max_delivery_attempts,
            retry_delays: config
                .retry_delays_ms
                .iter()
                .copied()
                .map(Duration::from_millis)
                .collect(),
            timeout_ms: config.delivery_timeout_ms,
            response_snapshot_limit: config.response_snapshot_limit,
            should_retry: config.should_retry.clone(),
        }
    }
}

impl std::fmt::Debug for DeliveryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryConfig")
            .field("max_attempts", &self.max_attempts)
            .field("retry_delays", &self.retry_delays)
            .field("timeout_ms", &self.timeout_ms)
            .field("response_snapshot_limit", &self.response_snapshot_limit)
            .finish_non_exhaustive()
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).and_then(|v| {
            let trimmed = v.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    fn parse<T>(&self, name: &str, kind: &str) -> Result<Option<T>>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<T>()
            .map(Some)
            .map_err(|e| VolleyError::Config(format!("{name} must be a {kind}: {e}")))
    }

    fn u32(&self, name: &str) -> Result<Option<u32>> {
        self.parse(name, "u32")
    }

    fn u64(&self, name: &str) -> Result<Option<u64>> {
        self.parse(name, "u64")
    }

    fn usize(&self, name: &str) -> Result<Option<usize>> {
        self.parse(name, "usize")
    }

    /// Accepts a JSON array (`[1000,5000]`) or comma-separated values.
    fn list_u64(&self, name: &str) -> Result<Option<Vec<u64>>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        if v.starts_with('[') {
            return serde_json::from_str::<Vec<u64>>(&v).map(Some).map_err(|e| {
                VolleyError::Config(format!("{name} must be a JSON array of integers: {e}"))
            });
        }
        v.split(',')
            .map(|part| {
                part.trim().parse::<u64>().map_err(|e| {
                    VolleyError::Config(format!("{name} must be a list of u64 values: {e}"))
                })
            })
            .collect::<Result<Vec<_>>>()
            .map(Some)
    }
}
