//! Submission rate limiting per client key.
//!
//! Owned by the daemon and passed to nothing else; there is no global limiter.
//! A quota of `max_requests` per `window_ms` allows a burst of `max_requests`
//! and replenishes one slot every `window_ms / max_requests`.

use std::num::NonZeroU32;
use std::time::Duration;

use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use parking_lot::RwLock;

use crate::config::RateLimitConfig;
use crate::error::{Result, VolleyError};

/// Key used when a submission carries no client key.
pub const ANONYMOUS_KEY: &str = "anonymous";

pub struct SubmissionLimiter {
    config: RateLimitConfig,
    limiter: RwLock<DefaultKeyedRateLimiter<String>>,
}

impl SubmissionLimiter {
    pub fn new(config: RateLimitConfig) -> Result<Self> {
        let limiter = build(config)?;
        Ok(Self {
            config,
            limiter: RwLock::new(limiter),
        })
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    /// Count one submission for `key`, or reject it.
    pub fn check(&self, key: Option<&str>) -> Result<()> {
        let key = key.unwrap_or(ANONYMOUS_KEY);
        match self.limiter.read().check_key(&key.to_string()) {
            Ok(()) => Ok(()),
            Err(_) => {
                tracing::warn!(key = %key, "Submission rate limit exceeded");
                metrics::counter!("volley_submissions_rejected_total", "reason" => "rate_limited")
                    .increment(1);
                Err(VolleyError::RateLimited {
                    key: key.to_string(),
                })
            }
        }
    }

    /// Forget every key's history.
    pub fn reset(&self) -> Result<()> {
        *self.limiter.write() = build(self.config)?;
        Ok(())
    }

    /// Drop state for keys whose quota has fully replenished.
    pub fn retain_recent(&self) {
        let limiter = self.limiter.read();
        limiter.retain_recent();
        limiter.shrink_to_fit();
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.limiter.read().len()
    }
}

impl std::fmt::Debug for SubmissionLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmissionLimiter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn build(config: RateLimitConfig) -> Result<DefaultKeyedRateLimiter<String>> {
    let burst = u32::try_from(config.max_requests)
        .ok()
        .and_then(NonZeroU32::new)
        .ok_or_else(|| {
            VolleyError::Config(format!(
                "rate limit max_requests must be between 1 and {}",
                u32::MAX
            ))
        })?;
    let period = Duration::from_millis(config.window_ms) / burst.get();
    let quota = Quota::with_period(period)
        .ok_or_else(|| VolleyError::Config("rate limit window is too short".into()))?
        .allow_burst(burst);
    Ok(RateLimiter::keyed(quota))
}
