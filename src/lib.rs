//! Multi-step request processing with at-least-once, signed webhook delivery.
//!
//! A [`Daemon`] accepts submitted work, runs it through a registry of independent
//! steps (in order or concurrently), persists per-step outcomes and an aggregate,
//! and then notifies the request's delivery target with an HMAC-signed callback.
//! Delivery attempts are recorded in a ledger and retried with back-off; a
//! periodic reconciliation sweep resumes deliveries that failed or stalled, and a
//! retention sweep prunes old ledger rows.
//!
//! Storage is pluggable through the [`Storage`] trait. [`InMemoryStorage`] is
//! always available; `PostgresStorage` is behind the `postgres` feature.

pub mod config;
pub mod daemon;
pub mod delivery;
pub mod error;
pub mod fanout;
pub mod http;
pub mod limiter;
pub mod manager;
pub mod request;
pub mod step;

// Re-export commonly used types
pub use config::{DaemonConfig, DeliveryConfig, RateLimitConfig};
pub use daemon::{Daemon, DaemonStats, ReconcileReport, RetentionReport, TaskStatus};
pub use delivery::{
    DeliveryAttempt, DeliveryEngine, DeliveryOutcome, DeliveryStatus, DeliveryTarget,
    SIGNATURE_HEADER, sign, verify_signature,
};
pub use error::{Result, VolleyError};
pub use fanout::{AggregateResult, ExecutionReport, FanOut, StepOutcome, StepStatus};
pub use http::{HttpClient, HttpResponse, MockHttpClient, ReqwestHttpClient};
pub use limiter::SubmissionLimiter;
#[cfg(feature = "postgres")]
pub use manager::postgres::PostgresStorage;
pub use manager::{InMemoryStorage, ReconcileCriteria, Storage};
pub use request::*;
pub use step::{MockStep, StepExecutor, StepRegistry};

/// Get the volley database migrator
///
/// Returns a migrator that can be run against a connection pool.
#[cfg(feature = "postgres")]
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}
