//! Reconciliation and retention passes.
//!
//! Both are plain async functions over the storage and the delivery engine so they
//! can run from a [`PeriodicTask`](super::periodic::PeriodicTask) or on demand.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use metrics::counter;

use super::types::{ReconcileReport, RetentionReport};
use crate::delivery::{DeliveryEngine, DeliveryOutcome};
use crate::error::{Result, VolleyError};
use crate::http::HttpClient;
use crate::manager::{ReconcileCriteria, Storage};
use crate::request::{FailureReason, RequestStatus};

/// Mark requests stuck in Processing since before `cutoff` as failed.
///
/// A request in Processing is never re-run, so once its worker is gone the only
/// way forward is the Failed status.
pub async fn abandon_stale<S: Storage>(storage: &S, cutoff: DateTime<Utc>) -> Result<usize> {
    let stuck = storage
        .list_requests_by_status(RequestStatus::Processing)
        .await?;

    let mut abandoned = 0;
    for request in stuck {
        let id = request.id();
        let Some(processing) = request.into_processing() else {
            continue;
        };
        if processing.state.started_at >= cutoff {
            continue;
        }
        match processing.fail(FailureReason::Abandoned, storage).await {
            Ok(_) => abandoned += 1,
            // Finished by its worker in the meantime.
            Err(VolleyError::InvalidState(..)) => {
                tracing::debug!(request_id = %id, "Request left Processing concurrently");
            }
            Err(e) => return Err(e),
        }
    }

    if abandoned > 0 {
        tracing::warn!(abandoned, "Marked abandoned requests as failed");
        counter!("volley_requests_abandoned_total").increment(abandoned as u64);
    }
    Ok(abandoned)
}

/// Resume deliveries that failed or stalled.
///
/// Runs up to `concurrency` deliveries at once. The attempt budget is stored
/// per request, so repeated passes never send more than `max_attempts` times.
#[tracing::instrument(skip_all, fields(limit = criteria.limit))]
pub async fn reconcile<S, H>(
    storage: &S,
    engine: &DeliveryEngine<S, H>,
    criteria: &ReconcileCriteria,
    concurrency: usize,
) -> Result<ReconcileReport>
where
    S: Storage,
    H: HttpClient,
{
    let ids = storage.find_reconcilable(criteria).await?;
    let mut report = ReconcileReport {
        selected: ids.len(),
        ..Default::default()
    };
    if ids.is_empty() {
        tracing::trace!("Nothing to reconcile");
        return Ok(report);
    }
    tracing::info!(selected = ids.len(), "Reconciling deliveries");

    let mut results = futures::stream::iter(ids)
        .map(|id| async move { (id, engine.deliver(id).await) })
        .buffer_unordered(concurrency.max(1));

    while let Some((id, result)) = results.next().await {
        match result {
            Ok(DeliveryOutcome::Sent) => report.sent += 1,
            Ok(DeliveryOutcome::Failed) => report.failed += 1,
            Ok(DeliveryOutcome::Deferred) => report.deferred += 1,
            Err(e) => {
                tracing::error!(request_id = %id, error = %e, "Reconciliation delivery failed");
                report.errors += 1;
            }
        }
    }

    counter!("volley_reconciled_total", "outcome" => "sent").increment(report.sent as u64);
    counter!("volley_reconciled_total", "outcome" => "failed").increment(report.failed as u64);
    counter!("volley_reconciled_total", "outcome" => "deferred").increment(report.deferred as u64);
    counter!("volley_reconciled_total", "outcome" => "error").increment(report.errors as u64);

    tracing::info!(
        sent = report.sent,
        failed = report.failed,
        deferred = report.deferred,
        errors = report.errors,
        "Reconciliation pass finished"
    );
    Ok(report)
}

/// Delete ledger rows created before `older_than`.
pub async fn prune<S: Storage>(storage: &S, older_than: DateTime<Utc>) -> Result<RetentionReport> {
    let attempts_deleted = storage.prune_delivery_attempts(older_than).await?;
    counter!("volley_attempts_pruned_total").increment(attempts_deleted);
    tracing::info!(attempts_deleted, older_than = %older_than, "Retention pass finished");
    Ok(RetentionReport {
        attempts_deleted,
        ..Default::default()
    })
}
