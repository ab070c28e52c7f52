//! PostgreSQL implementation of Storage.
//!
//! Status transitions are guarded in SQL (`WHERE state = ANY(predecessors)`) and
//! every ledger insert shares a transaction with a conditional update of
//! `delivery_attempts`, so concurrent writers in different processes get the same
//! guarantees as the in-memory backend.

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::postgres::{PgPool, PgRow};
use uuid::Uuid;

use super::{ReconcileCriteria, Storage};
use crate::delivery::{DeliveryAttempt, DeliveryState, DeliveryStatus, DeliveryTarget};
use crate::error::{Result, VolleyError};
use crate::fanout::{AggregateResult, StepOutcome};
use crate::request::{
    AnyRequest, Completed, Failed, FailureReason, Pending, Processing, Request, RequestData,
    RequestId, RequestInput, RequestState, RequestStatus,
};

const REQUEST_COLUMNS: &str = "id, input, execution_mode, steps, delivery_url, delivery_secret, \
     state, started_at, completed_at, failed_at, error, \
     delivery_status, delivery_attempts, last_attempt_at, created_at, updated_at";

/// PostgreSQL storage backend.
///
/// # Example
/// ```ignore
/// let pool = PgPool::connect("postgresql://localhost/volley").await?;
/// volley::migrator().run(&pool).await?;
/// let storage = Arc::new(PostgresStorage::new(pool));
/// ```
#[derive(Clone)]
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn ensure_exists(&self, id: RequestId) -> Result<()> {
        let found = sqlx::query("SELECT 1 FROM requests WHERE id = $1")
            .bind(*id as Uuid)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| VolleyError::Other(anyhow!("Failed to look up request: {}", e)))?;
        found.map(|_| ()).ok_or(VolleyError::RequestNotFound(id))
    }

    async fn current_status(&self, id: RequestId) -> Result<RequestStatus> {
        let row = sqlx::query("SELECT state FROM requests WHERE id = $1")
            .bind(*id as Uuid)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| VolleyError::Other(anyhow!("Failed to look up request: {}", e)))?
            .ok_or(VolleyError::RequestNotFound(id))?;
        let state: String = get(&row, "state")?;
        parse(&state)
    }
}

fn get<'r, T>(row: &'r PgRow, column: &str) -> Result<T>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(column)
        .map_err(|e| VolleyError::Other(anyhow!("Failed to read column '{}': {}", column, e)))
}

fn parse<T>(value: &str) -> Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    value
        .parse()
        .map_err(|e: String| VolleyError::Other(anyhow!(e)))
}

fn request_from_row(row: &PgRow) -> Result<AnyRequest> {
    let steps: Option<serde_json::Value> = get(row, "steps")?;
    let delivery_url: Option<String> = get(row, "delivery_url")?;
    let delivery_secret: Option<String> = get(row, "delivery_secret")?;
    let execution_mode: String = get(row, "execution_mode")?;

    let data = RequestData {
        id: RequestId(get(row, "id")?),
        input: get(row, "input")?,
        execution_mode: parse(&execution_mode)?,
        steps: steps.map(serde_json::from_value).transpose()?,
        delivery_target: delivery_url.map(|url| DeliveryTarget {
            url,
            secret: delivery_secret,
        }),
        created_at: get(row, "created_at")?,
    };

    let delivery_status: String = get(row, "delivery_status")?;
    let delivery = DeliveryState {
        status: parse(&delivery_status)?,
        attempts: get::<i32>(row, "delivery_attempts")? as u32,
        last_attempt_at: get(row, "last_attempt_at")?,
    };
    let updated_at: DateTime<Utc> = get(row, "updated_at")?;
    let started_at: Option<DateTime<Utc>> = get(row, "started_at")?;

    let state: String = get(row, "state")?;
    let id = data.id;
    let missing = |column: &str| {
        VolleyError::Other(anyhow!("Request {} in state '{}' has no {}", id, state, column))
    };

    let request = match parse::<RequestStatus>(&state)? {
        RequestStatus::Pending => AnyRequest::Pending(Request {
            state: Pending {},
            data,
            delivery,
            updated_at,
        }),
        RequestStatus::Processing => {
            let started_at = started_at.ok_or_else(|| missing("started_at"))?;
            AnyRequest::Processing(Request {
                state: Processing { started_at },
                data,
                delivery,
                updated_at,
            })
        }
        RequestStatus::Completed => {
            let started_at = started_at.ok_or_else(|| missing("started_at"))?;
            let completed_at: Option<DateTime<Utc>> = get(row, "completed_at")?;
            let completed_at = completed_at.ok_or_else(|| missing("completed_at"))?;
            AnyRequest::Completed(Request {
                state: Completed {
                    started_at,
                    completed_at,
                },
                data,
                delivery,
                updated_at,
            })
        }
        RequestStatus::Failed => {
            let error: Option<serde_json::Value> = get(row, "error")?;
            let reason: FailureReason = serde_json::from_value(
                error.ok_or_else(|| missing("error"))?,
            )?;
            let failed_at: Option<DateTime<Utc>> = get(row, "failed_at")?;
            let failed_at = failed_at.ok_or_else(|| missing("failed_at"))?;
            AnyRequest::Failed(Request {
                state: Failed {
                    reason,
                    started_at,
                    failed_at,
                },
                data,
                delivery,
                updated_at,
            })
        }
    };
    Ok(request)
}

fn attempt_from_row(row: &PgRow) -> Result<DeliveryAttempt> {
    Ok(DeliveryAttempt {
        id: get(row, "id")?,
        request_id: RequestId(get(row, "request_id")?),
        target_url: get(row, "target_url")?,
        payload_snapshot: get(row, "payload_snapshot")?,
        attempt_number: get::<i32>(row, "attempt_number")? as u32,
        status_code: get::<Option<i32>>(row, "status_code")?.map(|code| code as u16),
        response_snapshot: get(row, "response_snapshot")?,
        error_message: get(row, "error_message")?,
        created_at: get(row, "created_at")?,
    })
}

#[async_trait]
impl Storage for PostgresStorage {
    async fn create_request(&self, input: RequestInput) -> Result<Request<Pending>> {
        let id = RequestId::new();
        let data = input.into_data(id);
        let delivery = DeliveryState::initial(data.delivery_target.is_some());
        let steps = data.steps.as_ref().map(serde_json::to_value).transpose()?;

        sqlx::query(
            r#"
            INSERT INTO requests (
                id, input, execution_mode, steps, delivery_url, delivery_secret,
                state, delivery_status, delivery_attempts, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, 'pending', $7, 0, $8, $8)
            "#,
        )
        .bind(*id as Uuid)
        .bind(&data.input)
        .bind(data.execution_mode.as_str())
        .bind(steps)
        .bind(data.delivery_target.as_ref().map(|t| t.url.clone()))
        .bind(data.delivery_target.as_ref().and_then(|t| t.secret.clone()))
        .bind(delivery.status.as_str())
        .bind(data.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| VolleyError::Other(anyhow!("Failed to create request: {}", e)))?;

        Ok(Request {
            state: Pending {},
            delivery,
            updated_at: data.created_at,
            data,
        })
    }

    async fn get_request(&self, id: RequestId) -> Result<AnyRequest> {
        let row = sqlx::query(&format!("SELECT {REQUEST_COLUMNS} FROM requests WHERE id = $1"))
            .bind(*id as Uuid)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| VolleyError::Other(anyhow!("Failed to fetch request: {}", e)))?
            .ok_or(VolleyError::RequestNotFound(id))?;
        request_from_row(&row)
    }

    async fn persist<T: RequestState + Clone>(&self, request: &Request<T>) -> Result<()>
    where
        AnyRequest: From<Request<T>>,
    {
        let id = request.data.id;
        let predecessors: Vec<String> = T::STATUS
            .predecessors()
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();

        let query = match AnyRequest::from(request.clone()) {
            // Nothing precedes Pending; the guard below always rejects it.
            AnyRequest::Pending(req) => sqlx::query(
                "UPDATE requests SET state = 'pending', updated_at = $2 \
                 WHERE id = $1 AND state = ANY($3)",
            )
            .bind(*id as Uuid)
            .bind(req.updated_at)
            .bind(predecessors),
            AnyRequest::Processing(req) => sqlx::query(
                "UPDATE requests SET state = 'processing', started_at = $4, updated_at = $2 \
                 WHERE id = $1 AND state = ANY($3)",
            )
            .bind(*id as Uuid)
            .bind(req.updated_at)
            .bind(predecessors)
            .bind(req.state.started_at),
            AnyRequest::Completed(req) => sqlx::query(
                "UPDATE requests SET state = 'completed', started_at = $4, completed_at = $5, \
                 updated_at = $2 WHERE id = $1 AND state = ANY($3)",
            )
            .bind(*id as Uuid)
            .bind(req.updated_at)
            .bind(predecessors)
            .bind(req.state.started_at)
            .bind(req.state.completed_at),
            AnyRequest::Failed(req) => {
                let error = serde_json::to_value(&req.state.reason).map_err(|e| {
                    VolleyError::Other(anyhow!("Failed to serialize failure reason: {}", e))
                })?;
                sqlx::query(
                    "UPDATE requests SET state = 'failed', started_at = $4, failed_at = $5, \
                     error = $6, updated_at = $2 WHERE id = $1 AND state = ANY($3)",
                )
                .bind(*id as Uuid)
                .bind(req.updated_at)
                .bind(predecessors)
                .bind(req.state.started_at)
                .bind(req.state.failed_at)
                .bind(error)
            }
        };

        let rows_affected = query
            .execute(&self.pool)
            .await
            .map_err(|e| VolleyError::Other(anyhow!("Failed to update request: {}", e)))?
            .rows_affected();

        if rows_affected == 0 {
            let current = self.current_status(id).await?;
            return Err(VolleyError::InvalidState(
                id,
                current.to_string(),
                T::STATUS
                    .predecessors()
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(" or "),
            ));
        }
        Ok(())
    }

    async fn list_requests_by_status(&self, status: RequestStatus) -> Result<Vec<AnyRequest>> {
        let rows = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS} FROM requests WHERE state = $1 ORDER BY created_at ASC"
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| VolleyError::Other(anyhow!("Failed to list requests: {}", e)))?;

        rows.iter().map(request_from_row).collect()
    }

    async fn save_results(
        &self,
        id: RequestId,
        outcomes: &[StepOutcome],
        aggregate: &AggregateResult,
    ) -> Result<()> {
        self.ensure_exists(id).await?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| VolleyError::Other(anyhow!("Failed to begin transaction: {}", e)))?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO aggregate_results
                (request_id, results, succeeded, failed, total_duration_secs, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (request_id) DO NOTHING
            "#,
        )
        .bind(*id as Uuid)
        .bind(serde_json::to_value(&aggregate.results)?)
        .bind(aggregate.succeeded as i32)
        .bind(aggregate.failed as i32)
        .bind(aggregate.total_duration.as_secs_f64())
        .bind(aggregate.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| VolleyError::Other(anyhow!("Failed to insert aggregate: {}", e)))?
        .rows_affected();

        if inserted == 0 {
            return Err(VolleyError::InvalidState(
                id,
                "results recorded".into(),
                "no results".into(),
            ));
        }

        for (position, outcome) in outcomes.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO step_outcomes (
                    request_id, position, step_name, result_data, duration_secs,
                    status, error_message, created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(*id as Uuid)
            .bind(position as i32)
            .bind(&outcome.step_name)
            .bind(&outcome.result_data)
            .bind(outcome.duration.as_secs_f64())
            .bind(outcome.status.as_str())
            .bind(&outcome.error_message)
            .bind(outcome.created_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| VolleyError::Other(anyhow!("Failed to insert step outcome: {}", e)))?;
        }

        tx.commit()
            .await
            .map_err(|e| VolleyError::Other(anyhow!("Failed to commit transaction: {}", e)))?;
        Ok(())
    }

    async fn get_step_outcomes(&self, id: RequestId) -> Result<Vec<StepOutcome>> {
        self.ensure_exists(id).await?;
        let rows = sqlx::query(
            r#"
            SELECT step_name, result_data, duration_secs, status, error_message, created_at
            FROM step_outcomes
            WHERE request_id = $1
            ORDER BY position ASC
            "#,
        )
        .bind(*id as Uuid)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| VolleyError::Other(anyhow!("Failed to fetch step outcomes: {}", e)))?;

        rows.iter()
            .map(|row| {
                let status: String = get(row, "status")?;
                let duration = std::time::Duration::try_from_secs_f64(get(row, "duration_secs")?)
                    .map_err(|e| VolleyError::Other(anyhow!("Invalid step duration: {}", e)))?;
                Ok(StepOutcome {
                    request_id: id,
                    step_name: get(row, "step_name")?,
                    result_data: get(row, "result_data")?,
                    duration,
                    status: parse(&status)?,
                    error_message: get(row, "error_message")?,
                    created_at: get(row, "created_at")?,
                })
            })
            .collect()
    }

    async fn get_aggregate(&self, id: RequestId) -> Result<Option<AggregateResult>> {
        self.ensure_exists(id).await?;
        let row = sqlx::query(
            r#"
            SELECT results, succeeded, failed, total_duration_secs, created_at
            FROM aggregate_results
            WHERE request_id = $1
            "#,
        )
        .bind(*id as Uuid)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| VolleyError::Other(anyhow!("Failed to fetch aggregate: {}", e)))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let total_duration =
            std::time::Duration::try_from_secs_f64(get(&row, "total_duration_secs")?)
                .map_err(|e| VolleyError::Other(anyhow!("Invalid total duration: {}", e)))?;
        Ok(Some(AggregateResult {
            request_id: id,
            results: serde_json::from_value(get(&row, "results")?)?,
            succeeded: get::<i32>(&row, "succeeded")? as usize,
            failed: get::<i32>(&row, "failed")? as usize,
            total_duration,
            created_at: get(&row, "created_at")?,
        }))
    }

    async fn record_delivery_attempt(
        &self,
        attempt: &DeliveryAttempt,
        expected_previous: u32,
        status: Option<DeliveryStatus>,
    ) -> Result<DeliveryState> {
        let id = attempt.request_id;
        if attempt.attempt_number != expected_previous + 1 {
            return Err(VolleyError::DeliveryConflict(id));
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| VolleyError::Other(anyhow!("Failed to begin transaction: {}", e)))?;

        // A concurrent writer holding the row lock makes this wait, then re-check
        // the predicate against the committed counter.
        let updated = sqlx::query(
            r#"
            UPDATE requests SET
                delivery_attempts = $3,
                last_attempt_at = $4,
                delivery_status = COALESCE($5, delivery_status)
            WHERE id = $1 AND delivery_attempts = $2
            RETURNING delivery_status, delivery_attempts, last_attempt_at
            "#,
        )
        .bind(*id as Uuid)
        .bind(expected_previous as i32)
        .bind(attempt.attempt_number as i32)
        .bind(attempt.created_at)
        .bind(status.map(|s| s.as_str()))
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| VolleyError::Other(anyhow!("Failed to update delivery counters: {}", e)))?;

        let Some(row) = updated else {
            drop(tx);
            self.ensure_exists(id).await?;
            return Err(VolleyError::DeliveryConflict(id));
        };

        sqlx::query(
            r#"
            INSERT INTO delivery_attempts (
                id, request_id, target_url, payload_snapshot, attempt_number,
                status_code, response_snapshot, error_message, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(attempt.id)
        .bind(*id as Uuid)
        .bind(&attempt.target_url)
        .bind(&attempt.payload_snapshot)
        .bind(attempt.attempt_number as i32)
        .bind(attempt.status_code.map(i32::from))
        .bind(&attempt.response_snapshot)
        .bind(&attempt.error_message)
        .bind(attempt.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| VolleyError::Other(anyhow!("Failed to insert delivery attempt: {}", e)))?;

        tx.commit()
            .await
            .map_err(|e| VolleyError::Other(anyhow!("Failed to commit transaction: {}", e)))?;

        let delivery_status: String = get(&row, "delivery_status")?;
        Ok(DeliveryState {
            status: parse(&delivery_status)?,
            attempts: get::<i32>(&row, "delivery_attempts")? as u32,
            last_attempt_at: get(&row, "last_attempt_at")?,
        })
    }

    async fn set_delivery_status(&self, id: RequestId, status: DeliveryStatus) -> Result<()> {
        let rows_affected = sqlx::query("UPDATE requests SET delivery_status = $2 WHERE id = $1")
            .bind(*id as Uuid)
            .bind(status.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| VolleyError::Other(anyhow!("Failed to update delivery status: {}", e)))?
            .rows_affected();

        if rows_affected == 0 {
            return Err(VolleyError::RequestNotFound(id));
        }
        Ok(())
    }

    async fn list_delivery_attempts(&self, id: RequestId) -> Result<Vec<DeliveryAttempt>> {
        self.ensure_exists(id).await?;
        let rows = sqlx::query(
            r#"
            SELECT id, request_id, target_url, payload_snapshot, attempt_number,
                   status_code, response_snapshot, error_message, created_at
            FROM delivery_attempts
            WHERE request_id = $1
            ORDER BY attempt_number DESC
            "#,
        )
        .bind(*id as Uuid)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| VolleyError::Other(anyhow!("Failed to fetch delivery attempts: {}", e)))?;

        rows.iter().map(attempt_from_row).collect()
    }

    async fn prune_delivery_attempts(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let deleted = sqlx::query("DELETE FROM delivery_attempts WHERE created_at < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await
            .map_err(|e| VolleyError::Other(anyhow!("Failed to prune delivery attempts: {}", e)))?
            .rows_affected();
        Ok(deleted)
    }

    async fn find_reconcilable(&self, criteria: &ReconcileCriteria) -> Result<Vec<RequestId>> {
        let rows = sqlx::query(
            r#"
            SELECT id
            FROM requests
            WHERE state = 'completed'
              AND delivery_url IS NOT NULL
              AND delivery_attempts < $1
              AND (
                  delivery_status = 'failed'
                  OR (delivery_status = 'pending'
                      AND COALESCE(last_attempt_at, updated_at) < $2)
              )
            ORDER BY COALESCE(last_attempt_at, updated_at) ASC
            LIMIT $3
            "#,
        )
        .bind(criteria.max_attempts as i32)
        .bind(criteria.stalled_before)
        .bind(criteria.limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| VolleyError::Other(anyhow!("Failed to find reconcilable requests: {}", e)))?;

        rows.iter()
            .map(|row| Ok(RequestId(get(row, "id")?)))
            .collect()
    }

    async fn delete_request(&self, id: RequestId) -> Result<()> {
        let rows_affected = sqlx::query("DELETE FROM requests WHERE id = $1")
            .bind(*id as Uuid)
            .execute(&self.pool)
            .await
            .map_err(|e| VolleyError::Other(anyhow!("Failed to delete request: {}", e)))?
            .rows_affected();

        if rows_affected == 0 {
            return Err(VolleyError::RequestNotFound(id));
        }
        Ok(())
    }
}
