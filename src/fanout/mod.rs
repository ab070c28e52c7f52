//! Execution fan-out: runs the steps of one request and joins their outcomes.
//!
//! Step failures (errors and panics) are captured into the step's own outcome and
//! never abort the run. The only error `run` returns is an orchestration fault,
//! raised before any step starts.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::join_all;
use metrics::{counter, histogram};
use tokio::time::Instant;

use crate::error::Result;
use crate::request::{ExecutionMode, RequestData, RequestId};
use crate::step::{ResolvedStep, StepExecutor, StepRegistry};

pub mod outcome;

pub use outcome::{AggregateResult, StepOutcome, StepStatus};

/// Everything one run produced.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    /// One per resolved step, in declared order.
    pub outcomes: Vec<StepOutcome>,
    pub aggregate: AggregateResult,
}

impl ExecutionReport {
    /// Names of the steps that reported an error.
    pub fn failed_steps(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter(|o| !o.is_success())
            .map(|o| o.step_name.clone())
            .collect()
    }
}

/// Runs resolved steps in the request's execution mode.
#[derive(Clone, Debug)]
pub struct FanOut {
    registry: Arc<StepRegistry>,
}

impl FanOut {
    pub fn new(registry: Arc<StepRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    /// Run every selected step and build the aggregate.
    ///
    /// Always yields exactly one outcome per selected step, even if all of them fail.
    #[tracing::instrument(skip(self, request), fields(request_id = %request.id, mode = request.execution_mode.as_str()))]
    pub async fn run(&self, request: &RequestData) -> Result<ExecutionReport> {
        let steps = self.registry.resolve(request.steps.as_deref())?;

        tracing::debug!(steps = steps.len(), "Starting fan-out");
        let started = Instant::now();

        let outcomes = match request.execution_mode {
            ExecutionMode::Sequential => run_sequential(request.id, &request.input, steps).await,
            ExecutionMode::Parallel => run_parallel(request.id, &request.input, steps).await,
        };

        let total_duration = started.elapsed();
        let aggregate = AggregateResult::from_outcomes(request.id, &outcomes, total_duration);

        tracing::info!(
            succeeded = aggregate.succeeded,
            failed = aggregate.failed,
            total_duration = ?total_duration,
            "Fan-out finished"
        );

        Ok(ExecutionReport {
            outcomes,
            aggregate,
        })
    }
}

async fn run_sequential(
    request_id: RequestId,
    input: &str,
    steps: Vec<ResolvedStep>,
) -> Vec<StepOutcome> {
    let mut outcomes = Vec::with_capacity(steps.len());
    for step in steps {
        outcomes.push(run_step(request_id, step.name, step.executor, input).await);
    }
    outcomes
}

async fn run_parallel(
    request_id: RequestId,
    input: &str,
    steps: Vec<ResolvedStep>,
) -> Vec<StepOutcome> {
    let input: Arc<str> = Arc::from(input);
    let names: Vec<String> = steps.iter().map(|s| s.name.clone()).collect();

    let handles = steps.into_iter().map(|step| {
        let input = input.clone();
        tokio::spawn(async move { run_step(request_id, step.name, step.executor, &input).await })
    });

    // Join on every step; one step's failure never cancels its siblings.
    join_all(handles)
        .await
        .into_iter()
        .zip(names)
        .map(|(joined, name)| match joined {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(step = %name, error = %e, "Step task did not complete");
                error_outcome(request_id, name, Duration::ZERO, format!("step task failed: {}", e))
            }
        })
        .collect()
}

async fn run_step(
    request_id: RequestId,
    name: String,
    executor: Arc<dyn StepExecutor>,
    input: &str,
) -> StepOutcome {
    let started = Instant::now();
    let result = AssertUnwindSafe(executor.execute(input)).catch_unwind().await;
    let duration = started.elapsed();

    let outcome = match result {
        Ok(Ok(result_data)) => StepOutcome {
            request_id,
            step_name: name,
            result_data,
            duration,
            status: StepStatus::Success,
            error_message: None,
            created_at: chrono::Utc::now(),
        },
        Ok(Err(e)) => {
            tracing::warn!(step = %name, error = %format!("{:#}", e), "Step failed");
            error_outcome(request_id, name, duration, format!("{:#}", e))
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            tracing::error!(step = %name, panic = %message, "Step panicked");
            error_outcome(request_id, name, duration, format!("step panicked: {}", message))
        }
    };

    counter!(
        "volley_steps_total",
        "step" => outcome.step_name.clone(),
        "status" => outcome.status.as_str()
    )
    .increment(1);
    histogram!("volley_step_duration_seconds", "step" => outcome.step_name.clone())
        .record(outcome.duration.as_secs_f64());

    outcome
}

fn error_outcome(
    request_id: RequestId,
    step_name: String,
    duration: Duration,
    message: String,
) -> StepOutcome {
    StepOutcome {
        request_id,
        step_name,
        result_data: serde_json::json!({}),
        duration,
        status: StepStatus::Error,
        error_message: Some(message),
        created_at: chrono::Utc::now(),
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::VolleyError;
    use crate::step::MockStep;

    fn request(mode: ExecutionMode) -> RequestData {
        RequestData {
            id: RequestId::new(),
            input: "the quick brown fox".to_string(),
            execution_mode: mode,
            steps: None,
            delivery_target: None,
            created_at: chrono::Utc::now(),
        }
    }

    fn fan_out(steps: Vec<(&str, MockStep)>) -> FanOut {
        let mut registry = StepRegistry::new();
        for (name, step) in steps {
            registry.register(name, Arc::new(step)).unwrap();
        }
        FanOut::new(Arc::new(registry))
    }

    #[tokio::test(start_paused = true)]
    async fn sequential_runs_in_order_and_accumulates_time() {
        let fan_out = fan_out(vec![
            ("a", MockStep::echo().with_delay(Duration::from_millis(100))),
            ("b", MockStep::failing("nope").with_delay(Duration::from_millis(200))),
            ("c", MockStep::echo().with_delay(Duration::from_millis(300))),
        ]);

        let report = fan_out.run(&request(ExecutionMode::Sequential)).await.unwrap();

        let names: Vec<_> = report.outcomes.iter().map(|o| o.step_name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(report.failed_steps(), vec!["b".to_string()]);
        assert_eq!(report.aggregate.total_duration, Duration::from_millis(600));
        assert_eq!(report.outcomes[1].result_data, serde_json::json!({}));
        assert_eq!(report.outcomes[1].error_message.as_deref(), Some("nope"));
        assert_eq!(
            report.outcomes[2].result_data,
            serde_json::json!({ "echo": "the quick brown fox" })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn parallel_overlaps_steps() {
        let fan_out = fan_out(vec![
            ("a", MockStep::echo().with_delay(Duration::from_millis(100))),
            ("b", MockStep::echo().with_delay(Duration::from_millis(300))),
            ("c", MockStep::echo().with_delay(Duration::from_millis(200))),
        ]);

        let report = fan_out.run(&request(ExecutionMode::Parallel)).await.unwrap();

        assert_eq!(report.outcomes.len(), 3);
        assert_eq!(report.aggregate.total_duration, Duration::from_millis(300));
        let names: Vec<_> = report.outcomes.iter().map(|o| o.step_name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn parallel_failure_does_not_disturb_siblings() {
        let delays = [100u64, 250, 400];

        let baseline = fan_out(vec![
            ("a", MockStep::echo().with_delay(Duration::from_millis(delays[0]))),
            ("b", MockStep::echo().with_delay(Duration::from_millis(delays[1]))),
            ("c", MockStep::echo().with_delay(Duration::from_millis(delays[2]))),
        ])
        .run(&request(ExecutionMode::Parallel))
        .await
        .unwrap();

        for k in 0..3 {
            let steps = (0..3)
                .map(|i| {
                    let name = ["a", "b", "c"][i];
                    let step = if i == k {
                        MockStep::failing("injected")
                    } else {
                        MockStep::echo()
                    };
                    (name, step.with_delay(Duration::from_millis(delays[i])))
                })
                .collect();
            let report = fan_out(steps).run(&request(ExecutionMode::Parallel)).await.unwrap();

            for i in (0..3).filter(|i| *i != k) {
                assert_eq!(report.outcomes[i].status, StepStatus::Success);
                assert_eq!(report.outcomes[i].duration, baseline.outcomes[i].duration);
                assert_eq!(report.outcomes[i].result_data, baseline.outcomes[i].result_data);
            }
            assert_eq!(report.outcomes[k].status, StepStatus::Error);
        }
    }

    #[tokio::test]
    async fn panicking_step_becomes_an_error_outcome() {
        for mode in [ExecutionMode::Sequential, ExecutionMode::Parallel] {
            let fan_out = fan_out(vec![
                ("a", MockStep::panicking("kaboom")),
                ("b", MockStep::echo()),
            ]);
            let report = fan_out.run(&request(mode)).await.unwrap();
            assert_eq!(report.outcomes.len(), 2);
            assert_eq!(report.outcomes[0].status, StepStatus::Error);
            assert!(
                report.outcomes[0]
                    .error_message
                    .as_deref()
                    .unwrap()
                    .contains("kaboom")
            );
            assert_eq!(report.outcomes[1].status, StepStatus::Success);
        }
    }

    #[tokio::test]
    async fn every_step_failing_still_yields_an_aggregate() {
        for mode in [ExecutionMode::Sequential, ExecutionMode::Parallel] {
            let fan_out = fan_out(vec![
                ("a", MockStep::failing("x")),
                ("b", MockStep::failing("y")),
            ]);
            let report = fan_out.run(&request(mode)).await.unwrap();
            assert_eq!(report.outcomes.len(), 2);
            assert_eq!(report.aggregate.failed, 2);
            assert_eq!(report.aggregate.succeeded, 0);
        }
    }

    #[tokio::test]
    async fn unresolvable_selection_runs_nothing() {
        let step = MockStep::echo();
        let fan_out = fan_out(vec![("a", step.clone())]);
        let mut req = request(ExecutionMode::Parallel);
        req.steps = Some(vec!["missing".to_string()]);

        let err = fan_out.run(&req).await.unwrap_err();
        assert!(matches!(err, VolleyError::OrchestrationFault { .. }));
        assert_eq!(step.call_count(), 0);
    }
}
