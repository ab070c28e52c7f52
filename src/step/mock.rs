//! Configurable step for tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::StepExecutor;

#[derive(Clone)]
enum Behavior {
    Ok(serde_json::Value),
    Echo,
    Fail(String),
    Panic(String),
}

/// Mock step executor.
///
/// # Example
/// ```ignore
/// let step = MockStep::failing("upstream timed out").with_delay(Duration::from_millis(50));
/// registry.register("summarize", Arc::new(step.clone()))?;
/// // ... run ...
/// assert_eq!(step.call_count(), 1);
/// ```
#[derive(Clone)]
pub struct MockStep {
    behavior: Behavior,
    delay: Option<Duration>,
    calls: Arc<AtomicUsize>,
    inputs: Arc<Mutex<Vec<String>>>,
}

impl MockStep {
    fn with_behavior(behavior: Behavior) -> Self {
        Self {
            behavior,
            delay: None,
            calls: Arc::new(AtomicUsize::new(0)),
            inputs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Always returns `value`.
    pub fn ok(value: serde_json::Value) -> Self {
        Self::with_behavior(Behavior::Ok(value))
    }

    /// Returns `{"echo": input}`.
    pub fn echo() -> Self {
        Self::with_behavior(Behavior::Echo)
    }

    /// Always returns an error with `message`.
    pub fn failing(message: impl Into<String>) -> Self {
        Self::with_behavior(Behavior::Fail(message.into()))
    }

    /// Panics with `message`.
    pub fn panicking(message: impl Into<String>) -> Self {
        Self::with_behavior(Behavior::Panic(message.into()))
    }

    /// Sleep (on the tokio clock) before producing the result.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn inputs(&self) -> Vec<String> {
        self.inputs.lock().clone()
    }
}

#[async_trait]
impl StepExecutor for MockStep {
    async fn execute(&self, input: &str) -> anyhow::Result<serde_json::Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inputs.lock().push(input.to_string());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match &self.behavior {
            Behavior::Ok(value) => Ok(value.clone()),
            Behavior::Echo => Ok(serde_json::json!({ "echo": input })),
            Behavior::Fail(message) => Err(anyhow::anyhow!("{}", message)),
            Behavior::Panic(message) => panic!("{}", message),
        }
    }
}
