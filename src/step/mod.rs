//! Step executors and the registry the fan-out resolves them from.
//!
//! A step is a black box: it takes the request input and returns a JSON value or an
//! error. The registry keeps steps in declaration order, which is the order
//! sequential execution follows.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::delivery::payload::RESERVED_PAYLOAD_KEYS;
use crate::error::{Result, VolleyError};

pub mod mock;

pub use mock::MockStep;

/// A single independent processing unit.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Run the step over the request input.
    ///
    /// Errors are captured into the step's outcome; they never abort sibling steps.
    async fn execute(&self, input: &str) -> anyhow::Result<serde_json::Value>;
}

/// A step picked for one request's run.
#[derive(Clone)]
pub struct ResolvedStep {
    pub name: String,
    pub executor: Arc<dyn StepExecutor>,
}

impl std::fmt::Debug for ResolvedStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedStep").field("name", &self.name).finish()
    }
}

/// Ordered mapping of step name to implementation.
#[derive(Clone, Default)]
pub struct StepRegistry {
    steps: Vec<ResolvedStep>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a step. Names must be unique, non-empty, and must not shadow a
    /// top-level key of the delivery payload.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        executor: Arc<dyn StepExecutor>,
    ) -> Result<()> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(VolleyError::Config("step name must not be empty".into()));
        }
        if RESERVED_PAYLOAD_KEYS.contains(&name.as_str()) {
            return Err(VolleyError::Config(format!(
                "step name '{}' collides with a delivery payload field",
                name
            )));
        }
        if self.steps.iter().any(|s| s.name == name) {
            return Err(VolleyError::Config(format!(
                "step '{}' is already registered",
                name
            )));
        }
        self.steps.push(ResolvedStep { name, executor });
        Ok(())
    }

    /// Builder form of [`register`](Self::register).
    pub fn with_step(
        mut self,
        name: impl Into<String>,
        executor: impl StepExecutor + 'static,
    ) -> Result<Self> {
        self.register(name, Arc::new(executor))?;
        Ok(self)
    }

    pub fn names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Pick the steps to run for one request.
    ///
    /// `None` selects every registered step. An explicit selection keeps registry
    /// order regardless of the order it was given in.
    pub fn resolve(&self, selection: Option<&[String]>) -> Result<Vec<ResolvedStep>> {
        if self.steps.is_empty() {
            return Err(VolleyError::OrchestrationFault {
                reason: "no steps registered".into(),
            });
        }

        let Some(selection) = selection else {
            return Ok(self.steps.clone());
        };

        let mut wanted = HashSet::with_capacity(selection.len());
        for name in selection {
            if !wanted.insert(name.as_str()) {
                return Err(VolleyError::OrchestrationFault {
                    reason: format!("step '{}' selected more than once", name),
                });
            }
            if !self.steps.iter().any(|s| &s.name == name) {
                return Err(VolleyError::OrchestrationFault {
                    reason: format!("unknown step '{}'", name),
                });
            }
        }
        if wanted.is_empty() {
            return Err(VolleyError::OrchestrationFault {
                reason: "empty step selection".into(),
            });
        }

        Ok(self
            .steps
            .iter()
            .filter(|s| wanted.contains(s.name.as_str()))
            .cloned()
            .collect())
    }
}

impl std::fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepRegistry")
            .field("steps", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> StepRegistry {
        StepRegistry::new()
            .with_step("summarize", MockStep::ok(serde_json::json!("s")))
            .unwrap()
            .with_step("sentiment", MockStep::ok(serde_json::json!("p")))
            .unwrap()
            .with_step("entities", MockStep::ok(serde_json::json!([])))
            .unwrap()
    }

    #[test]
    fn resolve_all_keeps_declared_order() {
        let steps = registry().resolve(None).unwrap();
        let names: Vec<_> = steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["summarize", "sentiment", "entities"]);
    }

    #[test]
    fn resolve_subset_keeps_registry_order() {
        let selection = vec!["entities".to_string(), "summarize".to_string()];
        let steps = registry().resolve(Some(&selection)).unwrap();
        let names: Vec<_> = steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["summarize", "entities"]);
    }

    #[test]
    fn unresolvable_selections_are_orchestration_faults() {
        let reg = registry();
        for selection in [
            vec!["translate".to_string()],
            vec!["summarize".to_string(), "summarize".to_string()],
            vec![],
        ] {
            let err = reg.resolve(Some(&selection)).unwrap_err();
            assert!(
                matches!(err, VolleyError::OrchestrationFault { .. }),
                "{selection:?}: {err}"
            );
        }

        let err = StepRegistry::new().resolve(None).unwrap_err();
        assert!(matches!(err, VolleyError::OrchestrationFault { .. }));
    }

    #[test]
    fn register_rejects_duplicates_and_reserved_names() {
        let mut reg = registry();
        assert!(reg
            .register("summarize", Arc::new(MockStep::ok(serde_json::json!(1))))
            .is_err());
        assert!(reg
            .register("request_id", Arc::new(MockStep::ok(serde_json::json!(1))))
            .is_err());
        assert!(reg
            .register("  ", Arc::new(MockStep::ok(serde_json::json!(1))))
            .is_err());
        assert_eq!(reg.len(), 3);
    }
}
