use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use taskweave_core::error::{Result, WeaveError};
use taskweave_core::traits::Step;
use taskweave_core::types::StepSpec;

/// Registry of available step implementations, keyed by kind.
///
/// Step kinds form an open set: anything can be registered at assembly
/// time as long as the key is unique.
pub struct StepRegistry {
    steps: HashMap<String, Arc<dyn Step>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self {
            steps: HashMap::new(),
        }
    }

    /// Register a step. Duplicate kinds are a configuration error.
    pub fn register(&mut self, step: impl Step) -> Result<()> {
        let name = step.name().to_string();
        if self.steps.contains_key(&name) {
            return Err(WeaveError::Configuration(format!(
                "step kind '{}' registered twice",
                name
            )));
        }
        self.steps.insert(name, Arc::new(step));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Step>> {
        self.steps.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.steps.contains_key(name)
    }

    /// Registered kinds with their specs, for prompt rendering.
    pub fn specs(&self) -> Vec<(String, StepSpec)> {
        let mut specs: Vec<_> = self
            .steps
            .values()
            .map(|s| (s.name().to_string(), s.spec()))
            .collect();
        specs.sort_by(|(a, _), (b, _)| a.cmp(b));
        specs
    }

    pub fn names(&self) -> Vec<&str> {
        self.steps.keys().map(|s| s.as_str()).collect()
    }

    /// Execute a single attempt of a step: validate parameters against
    /// the spec, fill optional defaults, and enforce the per-attempt
    /// timeout. Retrying is the wrapper's job, not the registry's.
    pub async fn execute(
        &self,
        name: &str,
        params: serde_json::Value,
        timeout_override: Option<Duration>,
    ) -> Result<serde_json::Value> {
        let step = self
            .get(name)
            .ok_or_else(|| WeaveError::StepNotFound(name.to_string()))?;

        let params = apply_spec(name, &step.spec(), params)?;

        let timeout = timeout_override
            .unwrap_or_else(|| Duration::from_secs(step.timeout_secs()));

        match tokio::time::timeout(timeout, step.execute(params)).await {
            Ok(result) => result,
            Err(_) => Err(WeaveError::StepTimeout {
                step: name.to_string(),
                timeout_secs: timeout.as_secs(),
            }),
        }
    }
}

impl Default for StepRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Check required parameters and fill optional defaults.
fn apply_spec(
    step: &str,
    spec: &StepSpec,
    params: serde_json::Value,
) -> Result<serde_json::Value> {
    let mut map = match params {
        serde_json::Value::Object(map) => map,
        serde_json::Value::Null => serde_json::Map::new(),
        other => {
            return Err(WeaveError::Configuration(format!(
                "step '{}' expects an object of parameters, got {}",
                step, other
            )));
        }
    };

    for required in &spec.required {
        if !map.contains_key(&required.name) {
            return Err(WeaveError::Configuration(format!(
                "step '{}' missing required parameter '{}'",
                step, required.name
            )));
        }
    }

    for optional in &spec.optional {
        if !map.contains_key(&optional.name) {
            if let Some(default) = &optional.default {
                map.insert(optional.name.clone(), default.clone());
            }
        }
    }

    Ok(serde_json::Value::Object(map))
}
