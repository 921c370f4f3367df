use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::info;

use taskweave_core::config::WorkflowConfig;
use taskweave_core::error::{Result, WeaveError};
use taskweave_core::event::EventBus;
use taskweave_core::types::{RunId, RunStatus, WorkflowDefinition};

use crate::graph::DependencyGraph;
use crate::scheduler::{self, RunHandle, RunState};
use crate::step::StepRegistry;

/// Entry point for workflow execution: validates definitions, spawns one
/// scheduler per run, and tracks handles for control and inspection.
pub struct RunManager {
    registry: Arc<StepRegistry>,
    config: WorkflowConfig,
    bus: Arc<EventBus>,
    runs: Mutex<HashMap<RunId, Arc<RunHandle>>>,
}

impl RunManager {
    pub fn new(registry: Arc<StepRegistry>, config: WorkflowConfig, bus: Arc<EventBus>) -> Self {
        Self {
            registry,
            config,
            bus,
            runs: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<StepRegistry> {
        &self.registry
    }

    /// Validate a definition without running it: graph construction plus
    /// step-kind lookup.
    pub fn validate(&self, definition: &WorkflowDefinition) -> Result<DependencyGraph> {
        let graph = DependencyGraph::build(definition)?;
        DependencyGraph::check_kinds(definition, &self.registry)?;
        Ok(graph)
    }

    /// Validate and start a run. Execution proceeds in the background;
    /// use the returned id with `wait`, `pause`, `resume`, or `cancel`.
    pub fn submit(&self, definition: WorkflowDefinition) -> Result<RunId> {
        let graph = self.validate(&definition)?;
        let name = definition.name.clone();

        let handle = scheduler::spawn_run(
            definition,
            graph,
            Arc::clone(&self.registry),
            self.config.clone(),
            Arc::clone(&self.bus),
        );
        let run_id = handle.run_id().clone();
        info!(run_id = %run_id, workflow = name.as_deref().unwrap_or("unnamed"), "Run submitted");

        let mut runs = self
            .runs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        runs.insert(run_id.clone(), Arc::new(handle));
        Ok(run_id)
    }

    pub fn handle(&self, run_id: &RunId) -> Result<Arc<RunHandle>> {
        let runs = self
            .runs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        runs.get(run_id)
            .cloned()
            .ok_or_else(|| WeaveError::RunNotFound(run_id.0.clone()))
    }

    pub fn status(&self, run_id: &RunId) -> Result<RunStatus> {
        Ok(self.handle(run_id)?.status())
    }

    pub fn snapshot(&self, run_id: &RunId) -> Result<RunState> {
        Ok(self.handle(run_id)?.snapshot())
    }

    pub fn pause(&self, run_id: &RunId) -> Result<()> {
        self.handle(run_id)?.pause()
    }

    pub fn resume(&self, run_id: &RunId) -> Result<()> {
        self.handle(run_id)?.resume()
    }

    pub fn cancel(&self, run_id: &RunId) -> Result<()> {
        self.handle(run_id)?.cancel()
    }

    /// Wait for a run to reach a terminal status.
    pub async fn wait(&self, run_id: &RunId) -> Result<RunStatus> {
        let handle = self.handle(run_id)?;
        Ok(handle.wait().await)
    }

    pub fn run_ids(&self) -> Vec<RunId> {
        let runs = self
            .runs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        runs.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use taskweave_core::types::NodeDefinition;
    use taskweave_test_utils::StaticStep;

    fn manager() -> RunManager {
        let mut registry = StepRegistry::new();
        registry
            .register(StaticStep::new("constant", json!({"value": 1})))
            .unwrap();
        RunManager::new(
            Arc::new(registry),
            WorkflowConfig::default(),
            Arc::new(EventBus::default()),
        )
    }

    #[test]
    fn test_validate_rejects_unknown_kind() {
        let m = manager();
        let def = WorkflowDefinition::new(vec![NodeDefinition::new("a", "ghost")]);
        assert!(m.validate(&def).is_err());
    }

    #[tokio::test]
    async fn test_submit_and_wait() {
        let m = manager();
        let def = WorkflowDefinition::new(vec![NodeDefinition::new("a", "constant")]);
        let run_id = m.submit(def).unwrap();
        let status = m.wait(&run_id).await.unwrap();
        assert_eq!(status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_submit_accepts_named_and_unnamed_definitions() {
        let m = manager();

        let mut named = WorkflowDefinition::new(vec![NodeDefinition::new("a", "constant")]);
        named.name = Some("nightly-report".to_string());
        let run_id = m.submit(named).unwrap();
        assert_eq!(m.wait(&run_id).await.unwrap(), RunStatus::Completed);

        let unnamed = WorkflowDefinition::new(vec![NodeDefinition::new("a", "constant")]);
        let run_id = m.submit(unnamed).unwrap();
        assert_eq!(m.wait(&run_id).await.unwrap(), RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_unknown_run_id() {
        let m = manager();
        let ghost = RunId::new();
        assert!(matches!(
            m.status(&ghost),
            Err(WeaveError::RunNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_control_after_completion_rejected() {
        let m = manager();
        let def = WorkflowDefinition::new(vec![NodeDefinition::new("a", "constant")]);
        let run_id = m.submit(def).unwrap();
        m.wait(&run_id).await.unwrap();

        assert!(matches!(
            m.pause(&run_id),
            Err(WeaveError::RunControl { .. })
        ));
        assert!(matches!(
            m.cancel(&run_id),
            Err(WeaveError::RunControl { .. })
        ));
    }
}
