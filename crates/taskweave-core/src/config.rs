use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, WeaveError};
use crate::types::{RetryPolicy, TerminationCondition};

/// Top-level engine configuration.
///
/// Constructed explicitly and passed down — there is no global
/// configuration singleton; every run and every loop receives the
/// config it was built with.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub agent: AgentDefaults,
    #[serde(default)]
    pub scratchpad: ScratchpadConfig,
}

impl EngineConfig {
    /// Load from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_str(&raw)
    }

    /// Parse from a TOML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| WeaveError::Configuration(e.to_string()))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| WeaveError::Configuration(e.to_string()))
    }
}

/// Scheduler-side settings, applied per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Ready nodes dispatched in parallel within one run.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Per-attempt timeout for nodes that declare none (seconds).
    #[serde(default = "default_node_timeout")]
    pub default_timeout_secs: u64,
    /// Retry policy for nodes that declare none.
    #[serde(default)]
    pub default_retry: RetryPolicy,
    /// Whether a failed node is tolerated: `false` fails the run once
    /// no further progress is possible, `true` completes it with the
    /// failure recorded on the node.
    #[serde(default)]
    pub continue_on_failure: bool,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            default_timeout_secs: default_node_timeout(),
            default_retry: RetryPolicy::default(),
            continue_on_failure: false,
        }
    }
}

fn default_concurrency() -> usize {
    4
}

fn default_node_timeout() -> u64 {
    60
}

/// Engine-wide agent loop defaults; `AgentConfig` overrides per role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefaults {
    /// Model identifier handed to the completion service.
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// Wall-clock guard per loop run (seconds).
    #[serde(default = "default_max_duration")]
    pub max_duration_secs: u64,
    /// Scratchpad items loaded on initialize for continuity.
    #[serde(default = "default_history_items")]
    pub history_items: usize,
    /// Observations longer than this are truncated before the scratchpad.
    #[serde(default = "default_max_observation_chars")]
    pub max_observation_chars: usize,
    /// Retry policy for tool calls issued by the loop.
    #[serde(default = "default_tool_retry")]
    pub tool_retry: RetryPolicy,
    /// Retry policy for completion requests.
    #[serde(default = "default_completion_retry")]
    pub completion_retry: RetryPolicy,
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            model: default_model(),
            max_iterations: default_max_iterations(),
            max_duration_secs: default_max_duration(),
            history_items: default_history_items(),
            max_observation_chars: default_max_observation_chars(),
            tool_retry: default_tool_retry(),
            completion_retry: default_completion_retry(),
        }
    }
}

fn default_model() -> String {
    "default".to_string()
}

fn default_max_iterations() -> usize {
    8
}

fn default_max_duration() -> u64 {
    300
}

fn default_history_items() -> usize {
    20
}

fn default_max_observation_chars() -> usize {
    4000
}

fn default_tool_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 2,
        delay_ms: 250,
        backoff: 2.0,
    }
}

fn default_completion_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        delay_ms: 500,
        backoff: 2.0,
    }
}

/// Scratchpad store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScratchpadConfig {
    /// Database path; in-memory when absent.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Hard cap on stored items per conversation key.
    #[serde(default = "default_cap")]
    pub cap: usize,
    /// Expiry window in seconds.
    #[serde(default = "default_expiry_secs")]
    pub expiry_secs: u64,
}

impl Default for ScratchpadConfig {
    fn default() -> Self {
        Self {
            path: None,
            cap: default_cap(),
            expiry_secs: default_expiry_secs(),
        }
    }
}

fn default_cap() -> usize {
    100
}

fn default_expiry_secs() -> u64 {
    7 * 24 * 3600
}

/// Per-role agent configuration. Loaded once per loop instantiation and
/// immutable for that instantiation's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Opaque role identifier, unique within a team.
    pub role: String,
    /// Allowed tool set; empty means every registered step.
    #[serde(default)]
    pub tools: Vec<String>,
    /// Prompt template; the built-in ReAct template when absent.
    #[serde(default)]
    pub prompt_template: Option<String>,
    /// Model override for this role.
    #[serde(default)]
    pub model: Option<String>,
    /// Iteration bound override for this role.
    #[serde(default)]
    pub max_iterations: Option<usize>,
    /// Extra termination conditions beyond the iteration bound.
    #[serde(default)]
    pub termination: Vec<TerminationCondition>,
    /// A terminal role's own termination ends the whole team run.
    #[serde(default)]
    pub terminal: bool,
    /// Tools whose exhausted retries abort the loop instead of becoming
    /// an error observation.
    #[serde(default)]
    pub non_recoverable_tools: Vec<String>,
}

impl AgentConfig {
    pub fn new(role: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            tools: vec![],
            prompt_template: None,
            model: None,
            max_iterations: None,
            termination: vec![],
            terminal: false,
            non_recoverable_tools: vec![],
        }
    }

    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_prompt_template(mut self, template: impl Into<String>) -> Self {
        self.prompt_template = Some(template.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_max_iterations(mut self, n: usize) -> Self {
        self.max_iterations = Some(n);
        self
    }

    pub fn with_termination(mut self, condition: TerminationCondition) -> Self {
        self.termination.push(condition);
        self
    }

    pub fn terminal(mut self) -> Self {
        self.terminal = true;
        self
    }

    pub fn with_non_recoverable_tools(mut self, tools: Vec<String>) -> Self {
        self.non_recoverable_tools = tools;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.workflow.concurrency, 4);
        assert_eq!(config.workflow.default_timeout_secs, 60);
        assert!(!config.workflow.continue_on_failure);
        assert_eq!(config.agent.max_iterations, 8);
        assert_eq!(config.agent.completion_retry.max_attempts, 3);
        assert_eq!(config.scratchpad.cap, 100);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config = EngineConfig::from_str(
            r#"
[workflow]
concurrency = 8
continue_on_failure = true

[scratchpad]
cap = 50
"#,
        )
        .unwrap();

        assert_eq!(config.workflow.concurrency, 8);
        assert!(config.workflow.continue_on_failure);
        assert_eq!(config.workflow.default_timeout_secs, 60);
        assert_eq!(config.scratchpad.cap, 50);
        assert_eq!(config.scratchpad.expiry_secs, 7 * 24 * 3600);
        assert_eq!(config.agent.max_iterations, 8);
    }

    #[test]
    fn test_invalid_toml_is_configuration_error() {
        let err = EngineConfig::from_str("workflow = \"nope\"").unwrap_err();
        assert!(matches!(err, WeaveError::Configuration(_)));
    }

    #[test]
    fn test_agent_config_builder() {
        let config = AgentConfig::new("researcher")
            .with_tools(vec!["search".into()])
            .with_max_iterations(5)
            .with_termination(TerminationCondition::ByToolName {
                tools: vec!["final_answer".into()],
            })
            .terminal();

        assert_eq!(config.role, "researcher");
        assert_eq!(config.max_iterations, Some(5));
        assert!(config.terminal);
        assert_eq!(config.termination.len(), 1);
    }
}
