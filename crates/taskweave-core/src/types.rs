use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a workflow run.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for an agent conversation.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a single node within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Ready,
    Running,
    Success,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Skipped)
    }
}

/// Lifecycle of a whole run.
///
/// Legal transitions: `Pending → Running`, `Running ⇄ Paused`,
/// `Running → {Completed, Cancelled, Failed}`, `Paused → Cancelled`.
/// Terminal states are never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Cancelled,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

/// Retry policy for a node or tool call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Total number of attempts (not re-attempts). 1 means no retry.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay between attempts.
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    /// Multiplier applied to the delay after each failed attempt.
    #[serde(default = "default_backoff")]
    pub backoff: f64,
}

fn default_max_attempts() -> u32 {
    1
}

fn default_delay_ms() -> u64 {
    500
}

fn default_backoff() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_ms: default_delay_ms(),
            backoff: default_backoff(),
        }
    }
}

impl RetryPolicy {
    pub fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }
}

/// One typed step in a workflow. Immutable once a run starts.
///
/// Dependencies are not declared explicitly: they are exactly the set of
/// node ids referenced from `params` via `{{nodeId.path}}` expressions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDefinition {
    /// Unique within a run.
    pub id: String,
    /// Selects the step implementation from the registry.
    pub kind: String,
    /// Literal values or reference expressions.
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
    /// Retry policy for this node (engine default when absent).
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    /// Per-attempt timeout override in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl NodeDefinition {
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            params: serde_json::Map::new(),
            retry: None,
            timeout_secs: None,
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }
}

/// A complete workflow graph submitted for execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    #[serde(default)]
    pub name: Option<String>,
    pub nodes: Vec<NodeDefinition>,
    /// Run-level partial-failure policy; engine default when absent.
    /// With `false` a failed node fails the run once nothing else can
    /// make progress; with `true` the run completes and per-node
    /// statuses carry the detail.
    #[serde(default)]
    pub continue_on_failure: Option<bool>,
}

impl WorkflowDefinition {
    pub fn new(nodes: Vec<NodeDefinition>) -> Self {
        Self {
            name: None,
            nodes,
            continue_on_failure: None,
        }
    }
}

/// One think/act/observe record in an agent's scratchpad. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScratchpadItem {
    #[serde(default)]
    pub thought: String,
    /// Tool name or control directive; `None` for the origin record.
    #[serde(default)]
    pub action: Option<String>,
    /// Tool result or error text; the query itself for the origin record.
    #[serde(default)]
    pub observation: String,
    /// Marks the record that seeded the conversation with its query.
    #[serde(default)]
    pub origin: bool,
    pub timestamp: DateTime<Utc>,
}

impl ScratchpadItem {
    /// The record seeding a conversation with its originating query.
    pub fn origin(query: impl Into<String>) -> Self {
        Self {
            thought: String::new(),
            action: None,
            observation: query.into(),
            origin: true,
            timestamp: Utc::now(),
        }
    }

    pub fn record(
        thought: impl Into<String>,
        action: Option<String>,
        observation: impl Into<String>,
    ) -> Self {
        Self {
            thought: thought.into(),
            action,
            observation: observation.into(),
            origin: false,
            timestamp: Utc::now(),
        }
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            arguments,
        }
    }
}

/// Outcome of a tool invocation, including retries consumed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    pub content: String,
    pub is_error: bool,
    /// Attempts consumed by the retry wrapper.
    pub attempts: u32,
}

impl ToolResult {
    pub fn success(call_id: impl Into<String>, content: impl Into<String>, attempts: u32) -> Self {
        Self {
            call_id: call_id.into(),
            content: content.into(),
            is_error: false,
            attempts,
        }
    }

    pub fn error(call_id: impl Into<String>, content: impl Into<String>, attempts: u32) -> Self {
        Self {
            call_id: call_id.into(),
            content: content.into(),
            is_error: true,
            attempts,
        }
    }
}

/// Control transfer from one role's loop to another's.
///
/// Produced as a special agent action and consumed by the team
/// coordinator — never dispatched to a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffEvent {
    pub source_role: String,
    pub target_role: String,
    /// Task description, passed to the target verbatim.
    pub task: String,
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,
}

/// Declared parameter of a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Present for optional parameters; filled in when the caller omits it.
    #[serde(default)]
    pub default: Option<serde_json::Value>,
}

impl ParamSpec {
    pub fn required(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            default: None,
        }
    }

    pub fn optional(
        name: impl Into<String>,
        description: impl Into<String>,
        default: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            default: Some(default),
        }
    }
}

/// What a step declares about itself: inputs and outputs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepSpec {
    #[serde(default)]
    pub required: Vec<ParamSpec>,
    #[serde(default)]
    pub optional: Vec<ParamSpec>,
    /// Output field names this step produces.
    #[serde(default)]
    pub outputs: Vec<String>,
}

impl StepSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_required(mut self, param: ParamSpec) -> Self {
        self.required.push(param);
        self
    }

    pub fn with_optional(mut self, param: ParamSpec) -> Self {
        self.optional.push(param);
        self
    }

    pub fn with_output(mut self, name: impl Into<String>) -> Self {
        self.outputs.push(name.into());
        self
    }
}

/// Rule that ends an agent loop, evaluated after every iteration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TerminationCondition {
    /// Fires when the just-executed tool name is in the set.
    ByToolName { tools: Vec<String> },
    /// Fires once the iteration counter reaches the bound.
    ByIterationCount { max_iterations: usize },
}

impl TerminationCondition {
    /// Evaluate against the just-executed tool (if any) and the current
    /// zero-based iteration counter.
    pub fn fires(&self, executed_tool: Option<&str>, iteration: usize) -> bool {
        match self {
            Self::ByToolName { tools } => {
                executed_tool.is_some_and(|name| tools.iter().any(|t| t == name))
            }
            Self::ByIterationCount { max_iterations } => iteration >= *max_iterations,
        }
    }
}
