use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use taskweave_core::config::{AgentConfig, AgentDefaults};
use taskweave_core::error::{Result, WeaveError};
use taskweave_core::event::{EventBus, RunEvent};
use taskweave_core::traits::{CompletionClient, ScratchpadStore};
use taskweave_core::types::{
    ConversationId, HandoffEvent, ScratchpadItem, StepSpec, TerminationCondition,
};
use taskweave_workflow::retry::execute_node;
use taskweave_workflow::step::StepRegistry;

use crate::parser::{self, AgentAction};
use crate::prompt;
use crate::team::IterationBudget;

/// Routes a handoff to another role's loop and returns the observation
/// for the source loop. Implemented by the team coordinator; a loop
/// without one treats handoffs as unavailable.
pub trait HandoffRouter: Send + Sync + 'static {
    fn route(
        &self,
        source_chat: ConversationId,
        event: HandoffEvent,
    ) -> BoxFuture<'_, Result<String>>;
}

/// How one loop run ended.
#[derive(Debug, Clone)]
pub struct LoopOutcome {
    pub answer: String,
    /// Think/act/observe cycles consumed.
    pub iterations: usize,
    /// True when the loop hit a bound (iterations or team budget) and
    /// the answer was synthesized from the scratchpad.
    pub bounded: bool,
}

/// One bounded think/act/observe loop over a conversation.
///
/// Every iteration: render the prompt from the query, the tool specs,
/// and recent scratchpad history; ask the model; execute the chosen
/// action; append the record; evaluate termination. The loop always
/// ends — the iteration bound is enforced even when no condition is
/// configured.
pub struct AgentLoop {
    config: AgentConfig,
    defaults: AgentDefaults,
    completion: Arc<dyn CompletionClient>,
    steps: Arc<StepRegistry>,
    scratchpad: Arc<dyn ScratchpadStore>,
    bus: Arc<EventBus>,
    expiry: Duration,
    cancel: CancellationToken,
    router: Option<Arc<dyn HandoffRouter>>,
    budget: Option<Arc<IterationBudget>>,
    seed: Vec<ScratchpadItem>,
}

impl AgentLoop {
    pub fn new(
        config: AgentConfig,
        defaults: AgentDefaults,
        completion: Arc<dyn CompletionClient>,
        steps: Arc<StepRegistry>,
        scratchpad: Arc<dyn ScratchpadStore>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            config,
            defaults,
            completion,
            steps,
            scratchpad,
            bus,
            expiry: Duration::from_secs(7 * 24 * 3600),
            cancel: CancellationToken::new(),
            router: None,
            budget: None,
            seed: Vec::new(),
        }
    }

    pub fn with_router(mut self, router: Arc<dyn HandoffRouter>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_budget(mut self, budget: Arc<IterationBudget>) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn with_scratchpad_expiry(mut self, expiry: Duration) -> Self {
        self.expiry = expiry;
        self
    }

    /// Records appended right after the origin, before the first
    /// iteration. The team router uses this to carry handoff context
    /// into the target conversation.
    pub fn with_seed(mut self, items: Vec<ScratchpadItem>) -> Self {
        self.seed = items;
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the loop for a query under a conversation key.
    pub async fn run(&self, chat_id: &ConversationId, query: &str) -> Result<LoopOutcome> {
        let start = Instant::now();
        let max_iterations = self
            .config
            .max_iterations
            .unwrap_or(self.defaults.max_iterations);
        let max_duration = Duration::from_secs(self.defaults.max_duration_secs);
        let model = self.config.model.as_deref().unwrap_or(&self.defaults.model);
        let template = self
            .config
            .prompt_template
            .as_deref()
            .unwrap_or(prompt::DEFAULT_TEMPLATE);

        self.bus.publish(RunEvent::LoopStarted {
            chat_id: chat_id.clone(),
            role: Some(self.config.role.clone()),
        });
        info!(chat_id = %chat_id, role = %self.config.role, "Agent loop started");

        self.scratchpad
            .append(chat_id, &ScratchpadItem::origin(query), self.expiry)
            .await?;
        for item in &self.seed {
            self.scratchpad.append(chat_id, item, self.expiry).await?;
        }

        let tool_specs = self.allowed_tool_specs();
        let tools_block = prompt::render_tools(&tool_specs);
        let iteration_bound = TerminationCondition::ByIterationCount { max_iterations };

        let mut iteration = 0usize;
        loop {
            if self.cancel.is_cancelled() {
                debug!(chat_id = %chat_id, "Agent loop cancelled");
                return Err(WeaveError::Cancelled);
            }
            if start.elapsed() > max_duration {
                self.fail(chat_id, "max duration exceeded");
                return Err(WeaveError::MaxDurationExceeded(
                    self.defaults.max_duration_secs,
                ));
            }
            if let Some(budget) = &self.budget {
                if !budget.try_consume() {
                    debug!(chat_id = %chat_id, "Team iteration budget exhausted");
                    return self.finish_bounded(chat_id, iteration).await;
                }
            }

            self.bus.publish(RunEvent::IterationStarted {
                chat_id: chat_id.clone(),
                iteration,
            });

            let history = self
                .scratchpad
                .recent(chat_id, self.defaults.history_items)
                .await?;
            let rendered = prompt::render(template, query, &tools_block, &history);

            let response = match self.completion.complete(model, rendered.clone()).await {
                Ok(r) => r,
                Err(e) => {
                    self.fail(chat_id, &e.to_string());
                    return Err(e);
                }
            };

            // One corrective re-prompt on an unparseable reply, then fail.
            let parsed = match parser::parse(&response) {
                Ok(p) => p,
                Err(first) => {
                    warn!(chat_id = %chat_id, error = %first, "Unparseable reply, re-prompting");
                    let retry = self
                        .completion
                        .complete(model, prompt::corrective(&rendered, &first.to_string()))
                        .await?;
                    match parser::parse(&retry) {
                        Ok(p) => p,
                        Err(e) => {
                            self.fail(chat_id, &e.to_string());
                            return Err(e);
                        }
                    }
                }
            };

            self.bus.publish(RunEvent::Thought {
                chat_id: chat_id.clone(),
                text: parsed.thought.clone(),
            });

            let mut executed_tool: Option<String> = None;
            let (action_label, observation) = match parsed.action {
                AgentAction::FinalAnswer { answer } => {
                    self.scratchpad
                        .append(
                            chat_id,
                            &ScratchpadItem::record(
                                parsed.thought,
                                Some("final_answer".to_string()),
                                &answer,
                            ),
                            self.expiry,
                        )
                        .await?;
                    return self.finish(chat_id, answer, iteration + 1, false);
                }
                AgentAction::ToolCall { name, arguments } => {
                    let observation = self
                        .execute_tool(chat_id, &name, arguments, &mut executed_tool)
                        .await?;
                    (Some(name), observation)
                }
                AgentAction::Handoff {
                    target_role,
                    task,
                    context,
                } => {
                    let label = format!("handoff:{}", target_role);
                    let observation = self
                        .issue_handoff(chat_id, target_role, task, context)
                        .await?;
                    (Some(label), observation)
                }
            };

            let observation = truncate(&observation, self.defaults.max_observation_chars);
            self.scratchpad
                .append(
                    chat_id,
                    &ScratchpadItem::record(parsed.thought, action_label, &observation),
                    self.expiry,
                )
                .await?;

            // Termination, evaluated after observe: configured conditions
            // first, then the always-on iteration bound.
            for condition in &self.config.termination {
                if condition.fires(executed_tool.as_deref(), iteration) {
                    return match condition {
                        TerminationCondition::ByToolName { .. } => {
                            self.finish(chat_id, observation, iteration + 1, false)
                        }
                        TerminationCondition::ByIterationCount { .. } => {
                            self.finish_bounded(chat_id, iteration + 1).await
                        }
                    };
                }
            }
            if iteration_bound.fires(executed_tool.as_deref(), iteration) {
                return self.finish_bounded(chat_id, iteration + 1).await;
            }

            iteration += 1;
        }
    }

    /// Execute a tool under the retry wrapper. Failure becomes an error
    /// observation unless the tool is declared non-recoverable.
    async fn execute_tool(
        &self,
        chat_id: &ConversationId,
        name: &str,
        arguments: serde_json::Value,
        executed_tool: &mut Option<String>,
    ) -> Result<String> {
        if !self.tool_allowed(name) {
            return Ok(format!("tool '{}' is not available to this role", name));
        }

        self.bus.publish(RunEvent::ToolStarted {
            chat_id: chat_id.clone(),
            name: name.to_string(),
            arguments: arguments.clone(),
        });

        match execute_node(
            &self.steps,
            &self.config.role,
            name,
            arguments,
            &self.defaults.tool_retry,
            None,
        )
        .await
        {
            Ok((output, attempts)) => {
                self.bus.publish(RunEvent::ToolFinished {
                    chat_id: chat_id.clone(),
                    name: name.to_string(),
                    is_error: false,
                    attempts,
                });
                *executed_tool = Some(name.to_string());
                Ok(render_output(&output))
            }
            Err(e) => {
                let attempts = match &e {
                    WeaveError::NodeExecution { attempts, .. } => *attempts,
                    _ => 1,
                };
                self.bus.publish(RunEvent::ToolFinished {
                    chat_id: chat_id.clone(),
                    name: name.to_string(),
                    is_error: true,
                    attempts,
                });
                if self.config.non_recoverable_tools.iter().any(|t| t == name) {
                    self.fail(chat_id, &e.to_string());
                    return Err(e);
                }
                warn!(chat_id = %chat_id, tool = name, error = %e, "Tool failed, recording observation");
                Ok(format!("tool '{}' failed: {}", name, e))
            }
        }
    }

    async fn issue_handoff(
        &self,
        chat_id: &ConversationId,
        target_role: String,
        task: String,
        context: serde_json::Map<String, serde_json::Value>,
    ) -> Result<String> {
        let Some(router) = &self.router else {
            return Ok("handoff unavailable: this loop runs outside a team".to_string());
        };

        let event = HandoffEvent {
            source_role: self.config.role.clone(),
            target_role,
            task,
            context,
        };
        match router.route(chat_id.clone(), event).await {
            Ok(observation) => Ok(observation),
            Err(WeaveError::Cancelled) => Err(WeaveError::Cancelled),
            Err(e) => Ok(format!("handoff failed: {}", e)),
        }
    }

    fn finish(
        &self,
        chat_id: &ConversationId,
        answer: String,
        iterations: usize,
        bounded: bool,
    ) -> Result<LoopOutcome> {
        info!(chat_id = %chat_id, iterations, bounded, "Agent loop finished");
        self.bus.publish(RunEvent::LoopFinished {
            chat_id: chat_id.clone(),
            iterations,
            answer: answer.clone(),
            bounded,
        });
        Ok(LoopOutcome {
            answer,
            iterations,
            bounded,
        })
    }

    /// Bound hit: synthesize a best-effort answer from the scratchpad
    /// without another completion call.
    async fn finish_bounded(
        &self,
        chat_id: &ConversationId,
        iterations: usize,
    ) -> Result<LoopOutcome> {
        let history = self
            .scratchpad
            .recent(chat_id, self.defaults.history_items)
            .await?;
        let answer = synthesize(&history, iterations);
        self.finish(chat_id, answer, iterations, true)
    }

    fn fail(&self, chat_id: &ConversationId, error: &str) {
        warn!(chat_id = %chat_id, error, "Agent loop failed");
        self.bus.publish(RunEvent::LoopFailed {
            chat_id: chat_id.clone(),
            error: error.to_string(),
        });
    }

    fn tool_allowed(&self, name: &str) -> bool {
        self.steps.contains(name)
            && (self.config.tools.is_empty() || self.config.tools.iter().any(|t| t == name))
    }

    fn allowed_tool_specs(&self) -> Vec<(String, StepSpec)> {
        self.steps
            .specs()
            .into_iter()
            .filter(|(name, _)| {
                self.config.tools.is_empty() || self.config.tools.iter().any(|t| t == name)
            })
            .collect()
    }
}

/// Deterministic fallback answer built from the latest scratchpad state.
fn synthesize(history: &[ScratchpadItem], iterations: usize) -> String {
    let last = history.iter().rev().find(|item| !item.origin);
    match last {
        Some(item) => format!(
            "Stopped after {} iteration(s) without a final answer. Latest finding: {}",
            iterations, item.observation
        ),
        None => format!(
            "Stopped after {} iteration(s) without gathering any findings.",
            iterations
        ),
    }
}

fn render_output(output: &serde_json::Value) -> String {
    match output {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        s.chars().take(max_chars).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use taskweave_test_utils::{FailingStep, MemoryScratchpad, ScriptedCompletion, StaticStep};

    fn defaults() -> AgentDefaults {
        AgentDefaults {
            tool_retry: taskweave_core::types::RetryPolicy {
                max_attempts: 2,
                delay_ms: 1,
                backoff: 1.0,
            },
            ..AgentDefaults::default()
        }
    }

    fn registry() -> Arc<StepRegistry> {
        let mut registry = StepRegistry::new();
        registry
            .register(StaticStep::new("search", json!({"hits": ["a", "b"]})))
            .unwrap();
        registry
            .register(FailingStep::new("broken", "kaput"))
            .unwrap();
        Arc::new(registry)
    }

    fn make_loop(config: AgentConfig, responses: Vec<&str>) -> (AgentLoop, Arc<ScriptedCompletion>) {
        let completion = Arc::new(ScriptedCompletion::new(responses));
        let agent = AgentLoop::new(
            config,
            defaults(),
            Arc::clone(&completion) as Arc<dyn CompletionClient>,
            registry(),
            Arc::new(MemoryScratchpad::default()),
            Arc::new(EventBus::default()),
        );
        (agent, completion)
    }

    #[tokio::test]
    async fn test_direct_answer_single_iteration() {
        let (agent, completion) = make_loop(
            AgentConfig::new("solo"),
            vec![r#"{"thought": "easy", "answer": "Paris"}"#],
        );
        let outcome = agent.run(&ConversationId::new(), "capital of France?").await.unwrap();
        assert_eq!(outcome.answer, "Paris");
        assert_eq!(outcome.iterations, 1);
        assert!(!outcome.bounded);
        assert_eq!(completion.calls(), 1);
    }

    #[tokio::test]
    async fn test_tool_then_answer() {
        let (agent, completion) = make_loop(
            AgentConfig::new("solo"),
            vec![
                r#"{"thought": "search first", "action": {"tool": "search", "arguments": {}}}"#,
                r#"{"thought": "got it", "answer": "found a and b"}"#,
            ],
        );
        let outcome = agent.run(&ConversationId::new(), "find things").await.unwrap();
        assert_eq!(outcome.answer, "found a and b");
        assert_eq!(outcome.iterations, 2);
        assert_eq!(completion.calls(), 2);
    }

    #[tokio::test]
    async fn test_iteration_bound_makes_k_plus_one_calls() {
        // Model never answers; with max_iterations = 3 the loop thinks
        // exactly 4 times, then synthesizes.
        let (agent, completion) = make_loop(
            AgentConfig::new("solo").with_max_iterations(3),
            vec![r#"{"thought": "keep digging", "action": {"tool": "search", "arguments": {}}}"#],
        );
        let outcome = agent.run(&ConversationId::new(), "impossible").await.unwrap();
        assert!(outcome.bounded);
        assert_eq!(outcome.iterations, 4);
        assert_eq!(completion.calls(), 4);
        assert!(outcome.answer.contains("Latest finding"));
    }

    #[tokio::test]
    async fn test_parse_error_reprompts_once() {
        let (agent, completion) = make_loop(
            AgentConfig::new("solo"),
            vec![
                r#"{"thought": "malformed, no action"}"#,
                r#"{"thought": "fixed", "answer": "ok"}"#,
            ],
        );
        let outcome = agent.run(&ConversationId::new(), "q").await.unwrap();
        assert_eq!(outcome.answer, "ok");
        assert_eq!(outcome.iterations, 1);
        // one extra completion call for the corrective prompt
        assert_eq!(completion.calls(), 2);
    }

    #[tokio::test]
    async fn test_persistent_parse_error_fails() {
        let (agent, completion) = make_loop(
            AgentConfig::new("solo"),
            vec![r#"{"thought": "never valid"}"#],
        );
        let err = agent.run(&ConversationId::new(), "q").await.unwrap_err();
        assert!(matches!(err, WeaveError::Parse(_)));
        assert_eq!(completion.calls(), 2);
    }

    #[tokio::test]
    async fn test_tool_failure_becomes_observation() {
        let (agent, _) = make_loop(
            AgentConfig::new("solo"),
            vec![
                r#"{"thought": "try it", "action": {"tool": "broken", "arguments": {}}}"#,
                r#"{"thought": "fall back", "answer": "gave up"}"#,
            ],
        );
        let outcome = agent.run(&ConversationId::new(), "q").await.unwrap();
        assert_eq!(outcome.answer, "gave up");
    }

    #[tokio::test]
    async fn test_non_recoverable_tool_aborts() {
        let (agent, _) = make_loop(
            AgentConfig::new("solo").with_non_recoverable_tools(vec!["broken".into()]),
            vec![r#"{"thought": "try it", "action": {"tool": "broken", "arguments": {}}}"#],
        );
        let err = agent.run(&ConversationId::new(), "q").await.unwrap_err();
        assert!(matches!(err, WeaveError::NodeExecution { .. }));
    }

    #[tokio::test]
    async fn test_by_tool_name_termination() {
        let (agent, completion) = make_loop(
            AgentConfig::new("solo").with_termination(TerminationCondition::ByToolName {
                tools: vec!["search".into()],
            }),
            vec![r#"{"thought": "one search", "action": {"tool": "search", "arguments": {}}}"#],
        );
        let outcome = agent.run(&ConversationId::new(), "q").await.unwrap();
        assert!(!outcome.bounded);
        assert_eq!(outcome.iterations, 1);
        assert_eq!(completion.calls(), 1);
        // the terminating tool's observation is the answer
        assert!(outcome.answer.contains("hits"));
    }

    #[tokio::test]
    async fn test_handoff_without_router_is_observation() {
        let (agent, _) = make_loop(
            AgentConfig::new("solo"),
            vec![
                r#"{"thought": "delegate", "action": {"handoff": "writer", "task": "draft"}}"#,
                r#"{"thought": "do it myself", "answer": "done alone"}"#,
            ],
        );
        let outcome = agent.run(&ConversationId::new(), "q").await.unwrap();
        assert_eq!(outcome.answer, "done alone");
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let (agent, completion) = make_loop(
            AgentConfig::new("solo"),
            vec![r#"{"thought": "t", "answer": "a"}"#],
        );
        agent.cancel_token().cancel();
        let err = agent.run(&ConversationId::new(), "q").await.unwrap_err();
        assert!(matches!(err, WeaveError::Cancelled));
        assert_eq!(completion.calls(), 0);
    }
}
