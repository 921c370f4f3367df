use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use taskweave_core::config::{AgentConfig, AgentDefaults};
use taskweave_core::error::{Result, WeaveError};
use taskweave_core::event::{EventBus, RunEvent};
use taskweave_core::traits::{CompletionClient, ScratchpadStore};
use taskweave_core::types::{ConversationId, HandoffEvent, ScratchpadItem};
use taskweave_workflow::step::StepRegistry;

use crate::agent_loop::{AgentLoop, HandoffRouter, LoopOutcome};
use crate::completion::RetryingCompletion;

/// What the source loop does while a handoff target works.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandoffPolicy {
    /// Block the source loop; the target's answer becomes the
    /// observation.
    #[default]
    Await,
    /// Dispatch the target and continue immediately.
    FireAndContinue,
}

/// Shared iteration budget across every loop in a team. Each think
/// cycle consumes one unit; an exhausted budget bounds every loop.
pub struct IterationBudget {
    remaining: AtomicUsize,
}

impl IterationBudget {
    pub fn new(total: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(total),
        }
    }

    /// Take one unit; false once the budget is spent.
    pub fn try_consume(&self) -> bool {
        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::SeqCst)
    }
}

/// How a team run ended: which role produced the answer, and whether
/// that loop was bounded.
#[derive(Debug, Clone)]
pub struct TeamOutcome {
    pub answer: String,
    pub role: String,
    pub chat_id: ConversationId,
    pub bounded: bool,
}

struct TeamInner {
    roles: HashMap<String, AgentConfig>,
    defaults: AgentDefaults,
    expiry: Duration,
    policy: HandoffPolicy,
    budget: Option<Arc<IterationBudget>>,
    completion: Arc<dyn CompletionClient>,
    steps: Arc<StepRegistry>,
    scratchpad: Arc<dyn ScratchpadStore>,
    bus: Arc<EventBus>,
    cancel: CancellationToken,
    /// First terminal role to finish; ends the whole team run.
    outcome: Mutex<Option<TeamOutcome>>,
}

impl TeamInner {
    fn build_loop(self: &Arc<Self>, config: AgentConfig) -> AgentLoop {
        let router = RoleRouter {
            inner: Arc::clone(self),
        };
        let mut agent = AgentLoop::new(
            config,
            self.defaults.clone(),
            Arc::clone(&self.completion),
            Arc::clone(&self.steps),
            Arc::clone(&self.scratchpad),
            Arc::clone(&self.bus),
        )
        .with_scratchpad_expiry(self.expiry)
        .with_cancel(self.cancel.clone())
        .with_router(Arc::new(router));
        if let Some(budget) = &self.budget {
            agent = agent.with_budget(Arc::clone(budget));
        }
        agent
    }

    async fn run_role(
        self: Arc<Self>,
        role: String,
        chat_id: ConversationId,
        query: String,
        seed: Vec<ScratchpadItem>,
    ) -> Result<LoopOutcome> {
        let config = self
            .roles
            .get(&role)
            .cloned()
            .ok_or_else(|| WeaveError::UnknownRole(role.clone()))?;
        let terminal = config.terminal;

        let agent = self.build_loop(config).with_seed(seed);
        let outcome = agent.run(&chat_id, &query).await?;

        if terminal {
            info!(role = %role, chat_id = %chat_id, "Terminal role finished, ending team run");
            let mut stored = self
                .outcome
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if stored.is_none() {
                *stored = Some(TeamOutcome {
                    answer: outcome.answer.clone(),
                    role: role.clone(),
                    chat_id: chat_id.clone(),
                    bounded: outcome.bounded,
                });
            }
            drop(stored);
            self.cancel.cancel();
        }
        Ok(outcome)
    }

    fn take_outcome(&self) -> Option<TeamOutcome> {
        self.outcome
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

/// Router wired into every team loop. Holds the shared team state; the
/// loops themselves never reference each other directly.
struct RoleRouter {
    inner: Arc<TeamInner>,
}

impl HandoffRouter for RoleRouter {
    fn route(
        &self,
        source_chat: ConversationId,
        event: HandoffEvent,
    ) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let inner = Arc::clone(&self.inner);
            if !inner.roles.contains_key(&event.target_role) {
                return Err(WeaveError::UnknownRole(event.target_role));
            }

            let target_chat = ConversationId::new();
            inner.bus.publish(RunEvent::HandoffIssued {
                chat_id: source_chat,
                source_role: event.source_role.clone(),
                target_role: event.target_role.clone(),
                target_chat_id: target_chat.clone(),
            });
            debug!(
                source = %event.source_role,
                target = %event.target_role,
                target_chat = %target_chat,
                "Handoff issued"
            );

            // The task seeds the target's conversation verbatim; any
            // handoff context rides along as a separate record.
            let seed = if event.context.is_empty() {
                Vec::new()
            } else {
                vec![ScratchpadItem::record(
                    format!("context from {}", event.source_role),
                    None,
                    serde_json::Value::Object(event.context.clone()).to_string(),
                )]
            };

            match inner.policy {
                HandoffPolicy::Await => {
                    let outcome = inner
                        .run_role(event.target_role, target_chat, event.task, seed)
                        .await?;
                    Ok(outcome.answer)
                }
                HandoffPolicy::FireAndContinue => {
                    let target = event.target_role.clone();
                    tokio::spawn(async move {
                        if let Err(e) = inner
                            .run_role(event.target_role, target_chat, event.task, seed)
                            .await
                        {
                            warn!(error = %e, "Dispatched handoff target failed");
                        }
                    });
                    Ok(format!("handoff to '{}' dispatched", target))
                }
            }
        })
    }
}

/// A fixed set of role-named loops sharing one tool registry, one
/// scratchpad store, and optionally one iteration budget.
pub struct Team {
    inner: Arc<TeamInner>,
}

impl Team {
    pub fn builder(
        completion: Arc<dyn CompletionClient>,
        steps: Arc<StepRegistry>,
        scratchpad: Arc<dyn ScratchpadStore>,
        bus: Arc<EventBus>,
    ) -> TeamBuilder {
        TeamBuilder {
            roles: Vec::new(),
            defaults: AgentDefaults::default(),
            expiry: Duration::from_secs(7 * 24 * 3600),
            policy: HandoffPolicy::default(),
            budget: None,
            completion,
            steps,
            scratchpad,
            bus,
        }
    }

    /// Run the team from an entry role. Returns the terminal role's
    /// outcome when one fired, the entry loop's otherwise.
    pub async fn run(&self, entry_role: &str, query: &str) -> Result<TeamOutcome> {
        if !self.inner.roles.contains_key(entry_role) {
            return Err(WeaveError::UnknownRole(entry_role.to_string()));
        }

        let chat_id = ConversationId::new();
        let result = Arc::clone(&self.inner)
            .run_role(
                entry_role.to_string(),
                chat_id.clone(),
                query.to_string(),
                Vec::new(),
            )
            .await;

        // A terminal role's stored outcome wins, even when the entry
        // loop was cancelled by it.
        if let Some(outcome) = self.inner.take_outcome() {
            return Ok(outcome);
        }

        result.map(|outcome| TeamOutcome {
            answer: outcome.answer,
            role: entry_role.to_string(),
            chat_id,
            bounded: outcome.bounded,
        })
    }

    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    pub fn budget_remaining(&self) -> Option<usize> {
        self.inner.budget.as_ref().map(|b| b.remaining())
    }
}

pub struct TeamBuilder {
    roles: Vec<AgentConfig>,
    defaults: AgentDefaults,
    expiry: Duration,
    policy: HandoffPolicy,
    budget: Option<usize>,
    completion: Arc<dyn CompletionClient>,
    steps: Arc<StepRegistry>,
    scratchpad: Arc<dyn ScratchpadStore>,
    bus: Arc<EventBus>,
}

impl TeamBuilder {
    pub fn with_role(mut self, config: AgentConfig) -> Self {
        self.roles.push(config);
        self
    }

    pub fn with_defaults(mut self, defaults: AgentDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_scratchpad_expiry(mut self, expiry: Duration) -> Self {
        self.expiry = expiry;
        self
    }

    pub fn with_policy(mut self, policy: HandoffPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Total think cycles shared by every loop in the team.
    pub fn with_iteration_budget(mut self, total: usize) -> Self {
        self.budget = Some(total);
        self
    }

    pub fn build(self) -> Result<Team> {
        if self.roles.is_empty() {
            return Err(WeaveError::Configuration(
                "a team needs at least one role".to_string(),
            ));
        }

        let mut roles = HashMap::new();
        for config in self.roles {
            if roles.contains_key(&config.role) {
                return Err(WeaveError::DuplicateRole(config.role));
            }
            roles.insert(config.role.clone(), config);
        }

        // Every role's loop shares one retrying completion client.
        let completion = Arc::new(RetryingCompletion::new(
            self.completion,
            self.defaults.completion_retry.clone(),
        ));

        Ok(Team {
            inner: Arc::new(TeamInner {
                roles,
                defaults: self.defaults,
                expiry: self.expiry,
                policy: self.policy,
                budget: self.budget.map(|n| Arc::new(IterationBudget::new(n))),
                completion,
                steps: self.steps,
                scratchpad: self.scratchpad,
                bus: self.bus,
                cancel: CancellationToken::new(),
                outcome: Mutex::new(None),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iteration_budget_exhaustion() {
        let budget = IterationBudget::new(2);
        assert!(budget.try_consume());
        assert!(budget.try_consume());
        assert!(!budget.try_consume());
        assert_eq!(budget.remaining(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_role_rejected() {
        let completion = Arc::new(taskweave_test_utils::ScriptedCompletion::new(vec!["x"]));
        let result = Team::builder(
            completion,
            Arc::new(StepRegistry::new()),
            Arc::new(taskweave_test_utils::MemoryScratchpad::default()),
            Arc::new(EventBus::default()),
        )
        .with_role(AgentConfig::new("a"))
        .with_role(AgentConfig::new("a"))
        .build();
        assert!(matches!(result, Err(WeaveError::DuplicateRole(_))));
    }

    #[tokio::test]
    async fn test_unknown_entry_role() {
        let completion = Arc::new(taskweave_test_utils::ScriptedCompletion::new(vec!["x"]));
        let team = Team::builder(
            completion,
            Arc::new(StepRegistry::new()),
            Arc::new(taskweave_test_utils::MemoryScratchpad::default()),
            Arc::new(EventBus::default()),
        )
        .with_role(AgentConfig::new("a"))
        .build()
        .unwrap();
        let err = team.run("ghost", "q").await.unwrap_err();
        assert!(matches!(err, WeaveError::UnknownRole(_)));
    }
}
