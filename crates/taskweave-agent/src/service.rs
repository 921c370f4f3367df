use std::sync::Arc;
use std::time::Duration;

use taskweave_core::config::{AgentConfig, AgentDefaults, ScratchpadConfig};
use taskweave_core::error::Result;
use taskweave_core::event::EventBus;
use taskweave_core::traits::{CompletionClient, ScratchpadStore};
use taskweave_core::types::ConversationId;
use taskweave_workflow::step::StepRegistry;

use crate::agent_loop::{AgentLoop, LoopOutcome};
use crate::completion::RetryingCompletion;

/// Entry point for standalone (non-team) agent queries: one loop per
/// query over a fresh or resumed conversation.
pub struct AgentService {
    defaults: AgentDefaults,
    expiry: Duration,
    completion: Arc<dyn CompletionClient>,
    steps: Arc<StepRegistry>,
    scratchpad: Arc<dyn ScratchpadStore>,
    bus: Arc<EventBus>,
}

impl AgentService {
    pub fn new(
        defaults: AgentDefaults,
        scratchpad_config: &ScratchpadConfig,
        completion: Arc<dyn CompletionClient>,
        steps: Arc<StepRegistry>,
        scratchpad: Arc<dyn ScratchpadStore>,
        bus: Arc<EventBus>,
    ) -> Self {
        // Transient completion failures retry here, not in the loop.
        let completion = Arc::new(RetryingCompletion::new(
            completion,
            defaults.completion_retry.clone(),
        ));
        Self {
            defaults,
            expiry: Duration::from_secs(scratchpad_config.expiry_secs),
            completion,
            steps,
            scratchpad,
            bus,
        }
    }

    /// Run one query under a fresh conversation.
    pub async fn submit_query(
        &self,
        config: &AgentConfig,
        query: &str,
    ) -> Result<(ConversationId, LoopOutcome)> {
        let chat_id = ConversationId::new();
        let outcome = self.run_in_conversation(config, &chat_id, query).await?;
        Ok((chat_id, outcome))
    }

    /// Run a query in an existing conversation; earlier scratchpad items
    /// stay visible to the loop for continuity.
    pub async fn run_in_conversation(
        &self,
        config: &AgentConfig,
        chat_id: &ConversationId,
        query: &str,
    ) -> Result<LoopOutcome> {
        let agent = AgentLoop::new(
            config.clone(),
            self.defaults.clone(),
            Arc::clone(&self.completion),
            Arc::clone(&self.steps),
            Arc::clone(&self.scratchpad),
            Arc::clone(&self.bus),
        )
        .with_scratchpad_expiry(self.expiry);
        agent.run(chat_id, query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskweave_core::types::RetryPolicy;
    use taskweave_test_utils::{FlakyCompletion, MemoryScratchpad, ScriptedCompletion};

    fn service(responses: Vec<&str>) -> AgentService {
        AgentService::new(
            AgentDefaults::default(),
            &ScratchpadConfig::default(),
            Arc::new(ScriptedCompletion::new(responses)),
            Arc::new(StepRegistry::new()),
            Arc::new(MemoryScratchpad::default()),
            Arc::new(EventBus::default()),
        )
    }

    #[tokio::test]
    async fn test_submit_query_creates_conversation() {
        let service = service(vec![r#"{"thought": "t", "answer": "done"}"#]);
        let (chat_id, outcome) = service
            .submit_query(&AgentConfig::new("solo"), "do it")
            .await
            .unwrap();
        assert!(!chat_id.0.is_empty());
        assert_eq!(outcome.answer, "done");
    }

    #[tokio::test]
    async fn test_transient_completion_failures_are_retried() {
        let completion = Arc::new(FlakyCompletion::new(
            2,
            r#"{"thought": "t", "answer": "recovered"}"#,
        ));
        let service = AgentService::new(
            AgentDefaults {
                completion_retry: RetryPolicy {
                    max_attempts: 3,
                    delay_ms: 1,
                    backoff: 1.0,
                },
                ..AgentDefaults::default()
            },
            &ScratchpadConfig::default(),
            Arc::clone(&completion) as Arc<dyn CompletionClient>,
            Arc::new(StepRegistry::new()),
            Arc::new(MemoryScratchpad::default()),
            Arc::new(EventBus::default()),
        );

        let (_, outcome) = service
            .submit_query(&AgentConfig::new("solo"), "q")
            .await
            .unwrap();
        assert_eq!(outcome.answer, "recovered");
        assert_eq!(completion.calls(), 3);
    }

    #[tokio::test]
    async fn test_resumed_conversation_keeps_history() {
        let scratchpad = Arc::new(MemoryScratchpad::default());
        let service = AgentService::new(
            AgentDefaults::default(),
            &ScratchpadConfig::default(),
            Arc::new(ScriptedCompletion::new(vec![
                r#"{"thought": "t", "answer": "first"}"#,
            ])),
            Arc::new(StepRegistry::new()),
            Arc::clone(&scratchpad) as Arc<dyn ScratchpadStore>,
            Arc::new(EventBus::default()),
        );

        let config = AgentConfig::new("solo");
        let chat_id = ConversationId::new();
        service
            .run_in_conversation(&config, &chat_id, "first question")
            .await
            .unwrap();
        service
            .run_in_conversation(&config, &chat_id, "second question")
            .await
            .unwrap();

        // two origin records plus two final answers
        assert_eq!(scratchpad.len(&chat_id), 4);
    }
}
