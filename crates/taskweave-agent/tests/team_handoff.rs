//! Team coordination: handoffs between role loops, terminal roles, and
//! the shared iteration budget.

use std::sync::Arc;

use taskweave_core::config::{AgentConfig, AgentDefaults};
use taskweave_core::event::{EventBus, RunEvent};
use taskweave_core::traits::{CompletionClient, ScratchpadStore};
use taskweave_core::types::ConversationId;
use taskweave_core::types::RetryPolicy;
use taskweave_test_utils::{FlakyCompletion, MemoryScratchpad, ScriptedCompletion};
use taskweave_workflow::StepRegistry;

use taskweave_agent::{HandoffPolicy, Team};

struct Fixture {
    completion: Arc<ScriptedCompletion>,
    scratchpad: Arc<MemoryScratchpad>,
    bus: Arc<EventBus>,
}

impl Fixture {
    fn new(responses: Vec<&str>) -> Self {
        Self {
            completion: Arc::new(ScriptedCompletion::new(responses)),
            scratchpad: Arc::new(MemoryScratchpad::default()),
            bus: Arc::new(EventBus::default()),
        }
    }

    fn team(&self, roles: Vec<AgentConfig>) -> Team {
        let mut builder = Team::builder(
            Arc::clone(&self.completion) as Arc<dyn CompletionClient>,
            Arc::new(StepRegistry::new()),
            Arc::clone(&self.scratchpad) as Arc<dyn ScratchpadStore>,
            Arc::clone(&self.bus),
        );
        for role in roles {
            builder = builder.with_role(role);
        }
        builder.build().unwrap()
    }
}

#[tokio::test]
async fn test_handoff_task_seeds_target_verbatim() {
    // researcher hands off; writer answers. Shared scripted completion:
    // responses are consumed in call order across both loops.
    let fixture = Fixture::new(vec![
        r#"{"thought": "not my job", "action": {"handoff": "writer", "task": "find X"}}"#,
        r#"{"thought": "writing", "answer": "X found"}"#,
        r#"{"thought": "done", "answer": "relayed: X found"}"#,
    ]);
    let mut events = fixture.bus.subscribe();

    let team = fixture.team(vec![
        AgentConfig::new("researcher"),
        AgentConfig::new("writer"),
    ]);
    let outcome = team.run("researcher", "investigate X").await.unwrap();
    assert_eq!(outcome.answer, "relayed: X found");
    assert_eq!(outcome.role, "researcher");

    // Recover the writer's conversation from the handoff event and check
    // its origin record carries the task text unchanged.
    let mut writer_chat: Option<ConversationId> = None;
    while let Ok(event) = events.try_recv() {
        if let RunEvent::HandoffIssued {
            source_role,
            target_role,
            target_chat_id,
            ..
        } = event
        {
            assert_eq!(source_role, "researcher");
            assert_eq!(target_role, "writer");
            writer_chat = Some(target_chat_id);
        }
    }
    let writer_chat = writer_chat.expect("handoff event published");
    let items = fixture.scratchpad.all(&writer_chat);
    assert!(items[0].origin);
    assert_eq!(items[0].observation, "find X");
}

#[tokio::test]
async fn test_handoff_context_seeds_target_conversation() {
    // The context map rides along with the task: the target sees it as
    // a seeded record while the task itself stays verbatim.
    let fixture = Fixture::new(vec![
        r#"{"thought": "not my area", "action": {"handoff": "writer", "task": "find X", "context": {"hint": "use source Y", "depth": 2}}}"#,
        r#"{"thought": "writing", "answer": "X found"}"#,
        r#"{"thought": "done", "answer": "relayed"}"#,
    ]);
    let mut events = fixture.bus.subscribe();

    let team = fixture.team(vec![
        AgentConfig::new("researcher"),
        AgentConfig::new("writer"),
    ]);
    team.run("researcher", "investigate X").await.unwrap();

    let mut writer_chat: Option<ConversationId> = None;
    while let Ok(event) = events.try_recv() {
        if let RunEvent::HandoffIssued { target_chat_id, .. } = event {
            writer_chat = Some(target_chat_id);
        }
    }
    let writer_chat = writer_chat.expect("handoff event published");
    let items = fixture.scratchpad.all(&writer_chat);
    assert!(items[0].origin);
    assert_eq!(items[0].observation, "find X");
    assert!(items[1].thought.contains("researcher"));
    assert!(items[1].observation.contains("use source Y"));
    assert!(items[1].observation.contains("\"depth\":2"));
}

#[tokio::test]
async fn test_await_handoff_answer_becomes_observation() {
    let fixture = Fixture::new(vec![
        r#"{"thought": "delegate", "action": {"handoff": "writer", "task": "draft it"}}"#,
        r#"{"thought": "ok", "answer": "the draft"}"#,
        r#"{"thought": "use it", "answer": "final: the draft"}"#,
    ]);

    let team = fixture.team(vec![
        AgentConfig::new("lead"),
        AgentConfig::new("writer"),
    ]);
    let outcome = team.run("lead", "produce a draft").await.unwrap();
    assert_eq!(outcome.answer, "final: the draft");
    assert_eq!(fixture.completion.calls(), 3);
}

#[tokio::test]
async fn test_terminal_role_ends_team_run() {
    // The closer is terminal: its answer is the team outcome even though
    // the entry loop never produced one itself.
    let fixture = Fixture::new(vec![
        r#"{"thought": "escalate", "action": {"handoff": "closer", "task": "wrap up"}}"#,
        r#"{"thought": "closing", "answer": "all done"}"#,
    ]);

    let team = fixture.team(vec![
        AgentConfig::new("opener"),
        AgentConfig::new("closer").terminal(),
    ]);
    let outcome = team.run("opener", "start the job").await.unwrap();
    assert_eq!(outcome.answer, "all done");
    assert_eq!(outcome.role, "closer");
    // opener's loop was cancelled after the terminal role finished, so
    // only two completion calls were made
    assert_eq!(fixture.completion.calls(), 2);
}

#[tokio::test]
async fn test_unknown_handoff_target_is_observation() {
    let fixture = Fixture::new(vec![
        r#"{"thought": "delegate", "action": {"handoff": "ghost", "task": "anything"}}"#,
        r#"{"thought": "alone then", "answer": "solo result"}"#,
    ]);

    let team = fixture.team(vec![AgentConfig::new("lead")]);
    let outcome = team.run("lead", "q").await.unwrap();
    assert_eq!(outcome.answer, "solo result");
}

#[tokio::test]
async fn test_team_retries_transient_completion_failures() {
    let completion = Arc::new(FlakyCompletion::new(
        1,
        r#"{"thought": "t", "answer": "recovered"}"#,
    ));
    let team = Team::builder(
        Arc::clone(&completion) as Arc<dyn CompletionClient>,
        Arc::new(StepRegistry::new()),
        Arc::new(MemoryScratchpad::default()),
        Arc::new(EventBus::default()),
    )
    .with_role(AgentConfig::new("solo"))
    .with_defaults(AgentDefaults {
        completion_retry: RetryPolicy {
            max_attempts: 2,
            delay_ms: 1,
            backoff: 1.0,
        },
        ..AgentDefaults::default()
    })
    .build()
    .unwrap();

    let outcome = team.run("solo", "q").await.unwrap();
    assert_eq!(outcome.answer, "recovered");
    assert_eq!(completion.calls(), 2);
}

#[tokio::test]
async fn test_team_budget_bounds_every_loop() {
    // Neither role ever answers; the shared budget of 3 cycles stops the
    // whole team regardless of per-role limits.
    let fixture = Fixture::new(vec![
        r#"{"thought": "pass it on", "action": {"handoff": "b", "task": "keep going"}}"#,
        r#"{"thought": "pass it back", "action": {"handoff": "a", "task": "keep going"}}"#,
    ]);

    let team_builder = Team::builder(
        Arc::clone(&fixture.completion) as Arc<dyn CompletionClient>,
        Arc::new(StepRegistry::new()),
        Arc::clone(&fixture.scratchpad) as Arc<dyn ScratchpadStore>,
        Arc::clone(&fixture.bus),
    )
    .with_role(AgentConfig::new("a"))
    .with_role(AgentConfig::new("b"))
    .with_policy(HandoffPolicy::Await)
    .with_iteration_budget(3);
    let team = team_builder.build().unwrap();

    let outcome = team.run("a", "ping pong").await.unwrap();
    assert!(outcome.bounded);
    assert_eq!(fixture.completion.calls(), 3);
    assert_eq!(team.budget_remaining(), Some(0));
}
