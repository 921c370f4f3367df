use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ConversationId, NodeStatus, RunId, RunStatus};

/// Progress event published to the external sink.
///
/// Delivery is at-least-once; consumers must tolerate duplicates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    // ── Workflow runs ───────────────────────────────────────
    /// Run control flag transition.
    RunStateChanged {
        run_id: RunId,
        status: RunStatus,
        timestamp: DateTime<Utc>,
    },
    /// A node reached a new status.
    NodeStateChanged {
        run_id: RunId,
        node_id: String,
        status: NodeStatus,
        /// Truncated output or error text, when terminal.
        summary: Option<String>,
        timestamp: DateTime<Utc>,
    },

    // ── Agent conversations ─────────────────────────────────
    /// An agent loop started working on a query.
    LoopStarted { chat_id: ConversationId, role: Option<String> },
    /// A think/act/observe iteration began.
    IterationStarted { chat_id: ConversationId, iteration: usize },
    /// The model produced a thought.
    Thought { chat_id: ConversationId, text: String },
    /// Tool execution started.
    ToolStarted {
        chat_id: ConversationId,
        name: String,
        arguments: serde_json::Value,
    },
    /// Tool execution finished (attempts include retries consumed).
    ToolFinished {
        chat_id: ConversationId,
        name: String,
        is_error: bool,
        attempts: u32,
    },
    /// One role handed control to another.
    HandoffIssued {
        chat_id: ConversationId,
        source_role: String,
        target_role: String,
        target_chat_id: ConversationId,
    },
    /// The loop terminated with an answer. `bounded` marks the non-fatal
    /// iteration-limit path, distinguishable from an explicit final answer.
    LoopFinished {
        chat_id: ConversationId,
        iterations: usize,
        answer: String,
        bounded: bool,
    },
    /// The loop aborted with a fatal error.
    LoopFailed { chat_id: ConversationId, error: String },
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<RunEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: RunEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RunEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
