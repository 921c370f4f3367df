use std::time::Duration;

use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::{ConversationId, ScratchpadItem, StepSpec};

/// A single typed unit of work — the node contract every step
/// implementation satisfies.
///
/// Steps own their side effects; the engine wraps `execute` with a
/// per-attempt timeout and a sequential retry policy.
pub trait Step: Send + Sync + 'static {
    /// Step kind, used to select this implementation from the registry.
    fn name(&self) -> &str;

    /// Declared parameters (required, optional with defaults) and outputs.
    fn spec(&self) -> StepSpec;

    /// Execute with fully resolved, validated parameters.
    fn execute(&self, params: serde_json::Value) -> BoxFuture<'_, Result<serde_json::Value>>;

    /// Default per-attempt timeout in seconds for this step.
    fn timeout_secs(&self) -> u64 {
        60
    }
}

/// Language-model completion service, consumed at its boundary only.
///
/// Failures are I/O errors and retryable per the caller's policy.
pub trait CompletionClient: Send + Sync + 'static {
    fn complete(&self, model: &str, prompt: String) -> BoxFuture<'_, Result<String>>;
}

/// Durable, time-windowed, size-capped iteration history, keyed by
/// conversation. Appends for one key are linearizable; items are never
/// mutated after append.
pub trait ScratchpadStore: Send + Sync + 'static {
    /// Append one item under the conversation key with an expiry window.
    fn append(
        &self,
        key: &ConversationId,
        item: &ScratchpadItem,
        expiry: Duration,
    ) -> BoxFuture<'_, Result<()>>;

    /// The `n` most recent unexpired items, ordered oldest-first.
    fn recent(&self, key: &ConversationId, n: usize) -> BoxFuture<'_, Result<Vec<ScratchpadItem>>>;
}
