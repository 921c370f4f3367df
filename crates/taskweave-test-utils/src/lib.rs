//! Test doubles shared across the workspace: deterministic steps, a
//! scripted completion client, and an in-memory scratchpad.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use taskweave_core::error::{Result, WeaveError};
use taskweave_core::traits::{CompletionClient, ScratchpadStore, Step};
use taskweave_core::types::{ConversationId, ScratchpadItem, StepSpec};

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Step that always succeeds with a fixed output.
pub struct StaticStep {
    name: String,
    output: serde_json::Value,
}

impl StaticStep {
    pub fn new(name: impl Into<String>, output: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            output,
        }
    }
}

impl Step for StaticStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn spec(&self) -> StepSpec {
        StepSpec::new()
    }

    fn execute(&self, _params: serde_json::Value) -> BoxFuture<'_, Result<serde_json::Value>> {
        Box::pin(async move { Ok(self.output.clone()) })
    }
}

/// Step that always fails, counting invocations.
pub struct FailingStep {
    name: String,
    message: String,
    calls: Arc<AtomicU32>,
}

impl FailingStep {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Shared invocation counter; keep a clone before registering.
    pub fn calls(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.calls)
    }
}

impl Step for FailingStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn spec(&self) -> StepSpec {
        StepSpec::new()
    }

    fn execute(&self, _params: serde_json::Value) -> BoxFuture<'_, Result<serde_json::Value>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(WeaveError::StepFailed {
                step: self.name.clone(),
                message: self.message.clone(),
            })
        })
    }
}

/// Step that fails a fixed number of times, then succeeds.
pub struct FlakyStep {
    name: String,
    failures: u32,
    output: serde_json::Value,
    calls: Arc<AtomicU32>,
}

impl FlakyStep {
    pub fn new(name: impl Into<String>, failures: u32, output: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            failures,
            output,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn calls(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.calls)
    }
}

impl Step for FlakyStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn spec(&self) -> StepSpec {
        StepSpec::new()
    }

    fn execute(&self, _params: serde_json::Value) -> BoxFuture<'_, Result<serde_json::Value>> {
        Box::pin(async move {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(WeaveError::StepFailed {
                    step: self.name.clone(),
                    message: format!("transient failure {}", call + 1),
                })
            } else {
                Ok(self.output.clone())
            }
        })
    }
}

/// Step that sleeps before succeeding, for timeout and pause tests.
pub struct SlowStep {
    name: String,
    delay: Duration,
    output: serde_json::Value,
}

impl SlowStep {
    pub fn new(name: impl Into<String>, delay: Duration, output: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            delay,
            output,
        }
    }
}

impl Step for SlowStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn spec(&self) -> StepSpec {
        StepSpec::new()
    }

    fn execute(&self, _params: serde_json::Value) -> BoxFuture<'_, Result<serde_json::Value>> {
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            Ok(self.output.clone())
        })
    }
}

/// Step that echoes its resolved params back as output and appends its
/// invocation to a shared log, for ordering assertions.
pub struct RecordingStep {
    name: String,
    log: Arc<Mutex<Vec<serde_json::Value>>>,
}

impl RecordingStep {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn log(&self) -> Arc<Mutex<Vec<serde_json::Value>>> {
        Arc::clone(&self.log)
    }
}

impl Step for RecordingStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn spec(&self) -> StepSpec {
        StepSpec::new()
    }

    fn execute(&self, params: serde_json::Value) -> BoxFuture<'_, Result<serde_json::Value>> {
        Box::pin(async move {
            lock_unpoisoned(&self.log).push(params.clone());
            Ok(params)
        })
    }
}

/// Step that adds one to its `value` parameter. Handy for chains where
/// each node feeds the next.
pub struct IncrementStep;

impl Step for IncrementStep {
    fn name(&self) -> &str {
        "increment"
    }

    fn spec(&self) -> StepSpec {
        StepSpec::new()
    }

    fn execute(&self, params: serde_json::Value) -> BoxFuture<'_, Result<serde_json::Value>> {
        Box::pin(async move {
            let value = params
                .get("value")
                .and_then(|v| v.as_i64())
                .ok_or_else(|| WeaveError::StepFailed {
                    step: "increment".to_string(),
                    message: format!("expected numeric 'value', got {}", params),
                })?;
            Ok(serde_json::json!({ "value": value + 1 }))
        })
    }
}

/// Completion client that replays a fixed script of responses.
///
/// When the script runs out the last response repeats, so bounded-loop
/// tests can script a single "keep going" reply. Counts every call.
pub struct ScriptedCompletion {
    responses: Mutex<VecDeque<String>>,
    fallback: Option<String>,
    calls: AtomicU32,
}

impl ScriptedCompletion {
    pub fn new(responses: Vec<impl Into<String>>) -> Self {
        let responses: VecDeque<String> = responses.into_iter().map(Into::into).collect();
        let fallback = responses.back().cloned();
        Self {
            responses: Mutex::new(responses),
            fallback,
            calls: AtomicU32::new(0),
        }
    }

    /// Number of completion calls made so far.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl CompletionClient for ScriptedCompletion {
    fn complete(&self, _model: &str, _prompt: String) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = lock_unpoisoned(&self.responses).pop_front();
            match next.or_else(|| self.fallback.clone()) {
                Some(response) => Ok(response),
                None => Err(WeaveError::Completion(
                    "scripted completion exhausted".to_string(),
                )),
            }
        })
    }
}

/// Completion client that fails a fixed number of times with a
/// transient error, then always returns the same response.
pub struct FlakyCompletion {
    failures: u32,
    response: String,
    calls: AtomicU32,
}

impl FlakyCompletion {
    pub fn new(failures: u32, response: impl Into<String>) -> Self {
        Self {
            failures,
            response: response.into(),
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl CompletionClient for FlakyCompletion {
    fn complete(&self, _model: &str, _prompt: String) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(WeaveError::Completion("connection reset".to_string()))
            } else {
                Ok(self.response.clone())
            }
        })
    }
}

/// Completion client that always fails, for error-path tests.
pub struct BrokenCompletion;

impl CompletionClient for BrokenCompletion {
    fn complete(&self, _model: &str, _prompt: String) -> BoxFuture<'_, Result<String>> {
        Box::pin(async { Err(WeaveError::Completion("completion unavailable".to_string())) })
    }
}

struct StoredItem {
    item: ScratchpadItem,
    expires_at: DateTime<Utc>,
}

/// In-memory scratchpad with the same cap and expiry semantics as the
/// durable store.
pub struct MemoryScratchpad {
    cap: usize,
    items: Mutex<HashMap<String, Vec<StoredItem>>>,
}

impl MemoryScratchpad {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            items: Mutex::new(HashMap::new()),
        }
    }

    /// All unexpired items for a key, oldest-first. Test inspection only.
    pub fn all(&self, key: &ConversationId) -> Vec<ScratchpadItem> {
        let now = Utc::now();
        let items = lock_unpoisoned(&self.items);
        items
            .get(&key.0)
            .map(|stored| {
                stored
                    .iter()
                    .filter(|s| s.expires_at > now)
                    .map(|s| s.item.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self, key: &ConversationId) -> usize {
        self.all(key).len()
    }

    pub fn is_empty(&self, key: &ConversationId) -> bool {
        self.len(key) == 0
    }
}

impl Default for MemoryScratchpad {
    fn default() -> Self {
        Self::new(100)
    }
}

impl ScratchpadStore for MemoryScratchpad {
    fn append(
        &self,
        key: &ConversationId,
        item: &ScratchpadItem,
        expiry: Duration,
    ) -> BoxFuture<'_, Result<()>> {
        let key = key.0.clone();
        let item = item.clone();
        Box::pin(async move {
            let expires_at = Utc::now()
                + chrono::Duration::from_std(expiry)
                    .unwrap_or_else(|_| chrono::Duration::days(365));
            let mut items = lock_unpoisoned(&self.items);
            let stored = items.entry(key).or_default();
            stored.push(StoredItem { item, expires_at });
            // Oldest items fall off once the cap is exceeded.
            if stored.len() > self.cap {
                let excess = stored.len() - self.cap;
                stored.drain(..excess);
            }
            Ok(())
        })
    }

    fn recent(&self, key: &ConversationId, n: usize) -> BoxFuture<'_, Result<Vec<ScratchpadItem>>> {
        let key = key.0.clone();
        Box::pin(async move {
            let now = Utc::now();
            let items = lock_unpoisoned(&self.items);
            let unexpired: Vec<ScratchpadItem> = items
                .get(&key)
                .map(|stored| {
                    stored
                        .iter()
                        .filter(|s| s.expires_at > now)
                        .map(|s| s.item.clone())
                        .collect()
                })
                .unwrap_or_default();
            let skip = unexpired.len().saturating_sub(n);
            Ok(unexpired.into_iter().skip(skip).collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_flaky_step_sequence() {
        let step = FlakyStep::new("flaky", 2, json!({"ok": true}));
        assert!(step.execute(json!({})).await.is_err());
        assert!(step.execute(json!({})).await.is_err());
        assert_eq!(step.execute(json!({})).await.unwrap(), json!({"ok": true}));
    }

    #[tokio::test]
    async fn test_scripted_completion_repeats_last() {
        let client = ScriptedCompletion::new(vec!["first", "second"]);
        assert_eq!(client.complete("m", "p".into()).await.unwrap(), "first");
        assert_eq!(client.complete("m", "p".into()).await.unwrap(), "second");
        assert_eq!(client.complete("m", "p".into()).await.unwrap(), "second");
        assert_eq!(client.calls(), 3);
    }

    #[tokio::test]
    async fn test_memory_scratchpad_cap() {
        let store = MemoryScratchpad::new(3);
        let key = ConversationId::new();
        for i in 0..5 {
            store
                .append(
                    &key,
                    &ScratchpadItem::record(format!("t{}", i), None, "obs"),
                    Duration::from_secs(60),
                )
                .await
                .unwrap();
        }
        let recent = store.recent(&key, 10).await.unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].thought, "t2");
        assert_eq!(recent[2].thought, "t4");
    }

    #[tokio::test]
    async fn test_memory_scratchpad_expiry() {
        let store = MemoryScratchpad::new(10);
        let key = ConversationId::new();
        store
            .append(
                &key,
                &ScratchpadItem::record("old", None, "obs"),
                Duration::from_millis(0),
            )
            .await
            .unwrap();
        store
            .append(
                &key,
                &ScratchpadItem::record("fresh", None, "obs"),
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        let recent = store.recent(&key, 10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].thought, "fresh");
    }
}
