use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::warn;

use taskweave_core::error::{Result, WeaveError};
use taskweave_core::traits::CompletionClient;
use taskweave_core::types::RetryPolicy;
use taskweave_workflow::retry::backoff_delay;

/// Completion client wrapper that retries transient request failures
/// with jittered exponential backoff.
///
/// Only `Completion` errors are retried; anything else is the caller's
/// problem and surfaces immediately.
pub struct RetryingCompletion {
    inner: Arc<dyn CompletionClient>,
    policy: RetryPolicy,
}

impl RetryingCompletion {
    pub fn new(inner: Arc<dyn CompletionClient>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

impl CompletionClient for RetryingCompletion {
    fn complete(&self, model: &str, prompt: String) -> BoxFuture<'_, Result<String>> {
        let model = model.to_string();
        Box::pin(async move {
            let max_attempts = self.policy.max_attempts.max(1);
            let mut last_error: Option<WeaveError> = None;

            for attempt in 1..=max_attempts {
                match self.inner.complete(&model, prompt.clone()).await {
                    Ok(response) => return Ok(response),
                    Err(e @ WeaveError::Completion(_)) => {
                        if attempt < max_attempts {
                            let delay = backoff_delay(attempt - 1, &self.policy);
                            warn!(
                                attempt,
                                max_attempts,
                                delay_ms = delay.as_millis() as u64,
                                error = %e,
                                "Completion request failed, retrying"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        last_error = Some(e);
                    }
                    Err(e) => return Err(e),
                }
            }

            Err(last_error
                .unwrap_or_else(|| WeaveError::Completion("request failed".to_string())))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails a fixed number of times, then succeeds.
    struct FlakyCompletion {
        failures: u32,
        calls: AtomicU32,
    }

    impl CompletionClient for FlakyCompletion {
        fn complete(&self, _model: &str, _prompt: String) -> BoxFuture<'_, Result<String>> {
            Box::pin(async move {
                let call = self.calls.fetch_add(1, Ordering::SeqCst);
                if call < self.failures {
                    Err(WeaveError::Completion("connection reset".to_string()))
                } else {
                    Ok("ok".to_string())
                }
            })
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            delay_ms: 1,
            backoff: 1.0,
        }
    }

    #[tokio::test]
    async fn test_recovers_within_budget() {
        let inner = Arc::new(FlakyCompletion {
            failures: 2,
            calls: AtomicU32::new(0),
        });
        let client = RetryingCompletion::new(inner, fast_policy(3));
        assert_eq!(client.complete("m", "p".into()).await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn test_exhausted_budget_returns_last_error() {
        let inner = Arc::new(FlakyCompletion {
            failures: 10,
            calls: AtomicU32::new(0),
        });
        let client = RetryingCompletion::new(Arc::clone(&inner) as Arc<dyn CompletionClient>, fast_policy(3));
        let err = client.complete("m", "p".into()).await.unwrap_err();
        assert!(matches!(err, WeaveError::Completion(_)));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }
}
