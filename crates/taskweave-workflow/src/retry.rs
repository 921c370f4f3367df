use std::time::Duration;

use tracing::warn;

use taskweave_core::error::{Result, WeaveError};
use taskweave_core::types::RetryPolicy;

use crate::step::StepRegistry;

/// Jittered exponential delay before the next attempt.
/// `attempt` is zero-based: the delay after the first failure uses 0.
pub fn backoff_delay(attempt: u32, policy: &RetryPolicy) -> Duration {
    let ms = (policy.delay_ms as f64) * policy.backoff.max(1.0).powi(attempt as i32);
    // Add jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms * jitter) as u64)
}

/// Execute a step under the node contract: per-attempt timeout (enforced
/// by the registry) and a sequential retry policy.
///
/// Attempts are never concurrent for the same node. A node configured
/// with `max_attempts = N` that keeps failing is attempted exactly N
/// times before the terminal `NodeExecution` error, which carries the
/// attempt count and the last underlying error.
///
/// Returns the step output together with the attempts consumed.
pub async fn execute_node(
    registry: &StepRegistry,
    node_id: &str,
    kind: &str,
    params: serde_json::Value,
    policy: &RetryPolicy,
    timeout: Option<Duration>,
) -> Result<(serde_json::Value, u32)> {
    let max_attempts = policy.max_attempts.max(1);
    let mut last_error: Option<WeaveError> = None;

    for attempt in 1..=max_attempts {
        match registry.execute(kind, params.clone(), timeout).await {
            Ok(output) => return Ok((output, attempt)),
            Err(e) if e.is_step_retryable() => {
                if attempt < max_attempts {
                    let delay = backoff_delay(attempt - 1, policy);
                    warn!(
                        node_id,
                        kind,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Step attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                last_error = Some(e);
            }
            // Lookup and configuration errors are not the step's own
            // failure; surface them without burning retries.
            Err(e) => return Err(e),
        }
    }

    let message = last_error
        .map(|e| e.to_string())
        .unwrap_or_else(|| "unknown step failure".to_string());
    Err(WeaveError::NodeExecution {
        node: node_id.to_string(),
        attempts: max_attempts,
        message,
    })
}
