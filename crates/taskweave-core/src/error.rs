use thiserror::Error;

#[derive(Debug, Error)]
pub enum WeaveError {
    // Configuration errors — rejected before execution starts
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Unknown role: {0}")]
    UnknownRole(String),

    #[error("Duplicate role: {0}")]
    DuplicateRole(String),

    // Reference resolution errors
    #[error("Unresolved reference {{{{{expression}}}}}: node '{node}' has no successful output")]
    UnresolvedReference { expression: String, node: String },

    // Step errors
    #[error("Step not found: {0}")]
    StepNotFound(String),

    #[error("Step execution failed: {step}: {message}")]
    StepFailed { step: String, message: String },

    #[error("Step timeout after {timeout_secs}s: {step}")]
    StepTimeout { step: String, timeout_secs: u64 },

    #[error("Node '{node}' failed after {attempts} attempt(s): {message}")]
    NodeExecution {
        node: String,
        attempts: u32,
        message: String,
    },

    // Run control errors
    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Invalid run control for {run_id}: {message}")]
    RunControl { run_id: String, message: String },

    #[error("Run cancelled")]
    Cancelled,

    // Agent errors
    #[error("Completion request failed: {0}")]
    Completion(String),

    #[error("Unparseable agent response: {0}")]
    Parse(String),

    #[error("Agent exceeded max duration ({0}s)")]
    MaxDurationExceeded(u64),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WeaveError {
    /// Whether the retry wrapper may re-attempt a step after this error.
    ///
    /// Only failures raised by the step itself (including a per-attempt
    /// timeout) are retryable; configuration and lookup errors are not.
    pub fn is_step_retryable(&self) -> bool {
        matches!(
            self,
            WeaveError::StepFailed { .. } | WeaveError::StepTimeout { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, WeaveError>;
