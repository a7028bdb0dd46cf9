use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConductorError {
    // Selection errors
    #[error("Agent selection failed: {0}")]
    Selection(String),

    #[error("No agents available")]
    NoAgentsAvailable,

    // Execution errors
    #[error("Step execution failed: {step}: {message}")]
    StepExecution { step: String, message: String },

    #[error("Step timeout after {timeout_secs}s: {step}")]
    StepTimeout { step: String, timeout_secs: u64 },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Success criteria not met: {0}")]
    SuccessCriteriaNotMet(String),

    #[error("Expression error: {0}")]
    Expression(String),

    #[error("Invocation failed: {0}")]
    Invocation(String),

    #[error("Execution cancelled")]
    Cancelled,

    // Lookup errors
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),

    #[error("Invalid state for {execution}: {message}")]
    InvalidState { execution: String, message: String },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

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

impl ConductorError {
    /// Whether a retry of the same step could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConductorError::StepExecution { .. }
                | ConductorError::StepTimeout { .. }
                | ConductorError::Invocation(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ConductorError>;
