//! Error types for the assist engine.

use std::time::Duration;

use crate::retry::{Classify, ErrorCategory};
use crate::turn::TurnStatus;

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Turn error: {0}")]
    Turn(#[from] TurnError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Tracker error: {0}")]
    Tracker(#[from] TrackerError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Content generator (model API) errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Network error talking to {provider}: {reason}")]
    Network { provider: String, reason: String },

    #[error("Request to {provider} timed out after {timeout:?}")]
    Timeout { provider: String, timeout: Duration },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Provider {provider} returned server error {status}")]
    ServerError { provider: String, status: u16 },

    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Context length exceeded: {used} tokens used, {limit} allowed")]
    ContextLengthExceeded { used: usize, limit: usize },

    #[error("Stream from {provider} interrupted: {reason}")]
    StreamInterrupted { provider: String, reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised by the turn engine.
#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    /// The operation is not allowed in the turn's current status.
    #[error("Cannot {operation} while turn is {status}")]
    InvalidState {
        operation: &'static str,
        status: TurnStatus,
    },

    /// A tool result referenced a call that is not pending.
    #[error("No pending tool call with id {id}")]
    UnknownToolCall { id: String },

    /// Generation failed after retries; the partial content is kept.
    #[error("Generation failed: {source}")]
    Generation {
        #[source]
        source: LlmError,
        partial_content: String,
    },
}

impl TurnError {
    /// State violations are programming errors and are never retried.
    pub fn is_state_violation(&self) -> bool {
        matches!(self, Self::InvalidState { .. } | Self::UnknownToolCall { .. })
    }
}

/// Tool execution errors.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Tool {name} not found")]
    NotFound { name: String },

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Not authorized: {0}")]
    NotAuthorized(String),

    #[error("Tool {name} timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },
}

/// Errors produced by a single task attempt.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("{0}")]
    Failed(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Task timed out after {0:?}")]
    Timeout(Duration),

    #[error("Task was cancelled")]
    Cancelled,

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error(transparent)]
    Turn(#[from] TurnError),
}

impl TaskError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Workflow definition and control errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("Duplicate task id {0}")]
    DuplicateTask(String),

    #[error("Task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: String, dependency: String },

    #[error("Dependency cycle detected involving tasks: {}", .0.join(", "))]
    CycleDetected(Vec<String>),

    #[error("Task {0} not found")]
    UnknownTask(String),

    #[error("Task {id} is {status}, only failed or cancelled tasks can be retried")]
    InvalidRetry { id: String, status: String },

    #[error("Workflow engine is already running")]
    AlreadyRunning,
}

/// Execution tracker errors.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("Execution entry {0} not found")]
    UnknownEntry(uuid::Uuid),

    #[error("Execution entry {id} cannot go from {from} to {to}")]
    InvalidTransition {
        id: uuid::Uuid,
        from: String,
        to: String,
    },
}

impl Classify for LlmError {
    fn category(&self) -> ErrorCategory {
        match self {
            Self::Network { .. } | Self::StreamInterrupted { .. } => ErrorCategory::Network,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::RateLimited { .. } => ErrorCategory::RateLimit,
            Self::ServerError { status, .. } if *status >= 500 => ErrorCategory::Transient,
            Self::ServerError { .. } => ErrorCategory::InvalidInput,
            Self::AuthFailed { .. } => ErrorCategory::Auth,
            Self::InvalidRequest(_)
            | Self::ContextLengthExceeded { .. }
            | Self::InvalidResponse { .. }
            | Self::Json(_) => ErrorCategory::InvalidInput,
            Self::RequestFailed { .. } => ErrorCategory::Other,
        }
    }
}

impl Classify for ToolError {
    fn category(&self) -> ErrorCategory {
        match self {
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::InvalidParameters(_) => ErrorCategory::InvalidInput,
            Self::NotAuthorized(_) => ErrorCategory::Auth,
            Self::NotFound { .. } | Self::ExecutionFailed(_) => ErrorCategory::Invocation,
        }
    }
}

impl Classify for TaskError {
    fn category(&self) -> ErrorCategory {
        match self {
            Self::Failed(_) => ErrorCategory::Invocation,
            Self::InvalidInput(_) => ErrorCategory::InvalidInput,
            Self::Timeout(_) => ErrorCategory::Timeout,
            Self::Cancelled => ErrorCategory::Cancelled,
            Self::Tool(e) => e.category(),
            Self::Turn(TurnError::Generation { source, .. }) => source.category(),
            Self::Turn(_) => ErrorCategory::StateViolation,
        }
    }
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
