//! Tool trait and the typed outcome every tool invocation resolves to.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use crate::error::ToolError;
use crate::tracker::ExecutionTracker;

/// Default per-invocation timeout.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(60);

/// Why a tool invocation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    InvalidInput,
    NotFound,
    Timeout,
    ExecutionFailed,
    NotAuthorized,
    Cancelled,
}

impl From<&ToolError> for FailureKind {
    fn from(err: &ToolError) -> Self {
        match err {
            ToolError::NotFound { .. } => Self::NotFound,
            ToolError::InvalidParameters(_) => Self::InvalidInput,
            ToolError::ExecutionFailed(_) => Self::ExecutionFailed,
            ToolError::NotAuthorized(_) => Self::NotAuthorized,
            ToolError::Timeout { .. } => Self::Timeout,
        }
    }
}

/// Outcome of a tool invocation, independent of the tool's category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolOutcome {
    Success {
        value: serde_json::Value,
    },
    Failure {
        kind: FailureKind,
        message: String,
    },
}

impl ToolOutcome {
    pub fn success(value: serde_json::Value) -> Self {
        Self::Success { value }
    }

    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        Self::Failure {
            kind,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Text form sent back to the model in the tool-result message.
    pub fn to_message_content(&self) -> String {
        match self {
            Self::Success {
                value: serde_json::Value::String(s),
            } => s.clone(),
            Self::Success { value } => value.to_string(),
            Self::Failure { kind, message } => {
                let kind = serde_json::to_value(kind)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default();
                format!("Error ({kind}): {message}")
            }
        }
    }
}

impl From<Result<ToolOutput, ToolError>> for ToolOutcome {
    fn from(result: Result<ToolOutput, ToolError>) -> Self {
        match result {
            Ok(output) => Self::success(output.result),
            Err(e) => Self::failure(FailureKind::from(&e), e.to_string()),
        }
    }
}

/// Result supplied by the caller for a pending tool call. Consumed exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub outcome: ToolOutcome,
}

impl ToolResult {
    pub fn success(tool_call_id: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            outcome: ToolOutcome::success(value),
        }
    }

    pub fn failure(
        tool_call_id: impl Into<String>,
        kind: FailureKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            outcome: ToolOutcome::failure(kind, message),
        }
    }
}

/// Output of a successful tool execution.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub result: serde_json::Value,
    pub duration: Duration,
}

impl ToolOutput {
    pub fn success(result: serde_json::Value, duration: Duration) -> Self {
        Self { result, duration }
    }

    pub fn text(text: impl Into<String>, duration: Duration) -> Self {
        Self {
            result: serde_json::Value::String(text.into()),
            duration,
        }
    }
}

/// Environment a tool runs in.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub call_id: String,
    pub working_dir: PathBuf,
    pub env: HashMap<String, String>,
    tracking: Option<(Arc<ExecutionTracker>, Uuid)>,
}

impl ToolContext {
    pub fn new(call_id: impl Into<String>, working_dir: PathBuf) -> Self {
        Self {
            call_id: call_id.into(),
            working_dir,
            env: HashMap::new(),
            tracking: None,
        }
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub(crate) fn with_tracking(mut self, tracker: Arc<ExecutionTracker>, entry: Uuid) -> Self {
        self.tracking = Some((tracker, entry));
        self
    }

    /// Stream a chunk of textual output to observers, if anyone is tracking this call.
    pub fn emit_output(&self, chunk: &str) {
        if let Some((tracker, entry)) = &self.tracking
            && let Err(e) = tracker.append_streaming_output(*entry, chunk)
        {
            tracing::debug!(call_id = %self.call_id, "Dropped tool output: {}", e);
        }
    }
}

/// A capability the model can invoke.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema of the accepted input.
    fn parameters_schema(&self) -> serde_json::Value;

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError>;

    fn execution_timeout(&self) -> Duration {
        DEFAULT_TOOL_TIMEOUT
    }
}

/// Extract a required string parameter.
pub fn require_str<'a>(params: &'a serde_json::Value, name: &str) -> Result<&'a str, ToolError> {
    params
        .get(name)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::InvalidParameters(format!("missing '{name}' parameter")))
}
