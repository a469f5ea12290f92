//! Events a turn emits to observers.

use serde::Serialize;

use crate::llm::ToolCallRequest;
use crate::tools::tool::ToolResult;

/// Turn lifecycle events, in emission order for one exchange:
/// `Start`, then `Content`/`ToolCall` as the stream delivers them,
/// `ToolResult` per submitted result, and finally one of `Complete`,
/// `Error` or `Cancelled`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    Start { input: String },
    Content { text: String },
    ToolCall { request: ToolCallRequest },
    ToolResult { result: ToolResult },
    Complete {
        content: String,
        tool_calls: Vec<ToolCallRequest>,
    },
    Error {
        message: String,
        partial_content: String,
    },
    Cancelled { partial_content: String },
}
