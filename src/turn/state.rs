//! Turn state machine.

use serde::{Deserialize, Serialize};

/// Status of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    /// No exchange has started since construction or the last reset.
    Idle,
    /// A generation stream is open.
    InProgress,
    /// The stream ended with tool calls that still need results.
    WaitingForTool,
    /// The assistant message was finalized.
    Completed,
    /// Generation failed after retries.
    Failed,
    /// Stopped by a cancel; terminal until the next execute.
    Cancelled,
}

impl TurnStatus {
    /// Check if this status allows transitioning to another status.
    ///
    /// `reset()` is not modelled here; it returns any status to `Idle`.
    pub fn can_transition_to(&self, target: TurnStatus) -> bool {
        use TurnStatus::*;

        matches!(
            (self, target),
            // A new exchange may start from any settled status
            (Idle, InProgress) | (Completed, InProgress) | (Failed, InProgress) |
            (Cancelled, InProgress) |
            // Stream outcomes
            (InProgress, Completed) | (InProgress, WaitingForTool) | (InProgress, Failed) |
            // All tool results submitted, generation resumes
            (WaitingForTool, InProgress) |
            (InProgress, Cancelled) | (WaitingForTool, Cancelled)
        )
    }

    /// Whether an exchange is underway (stream open or awaiting tool results).
    pub fn is_active(&self) -> bool {
        matches!(self, Self::InProgress | Self::WaitingForTool)
    }
}

impl std::fmt::Display for TurnStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::InProgress => "in_progress",
            Self::WaitingForTool => "waiting_for_tool",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}
