//! Debug breakpoints: advisory pause points before a task runs.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::types::StateBag;

/// Extra condition a breakpoint must satisfy to pause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BreakpointCondition {
    Always,
    /// Pause only while the breakpoint has been hit fewer than `n` times.
    HitCountBelow { n: u32 },
    /// Pause only on retries number `n` and later.
    RetryCountAtLeast { n: u32 },
    /// Pause when the shared workflow state holds `value` under `key`.
    StateEquals {
        key: String,
        value: serde_json::Value,
    },
}

impl BreakpointCondition {
    pub fn evaluate(&self, hit_count: u32, retry_count: u32, state: &StateBag) -> bool {
        match self {
            Self::Always => true,
            Self::HitCountBelow { n } => hit_count < *n,
            Self::RetryCountAtLeast { n } => retry_count >= *n,
            Self::StateEquals { key, value } => state.get(key).as_ref() == Some(value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugBreakpoint {
    pub id: Uuid,
    pub task_id: String,
    pub enabled: bool,
    pub condition: Option<BreakpointCondition>,
    pub hit_count: u32,
}

impl DebugBreakpoint {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id: task_id.into(),
            enabled: true,
            condition: None,
            hit_count: 0,
        }
    }

    pub fn with_condition(mut self, condition: BreakpointCondition) -> Self {
        self.condition = Some(condition);
        self
    }

    /// Whether this breakpoint pauses before `task_id`'s next attempt.
    pub fn matches(&self, task_id: &str, retry_count: u32, state: &StateBag) -> bool {
        self.enabled
            && self.task_id == task_id
            && self
                .condition
                .as_ref()
                .is_none_or(|c| c.evaluate(self.hit_count, retry_count, state))
    }
}
