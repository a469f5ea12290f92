//! Runs the tool calls a turn raises and feeds the results back until the
//! turn settles.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{ToolError, TurnError};
use crate::llm::ToolCallRequest;
use crate::tools::registry::ToolRegistry;
use crate::tools::tool::{ToolContext, ToolOutcome, ToolResult};
use crate::turn::{TurnManager, TurnOutcome, TurnStatus};

/// Default bound on model/tool round-trips within one turn.
pub const DEFAULT_MAX_ROUND_TRIPS: usize = 16;

/// Executes pending tool calls against a [`ToolRegistry`].
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    working_dir: PathBuf,
    env: HashMap<String, String>,
    max_round_trips: usize,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>, working_dir: PathBuf) -> Self {
        Self {
            registry,
            working_dir,
            env: HashMap::new(),
            max_round_trips: DEFAULT_MAX_ROUND_TRIPS,
        }
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_max_round_trips(mut self, max: usize) -> Self {
        self.max_round_trips = max;
        self
    }

    /// Drive `turn` until it is no longer waiting for tools.
    ///
    /// Calls are executed in the order the model raised them; once the turn
    /// is cancelled no further call is started. When the
    /// round-trip bound is hit the turn is returned still waiting, so the
    /// caller can resolve or reset it.
    pub async fn resolve(&self, turn: &mut TurnManager) -> Result<TurnOutcome, TurnError> {
        let mut outcome = turn.outcome();
        let mut round_trips = 0;

        while turn.status() == TurnStatus::WaitingForTool {
            if round_trips >= self.max_round_trips {
                tracing::warn!(
                    round_trips,
                    pending = turn.pending_tool_calls().len(),
                    "Tool round-trip limit reached; leaving turn waiting"
                );
                break;
            }
            round_trips += 1;

            for call in turn.pending_tool_calls() {
                let result = self.run_call(turn, &call).await;
                outcome = turn.submit_tool_result(result).await?;
                // A cancel settles the turn; remaining calls are abandoned.
                if turn.status() != TurnStatus::WaitingForTool {
                    break;
                }
            }
        }

        Ok(outcome)
    }

    async fn run_call(&self, turn: &TurnManager, call: &ToolCallRequest) -> ToolResult {
        let mut ctx = ToolContext::new(call.id.clone(), self.working_dir.clone())
            .with_env(self.env.clone());
        if let (Some(tracker), Some(entry)) = (turn.tracker(), turn.tracking_id(&call.id)) {
            if let Err(e) = tracker.start(entry) {
                tracing::debug!(tool_call_id = %call.id, "Tracker rejected start: {}", e);
            }
            ctx = ctx.with_tracking(Arc::clone(tracker), entry);
        }

        let Some(tool) = self.registry.get(&call.name).await else {
            tracing::warn!(tool = %call.name, tool_call_id = %call.id, "Model called unknown tool");
            let err = ToolError::NotFound {
                name: call.name.clone(),
            };
            return ToolResult {
                tool_call_id: call.id.clone(),
                outcome: Err(err).into(),
            };
        };

        tracing::debug!(tool = %call.name, tool_call_id = %call.id, "Tool call started");
        let tool_timeout = tool.execution_timeout();
        let start = std::time::Instant::now();
        let params = serde_json::Value::Object(call.input.clone());
        let result = tokio::time::timeout(tool_timeout, tool.execute(params, &ctx))
            .await
            .unwrap_or_else(|_| {
                Err(ToolError::Timeout {
                    name: call.name.clone(),
                    timeout: tool_timeout,
                })
            });

        let outcome = ToolOutcome::from(result);
        tracing::debug!(
            tool = %call.name,
            elapsed_ms = start.elapsed().as_millis() as u64,
            success = outcome.is_success(),
            "Tool call finished"
        );

        ToolResult {
            tool_call_id: call.id.clone(),
            outcome,
        }
    }
}
