//! Execution tracker: lifecycle ledger for tool calls and task attempts.
//!
//! The tracker has no policy of its own. The turn engine and the workflow
//! engine report into it; observers (a display layer, tests) subscribe and
//! receive an immutable snapshot of every entry after each mutation.
//! Notification goes through a broadcast channel, so a slow subscriber lags
//! and drops snapshots instead of stalling the reporting component.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::TrackerError;
use crate::llm::ToolCallRequest;
use crate::tools::tool::ToolOutcome;

/// Default number of snapshots buffered per subscriber.
const DEFAULT_CAPACITY: usize = 64;

/// What kind of work an entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionKind {
    ToolCall,
    Task,
}

/// Lifecycle status of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Executing,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn can_transition_to(&self, target: ExecutionStatus) -> bool {
        use ExecutionStatus::*;

        matches!(
            (self, target),
            (Pending, Executing) | (Pending, Completed) | (Pending, Failed) |
            (Executing, Completed) | (Executing, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// One tracked invocation.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionEntry {
    pub id: Uuid,
    pub kind: ExecutionKind,
    /// Tool name or task id.
    pub name: String,
    pub input: serde_json::Value,
    pub status: ExecutionStatus,
    /// Accumulated streaming output.
    pub output: String,
    pub outcome: Option<ToolOutcome>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// `ended_at - started_at` once the entry is terminal.
    pub duration_ms: Option<u64>,
}

/// Immutable view of every entry at one point in time.
pub type ExecutionSnapshot = Arc<Vec<ExecutionEntry>>;

/// Shared ledger of invocation lifecycles.
///
/// Entries accumulate until [`ExecutionTracker::clear`] unless a retention
/// bound is set with [`ExecutionTracker::with_retention`]. The bound only
/// evicts terminal entries, oldest first; live entries are never dropped.
#[derive(Debug)]
pub struct ExecutionTracker {
    entries: Mutex<Vec<ExecutionEntry>>,
    tx: broadcast::Sender<ExecutionSnapshot>,
    retention: Option<usize>,
}

impl Default for ExecutionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionTracker {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            entries: Mutex::new(Vec::new()),
            tx,
            retention: None,
        }
    }

    /// Keep at most `max_entries`, evicting the oldest terminal entries first.
    pub fn with_retention(mut self, max_entries: usize) -> Self {
        self.retention = Some(max_entries);
        self
    }

    /// Receive a snapshot after every mutation.
    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionSnapshot> {
        self.tx.subscribe()
    }

    /// Current entries, in insertion order.
    pub fn snapshot(&self) -> ExecutionSnapshot {
        Arc::new(self.lock().clone())
    }

    pub fn get(&self, id: Uuid) -> Option<ExecutionEntry> {
        self.lock().iter().find(|e| e.id == id).cloned()
    }

    /// Register a new pending entry.
    pub fn add(
        &self,
        kind: ExecutionKind,
        name: impl Into<String>,
        input: serde_json::Value,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let _ = self.mutate(|entries| {
            entries.push(ExecutionEntry {
                id,
                kind,
                name: name.into(),
                input,
                status: ExecutionStatus::Pending,
                output: String::new(),
                outcome: None,
                created_at: Utc::now(),
                started_at: None,
                ended_at: None,
                duration_ms: None,
            });
            if let Some(max) = self.retention {
                evict_terminal(entries, max);
            }
            Ok(())
        });
        id
    }

    /// Register a model-raised tool call.
    pub fn add_tool_call(&self, call: &ToolCallRequest) -> Uuid {
        self.add(
            ExecutionKind::ToolCall,
            call.name.clone(),
            serde_json::Value::Object(call.input.clone()),
        )
    }

    /// Mark an entry as executing.
    pub fn start(&self, id: Uuid) -> Result<(), TrackerError> {
        self.mutate(|entries| {
            let entry = find_mut(entries, id)?;
            transition(entry, ExecutionStatus::Executing)?;
            entry.started_at = Some(Utc::now());
            Ok(())
        })
    }

    /// Record the outcome; failures land in `Failed`, everything else in `Completed`.
    pub fn complete(&self, id: Uuid, outcome: ToolOutcome) -> Result<(), TrackerError> {
        self.mutate(|entries| {
            let entry = find_mut(entries, id)?;
            let target = if outcome.is_success() {
                ExecutionStatus::Completed
            } else {
                ExecutionStatus::Failed
            };
            transition(entry, target)?;
            entry.ended_at = Some(Utc::now());
            entry.outcome = Some(outcome);
            Ok(())
        })
    }

    /// Append a chunk of streamed output to a non-terminal entry.
    pub fn append_streaming_output(&self, id: Uuid, chunk: &str) -> Result<(), TrackerError> {
        self.mutate(|entries| {
            let entry = find_mut(entries, id)?;
            if entry.status.is_terminal() {
                return Err(TrackerError::InvalidTransition {
                    id,
                    from: entry.status.to_string(),
                    to: "streaming".to_string(),
                });
            }
            entry.output.push_str(chunk);
            Ok(())
        })
    }

    /// Drop every entry.
    pub fn clear(&self) {
        let _ = self.mutate(|entries| {
            entries.clear();
            Ok(())
        });
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ExecutionEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply a mutation, recompute durations and notify subscribers.
    fn mutate<F>(&self, f: F) -> Result<(), TrackerError>
    where
        F: FnOnce(&mut Vec<ExecutionEntry>) -> Result<(), TrackerError>,
    {
        let snapshot = {
            let mut entries = self.lock();
            f(&mut entries)?;
            for entry in entries.iter_mut() {
                entry.duration_ms = compute_duration_ms(entry);
            }
            Arc::new(entries.clone())
        };
        // No receivers is fine; lagging receivers drop old snapshots.
        let _ = self.tx.send(snapshot);
        Ok(())
    }
}

fn evict_terminal(entries: &mut Vec<ExecutionEntry>, max: usize) {
    let mut excess = entries.len().saturating_sub(max);
    if excess == 0 {
        return;
    }
    entries.retain(|e| {
        if excess > 0 && e.status.is_terminal() {
            excess -= 1;
            return false;
        }
        true
    });
    if excess > 0 {
        tracing::debug!(excess, "Tracker over retention bound with only live entries");
    }
}

fn find_mut(entries: &mut [ExecutionEntry], id: Uuid) -> Result<&mut ExecutionEntry, TrackerError> {
    entries
        .iter_mut()
        .find(|e| e.id == id)
        .ok_or(TrackerError::UnknownEntry(id))
}

fn transition(entry: &mut ExecutionEntry, target: ExecutionStatus) -> Result<(), TrackerError> {
    if !entry.status.can_transition_to(target) {
        return Err(TrackerError::InvalidTransition {
            id: entry.id,
            from: entry.status.to_string(),
            to: target.to_string(),
        });
    }
    entry.status = target;
    Ok(())
}

fn compute_duration_ms(entry: &ExecutionEntry) -> Option<u64> {
    let end = entry.ended_at?;
    let start = entry.started_at.unwrap_or(entry.created_at);
    Some(end.signed_duration_since(start).num_milliseconds().max(0) as u64)
}
