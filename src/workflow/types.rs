//! Task and workflow definitions.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{TaskError, WorkflowError};
use crate::tracker::ExecutionTracker;
use crate::workflow::events::WorkflowEvent;

/// Status of a task within a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Ready to run once selected.
    Pending,
    InProgress,
    Completed,
    /// Attempts exhausted or not retryable.
    Failed,
    /// Honored a cancellation request while running.
    Cancelled,
    /// At least one dependency has not completed.
    WaitingDependencies,
    /// Held at a breakpoint.
    Paused,
}

impl TaskStatus {
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            (Pending, InProgress) | (Pending, WaitingDependencies) | (Pending, Paused) |
            (WaitingDependencies, Pending) |
            (InProgress, Completed) | (InProgress, Failed) |
            (InProgress, Cancelled) | (InProgress, Paused) |
            (Paused, InProgress) | (Paused, Pending) |
            // Operator retry
            (Failed, Pending) | (Cancelled, Pending)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::WaitingDependencies => "waiting_dependencies",
            Self::Paused => "paused",
        };
        write!(f, "{s}")
    }
}

/// Status of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Idle,
    Running,
    Paused,
    Completed,
    Failed,
}

impl WorkflowStatus {
    pub fn can_transition_to(&self, target: WorkflowStatus) -> bool {
        use WorkflowStatus::*;

        matches!(
            (self, target),
            (Idle, Running) |
            (Running, Paused) | (Running, Completed) | (Running, Failed) |
            (Paused, Running) | (Paused, Completed) | (Paused, Failed) |
            // Re-running a finished definition
            (Completed, Running) | (Failed, Running)
        )
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Key/value state shared by every task of a workflow.
#[derive(Debug, Clone, Default)]
pub struct StateBag {
    inner: Arc<Mutex<HashMap<String, serde_json::Value>>>,
}

impl StateBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.lock().get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: serde_json::Value) {
        self.lock().insert(key.into(), value);
    }

    pub fn remove(&self, key: &str) -> Option<serde_json::Value> {
        self.lock().remove(key)
    }

    pub fn snapshot(&self) -> HashMap<String, serde_json::Value> {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, serde_json::Value>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Everything a task attempt can see.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub workflow_id: String,
    pub task_id: String,
    /// Zero for the first attempt, then the retry count.
    pub attempt: u32,
    pub working_dir: PathBuf,
    pub env: HashMap<String, String>,
    pub state: StateBag,
    /// Span the attempt runs in; use it to attach work spawned by the task.
    pub span: tracing::Span,
    /// Cancelled when the workflow is cancelled and the task is cancellable.
    pub cancel: CancellationToken,
    pub(crate) events: broadcast::Sender<WorkflowEvent>,
    pub(crate) tracking: Option<(Arc<ExecutionTracker>, Uuid)>,
}

impl TaskContext {
    /// Report intermediate progress (0-100) for this task.
    pub fn report_progress(&self, percent: u8, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!(task_id = %self.task_id, percent, "{}", message);
        let _ = self.events.send(WorkflowEvent::TaskProgress {
            workflow_id: self.workflow_id.clone(),
            task_id: self.task_id.clone(),
            percent: percent.min(100),
            message,
        });
    }

    /// Append textual output to this attempt's tracker entry.
    pub fn emit_output(&self, chunk: &str) {
        if let Some((tracker, entry)) = &self.tracking
            && let Err(e) = tracker.append_streaming_output(*entry, chunk)
        {
            tracing::debug!(task_id = %self.task_id, "Dropped task output: {}", e);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Body of a task (or of its rollback).
#[async_trait]
pub trait TaskAction: Send + Sync {
    async fn run(&self, ctx: TaskContext) -> Result<serde_json::Value, TaskError>;
}

#[async_trait]
impl<F, Fut> TaskAction for F
where
    F: Fn(TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value, TaskError>> + Send,
{
    async fn run(&self, ctx: TaskContext) -> Result<serde_json::Value, TaskError> {
        (self)(ctx).await
    }
}

/// One unit of work in a workflow.
#[derive(Clone)]
pub struct TaskDefinition {
    pub id: String,
    pub status: TaskStatus,
    pub dependencies: BTreeSet<String>,
    pub retry_count: u32,
    /// Automatic retries allowed; the engine's `retry.max_attempts` when unset.
    pub max_retries: Option<u32>,
    pub cancellable: bool,
    pub retryable: bool,
    /// Per-attempt timeout; the engine default when unset.
    pub timeout: Option<Duration>,
    /// Message of the most recent failed attempt.
    pub last_error: Option<String>,
    /// Value returned by the successful attempt.
    pub output: Option<serde_json::Value>,
    pub(crate) execute: Arc<dyn TaskAction>,
    pub(crate) rollback: Option<Arc<dyn TaskAction>>,
}

impl TaskDefinition {
    pub fn new<F, Fut>(id: impl Into<String>, execute: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, TaskError>> + Send + 'static,
    {
        Self::from_action(id, Arc::new(execute))
    }

    pub fn from_action(id: impl Into<String>, execute: Arc<dyn TaskAction>) -> Self {
        Self {
            id: id.into(),
            status: TaskStatus::Pending,
            dependencies: BTreeSet::new(),
            retry_count: 0,
            max_retries: None,
            cancellable: true,
            retryable: true,
            timeout: None,
            last_error: None,
            output: None,
            execute,
            rollback: None,
        }
    }

    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.dependencies.insert(id.into());
        self
    }

    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = Some(max);
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn with_cancellable(mut self, cancellable: bool) -> Self {
        self.cancellable = cancellable;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Undo action invoked if the workflow fails after this task completed.
    pub fn with_rollback<F, Fut>(mut self, rollback: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, TaskError>> + Send + 'static,
    {
        self.rollback = Some(Arc::new(rollback));
        self
    }

    pub fn has_rollback(&self) -> bool {
        self.rollback.is_some()
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id.clone(),
            status: self.status,
            dependencies: self.dependencies.iter().cloned().collect(),
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            last_error: self.last_error.clone(),
        }
    }
}

impl std::fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("id", &self.id)
            .field("status", &self.status)
            .field("dependencies", &self.dependencies)
            .field("retry_count", &self.retry_count)
            .field("max_retries", &self.max_retries)
            .field("cancellable", &self.cancellable)
            .field("retryable", &self.retryable)
            .field("timeout", &self.timeout)
            .field("has_rollback", &self.rollback.is_some())
            .finish()
    }
}

/// A DAG of tasks plus the environment they run in.
#[derive(Debug, Clone)]
pub struct WorkflowDefinition {
    pub id: String,
    /// Declaration order breaks ties between eligible tasks.
    pub tasks: Vec<TaskDefinition>,
    pub status: WorkflowStatus,
    /// Percentage of tasks with status `completed`.
    pub progress: f64,
    pub working_dir: PathBuf,
    pub env: HashMap<String, String>,
    pub state: StateBag,
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tasks: Vec::new(),
            status: WorkflowStatus::Idle,
            progress: 0.0,
            working_dir: PathBuf::from("."),
            env: HashMap::new(),
            state: StateBag::new(),
        }
    }

    pub fn with_task(mut self, task: TaskDefinition) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = dir;
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn task(&self, id: &str) -> Option<&TaskDefinition> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Reset a failed or cancelled task to `pending` so the next scheduling
    /// pass admits it again, regardless of its exhausted retry budget.
    pub fn retry_task(&mut self, id: &str) -> Result<(), WorkflowError> {
        let task = self
            .tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| WorkflowError::UnknownTask(id.to_string()))?;

        if !matches!(task.status, TaskStatus::Failed | TaskStatus::Cancelled) {
            return Err(WorkflowError::InvalidRetry {
                id: id.to_string(),
                status: task.status.to_string(),
            });
        }
        task.status = TaskStatus::Pending;
        task.last_error = None;
        Ok(())
    }

    pub fn completed_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .count()
    }

    /// Recompute `progress` from task statuses.
    pub fn recompute_progress(&mut self) -> f64 {
        self.progress = if self.tasks.is_empty() {
            100.0
        } else {
            self.completed_count() as f64 / self.tasks.len() as f64 * 100.0
        };
        self.progress
    }

    pub fn snapshot(&self) -> WorkflowSnapshot {
        WorkflowSnapshot {
            id: self.id.clone(),
            status: self.status,
            progress: self.progress,
            tasks: self.tasks.iter().map(TaskDefinition::snapshot).collect(),
        }
    }
}

/// Read-only view of a task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSnapshot {
    pub id: String,
    pub status: TaskStatus,
    pub dependencies: Vec<String>,
    pub retry_count: u32,
    pub max_retries: Option<u32>,
    pub last_error: Option<String>,
}

/// Read-only view of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowSnapshot {
    pub id: String,
    pub status: WorkflowStatus,
    pub progress: f64,
    pub tasks: Vec<TaskSnapshot>,
}
