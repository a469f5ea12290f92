//! Workflow engine: single-flight scheduler for a DAG of tasks.
//!
//! ```text
//! loop:
//!   apply queued control commands
//!   cancelled?                    ──▶ stop (Cancelled)
//!   refresh pending / waiting_dependencies
//!   first eligible task (declaration order)?
//!     none                        ──▶ stop (Completed | TaskFailed | Deadlocked)
//!   paused?                       ──▶ wait for a command
//!   breakpoint? ─▶ pause until resumed
//!   attempt ─fail─▶ retry with backoff while budget remains
//! ```
//!
//! At most one task body runs at a time. Control commands arriving while a
//! task runs are applied immediately; they only affect which work starts next,
//! except that `cancel` also fires the running task's cancellation token when
//! the task is cancellable.

use std::pin::pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{TaskError, WorkflowError};
use crate::retry::{Classify, ErrorCategory, RetryPolicy};
use crate::tools::tool::{FailureKind, ToolOutcome};
use crate::tracker::{ExecutionKind, ExecutionTracker};
use crate::workflow::breakpoint::DebugBreakpoint;
use crate::workflow::events::WorkflowEvent;
use crate::workflow::graph;
use crate::workflow::types::{
    StateBag, TaskContext, TaskDefinition, TaskSnapshot, TaskStatus, WorkflowDefinition,
    WorkflowSnapshot, WorkflowStatus,
};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Pause,
    Resume,
    Cancel,
    Retry(String),
}

/// Why a run stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Termination {
    Completed,
    /// These tasks failed and nothing else could run.
    TaskFailed { tasks: Vec<String> },
    Cancelled,
    /// Nothing failed, yet these tasks can never become eligible.
    Deadlocked { blocked: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RollbackOutcome {
    pub task_id: String,
    pub error: Option<String>,
}

/// Summary of one `run`.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowReport {
    pub workflow_id: String,
    pub status: WorkflowStatus,
    pub termination: Termination,
    pub progress: f64,
    /// Completed tasks in completion order.
    pub completed_steps: Vec<String>,
    pub failed_steps: Vec<String>,
    pub tasks: Vec<TaskSnapshot>,
    /// Rollbacks invoked, most recently completed task first.
    pub rollbacks: Vec<RollbackOutcome>,
    /// Task attempts started during this run.
    pub attempts: u32,
    pub elapsed: Duration,
}

impl WorkflowReport {
    pub fn is_success(&self) -> bool {
        self.termination == Termination::Completed
    }
}

/// Handle for controlling a run from another task.
#[derive(Debug, Clone)]
pub struct WorkflowController {
    commands: mpsc::UnboundedSender<Command>,
    snapshots: watch::Receiver<Option<WorkflowSnapshot>>,
}

impl WorkflowController {
    /// Stop starting new tasks once the running one finishes.
    pub fn pause(&self) {
        self.send(Command::Pause);
    }

    pub fn resume(&self) {
        self.send(Command::Resume);
    }

    /// Stop launching tasks; the running task is asked to stop if cancellable.
    pub fn cancel(&self) {
        self.send(Command::Cancel);
    }

    /// Re-admit a failed or cancelled task outside its retry budget.
    pub fn retry(&self, task_id: impl Into<String>) {
        self.send(Command::Retry(task_id.into()));
    }

    /// Latest published state of the current (or last) run.
    pub fn snapshot(&self) -> Option<WorkflowSnapshot> {
        self.snapshots.borrow().clone()
    }

    /// Receiver notified on every published snapshot.
    pub fn watch(&self) -> watch::Receiver<Option<WorkflowSnapshot>> {
        self.snapshots.clone()
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::debug!("Workflow engine dropped; control command ignored");
        }
    }
}

/// Executes workflow definitions, one run at a time.
pub struct WorkflowEngine {
    config: EngineConfig,
    policy: RetryPolicy,
    tracker: Option<Arc<ExecutionTracker>>,
    breakpoints: Mutex<Vec<DebugBreakpoint>>,
    events: broadcast::Sender<WorkflowEvent>,
    commands_tx: mpsc::UnboundedSender<Command>,
    /// Held for the whole run; doubles as the single-flight guard.
    commands_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Command>>,
    snapshots: watch::Sender<Option<WorkflowSnapshot>>,
}

impl WorkflowEngine {
    pub fn new(config: EngineConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (snapshots, _) = watch::channel(None);
        Self {
            config,
            policy: RetryPolicy::new(),
            tracker: None,
            breakpoints: Mutex::new(Vec::new()),
            events,
            commands_tx,
            commands_rx: tokio::sync::Mutex::new(commands_rx),
            snapshots,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Record every task attempt in `tracker`.
    pub fn with_tracker(mut self, tracker: Arc<ExecutionTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.events.subscribe()
    }

    pub fn controller(&self) -> WorkflowController {
        WorkflowController {
            commands: self.commands_tx.clone(),
            snapshots: self.snapshots.subscribe(),
        }
    }

    // ── Breakpoints ─────────────────────────────────────────────────

    pub fn add_breakpoint(&self, breakpoint: DebugBreakpoint) -> Uuid {
        let id = breakpoint.id;
        self.lock_breakpoints().push(breakpoint);
        id
    }

    /// Returns false if no breakpoint has this id.
    pub fn set_breakpoint_enabled(&self, id: Uuid, enabled: bool) -> bool {
        match self.lock_breakpoints().iter_mut().find(|b| b.id == id) {
            Some(breakpoint) => {
                breakpoint.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn remove_breakpoint(&self, id: Uuid) -> bool {
        let mut breakpoints = self.lock_breakpoints();
        let before = breakpoints.len();
        breakpoints.retain(|b| b.id != id);
        breakpoints.len() != before
    }

    pub fn breakpoints(&self) -> Vec<DebugBreakpoint> {
        self.lock_breakpoints().clone()
    }

    // ── Run ─────────────────────────────────────────────────────────

    /// Drive `definition` until it completes, fails, deadlocks or is cancelled.
    ///
    /// Tasks already `completed` are not executed again, so a definition can
    /// be re-run after [`WorkflowDefinition::retry_task`]. Control commands
    /// sent while no run is active are discarded.
    pub async fn run(
        &self,
        definition: &mut WorkflowDefinition,
    ) -> Result<WorkflowReport, WorkflowError> {
        let mut commands = self
            .commands_rx
            .try_lock()
            .map_err(|_| WorkflowError::AlreadyRunning)?;
        graph::validate(&definition.tasks)?;

        let mut stale = 0;
        while commands.try_recv().is_ok() {
            stale += 1;
        }
        if stale > 0 {
            tracing::debug!(workflow_id = %definition.id, stale, "Discarded control commands sent while idle");
        }

        let mut run = Run::start(self, definition);
        let termination = run.drive(&mut commands).await;
        Ok(run.finish(termination).await)
    }

    fn hit_breakpoint(&self, task_id: &str, retry_count: u32, state: &StateBag) -> Option<(Uuid, u32)> {
        let mut breakpoints = self.lock_breakpoints();
        let breakpoint = breakpoints
            .iter_mut()
            .find(|b| b.matches(task_id, retry_count, state))?;
        breakpoint.hit_count += 1;
        Some((breakpoint.id, breakpoint.hit_count))
    }

    fn lock_breakpoints(&self) -> MutexGuard<'_, Vec<DebugBreakpoint>> {
        self.breakpoints.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: WorkflowEvent) {
        // No subscribers is fine; lagging subscribers skip ahead.
        let _ = self.events.send(event);
    }

    fn publish(&self, definition: &WorkflowDefinition) {
        self.snapshots.send_replace(Some(definition.snapshot()));
    }
}

/// State of one `run` call. Owns the definition exclusively until it returns.
struct Run<'a> {
    engine: &'a WorkflowEngine,
    def: &'a mut WorkflowDefinition,
    cancelled: bool,
    completion_order: Vec<String>,
    attempts: u32,
    started: Instant,
}

impl<'a> Run<'a> {
    fn start(engine: &'a WorkflowEngine, def: &'a mut WorkflowDefinition) -> Self {
        let default_max_retries = engine.config.retry.max_attempts;
        let mut completion_order = Vec::new();
        for task in &mut def.tasks {
            task.max_retries.get_or_insert(default_max_retries);
            match task.status {
                // Left behind by a run that was dropped mid-flight.
                TaskStatus::InProgress | TaskStatus::Paused => task.status = TaskStatus::Pending,
                TaskStatus::Completed => completion_order.push(task.id.clone()),
                _ => {}
            }
        }
        if matches!(def.status, WorkflowStatus::Running | WorkflowStatus::Paused) {
            def.status = WorkflowStatus::Idle;
        }
        def.recompute_progress();

        tracing::info!(
            workflow_id = %def.id,
            tasks = def.tasks.len(),
            already_completed = completion_order.len(),
            "Workflow started"
        );

        let mut run = Self {
            engine,
            def,
            cancelled: false,
            completion_order,
            attempts: 0,
            started: Instant::now(),
        };
        run.set_workflow_status(WorkflowStatus::Running);
        run
    }

    async fn drive(&mut self, commands: &mut mpsc::UnboundedReceiver<Command>) -> Termination {
        loop {
            while let Ok(command) = commands.try_recv() {
                self.apply(command, None);
            }
            if self.cancelled {
                return Termination::Cancelled;
            }

            self.refresh_waiting();
            let Some(index) = self.next_eligible() else {
                return self.settle();
            };

            if self.def.status == WorkflowStatus::Paused {
                match commands.recv().await {
                    Some(command) => self.apply(command, None),
                    None => self.cancelled = true,
                }
                continue;
            }

            self.run_task(index, commands).await;
        }
    }

    /// Outcome once no task is eligible.
    fn settle(&self) -> Termination {
        let failed: Vec<String> = self
            .def
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .map(|t| t.id.clone())
            .collect();

        if self.def.tasks.iter().all(|t| t.status == TaskStatus::Completed) {
            Termination::Completed
        } else if !failed.is_empty() {
            Termination::TaskFailed { tasks: failed }
        } else {
            Termination::Deadlocked {
                blocked: self
                    .def
                    .tasks
                    .iter()
                    .filter(|t| t.status != TaskStatus::Completed)
                    .map(|t| t.id.clone())
                    .collect(),
            }
        }
    }

    fn refresh_waiting(&mut self) {
        for index in 0..self.def.tasks.len() {
            let task = &self.def.tasks[index];
            if !matches!(task.status, TaskStatus::Pending | TaskStatus::WaitingDependencies) {
                continue;
            }
            let target = if graph::dependencies_met(task, &self.def.tasks) {
                TaskStatus::Pending
            } else {
                TaskStatus::WaitingDependencies
            };
            if target != task.status {
                self.set_task_status(index, target);
            }
        }
    }

    fn next_eligible(&self) -> Option<usize> {
        self.def.tasks.iter().position(|t| {
            t.status == TaskStatus::Pending && graph::dependencies_met(t, &self.def.tasks)
        })
    }

    /// Run one task through all of its attempts.
    async fn run_task(&mut self, index: usize, commands: &mut mpsc::UnboundedReceiver<Command>) {
        loop {
            if !self.wait_at_breakpoint(index, commands).await {
                break;
            }

            let result = self.attempt(index, commands).await;
            let task_id = self.def.tasks[index].id.clone();
            match result {
                Ok(value) => {
                    let task = &mut self.def.tasks[index];
                    task.output = Some(value);
                    task.last_error = None;
                    self.completion_order.push(task_id.clone());
                    self.set_task_status(index, TaskStatus::Completed);
                    tracing::info!(workflow_id = %self.def.id, task_id = %task_id, "Task completed");
                    break;
                }
                Err(TaskError::Cancelled) if self.cancelled => {
                    self.def.tasks[index].last_error = Some(TaskError::Cancelled.to_string());
                    self.set_task_status(index, TaskStatus::Cancelled);
                    tracing::info!(workflow_id = %self.def.id, task_id = %task_id, "Task cancelled");
                    break;
                }
                Err(err) => {
                    self.def.tasks[index].last_error = Some(err.to_string());
                    if !self.should_retry(index, &err) {
                        let task = &self.def.tasks[index];
                        tracing::error!(
                            workflow_id = %self.def.id,
                            task_id = %task_id,
                            retry_count = task.retry_count,
                            max_retries = task.max_retries.unwrap_or_default(),
                            "Task failed: {}",
                            err
                        );
                        self.set_task_status(index, TaskStatus::Failed);
                        self.engine.emit(WorkflowEvent::Error {
                            workflow_id: self.def.id.clone(),
                            task_id: Some(task_id),
                            message: err.to_string(),
                        });
                        break;
                    }

                    self.def.tasks[index].retry_count += 1;
                    let retry_count = self.def.tasks[index].retry_count;
                    let delay = self
                        .engine
                        .policy
                        .next_delay(retry_count, &self.engine.config.retry);
                    tracing::warn!(
                        workflow_id = %self.def.id,
                        task_id = %task_id,
                        retry_count,
                        delay_ms = delay.as_millis() as u64,
                        "Task attempt failed, retrying: {}",
                        err
                    );
                    self.task_changed(index);

                    if !self.backoff(delay, commands).await {
                        self.set_task_status(index, TaskStatus::Cancelled);
                        break;
                    }
                }
            }
        }
        self.emit_metrics();
    }

    /// Pause before the attempt if a breakpoint matches. Returns false if the
    /// workflow was cancelled while held.
    async fn wait_at_breakpoint(
        &mut self,
        index: usize,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> bool {
        let task = &self.def.tasks[index];
        let Some((breakpoint_id, hit_count)) =
            self.engine
                .hit_breakpoint(&task.id, task.retry_count, &self.def.state)
        else {
            return true;
        };
        let task_id = task.id.clone();

        tracing::info!(
            workflow_id = %self.def.id,
            task_id = %task_id,
            %breakpoint_id,
            hit_count,
            "Breakpoint hit; waiting for resume"
        );
        self.set_task_status(index, TaskStatus::Paused);
        if self.def.status == WorkflowStatus::Running {
            self.set_workflow_status(WorkflowStatus::Paused);
        }
        self.engine.emit(WorkflowEvent::BreakpointHit {
            workflow_id: self.def.id.clone(),
            breakpoint_id,
            task_id,
            hit_count,
        });

        loop {
            match commands.recv().await {
                Some(command) => self.apply(command, None),
                None => self.cancelled = true,
            }
            if self.cancelled {
                // The attempt never started.
                self.set_task_status(index, TaskStatus::Pending);
                return false;
            }
            if self.def.status == WorkflowStatus::Running {
                return true;
            }
        }
    }

    /// Execute one attempt under its timeout, applying commands meanwhile.
    async fn attempt(
        &mut self,
        index: usize,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> Result<serde_json::Value, TaskError> {
        if self.def.tasks[index].status != TaskStatus::InProgress {
            self.set_task_status(index, TaskStatus::InProgress);
        }
        self.attempts += 1;

        let task = &self.def.tasks[index];
        let task_id = task.id.clone();
        let attempt = task.retry_count;
        let timeout = task.timeout.unwrap_or(self.engine.config.default_task_timeout);
        let cancellable = task.cancellable;
        let action = Arc::clone(&task.execute);

        let tracking = self.engine.tracker.as_ref().map(|tracker| {
            let entry = tracker.add(
                ExecutionKind::Task,
                task_id.clone(),
                serde_json::json!({ "workflow_id": self.def.id, "attempt": attempt }),
            );
            if let Err(e) = tracker.start(entry) {
                tracing::debug!(task_id = %task_id, "Tracker rejected start: {}", e);
            }
            (Arc::clone(tracker), entry)
        });

        let token = CancellationToken::new();
        let span = tracing::info_span!("task", workflow_id = %self.def.id, task_id = %task_id, attempt);
        let ctx = self.context(task, token.clone(), tracking.clone(), span.clone());
        tracing::debug!(
            task_id = %task_id,
            attempt,
            timeout_ms = timeout.as_millis() as u64,
            "Task attempt started"
        );

        let mut work = pin!(tokio::time::timeout(timeout, action.run(ctx)).instrument(span));
        let result = loop {
            tokio::select! {
                result = &mut work => break result,
                Some(command) = commands.recv() => {
                    self.apply(command, cancellable.then_some(&token));
                }
            }
        };
        let result = result.unwrap_or_else(|_| Err(TaskError::Timeout(timeout)));

        if let Some((tracker, entry)) = &tracking {
            let outcome = match &result {
                Ok(value) => ToolOutcome::success(value.clone()),
                Err(e) => ToolOutcome::failure(failure_kind(e), e.to_string()),
            };
            if let Err(e) = tracker.complete(*entry, outcome) {
                tracing::debug!(task_id = %task_id, "Tracker rejected completion: {}", e);
            }
        }
        result
    }

    fn should_retry(&self, index: usize, err: &TaskError) -> bool {
        let task = &self.def.tasks[index];
        let max_retries = task
            .max_retries
            .unwrap_or(self.engine.config.retry.max_attempts);
        !self.cancelled
            && task.retryable
            && task.retry_count < max_retries
            && !matches!(
                err.category(),
                ErrorCategory::Cancelled | ErrorCategory::StateViolation
            )
    }

    /// Sleep between attempts. Returns false if cancelled meanwhile.
    async fn backoff(
        &mut self,
        delay: Duration,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> bool {
        let mut sleep = pin!(tokio::time::sleep(delay));
        loop {
            tokio::select! {
                () = &mut sleep => return true,
                Some(command) = commands.recv() => {
                    self.apply(command, None);
                    if self.cancelled {
                        return false;
                    }
                }
            }
        }
    }

    fn apply(&mut self, command: Command, running: Option<&CancellationToken>) {
        match command {
            Command::Pause => {
                if self.def.status == WorkflowStatus::Running {
                    tracing::info!(workflow_id = %self.def.id, "Workflow paused");
                    self.set_workflow_status(WorkflowStatus::Paused);
                }
            }
            Command::Resume => {
                if self.def.status == WorkflowStatus::Paused {
                    tracing::info!(workflow_id = %self.def.id, "Workflow resumed");
                    self.set_workflow_status(WorkflowStatus::Running);
                }
            }
            Command::Cancel => {
                if !self.cancelled {
                    tracing::info!(workflow_id = %self.def.id, "Workflow cancellation requested");
                }
                self.cancelled = true;
                if let Some(token) = running {
                    token.cancel();
                }
            }
            Command::Retry(task_id) => match self.def.retry_task(&task_id) {
                Ok(()) => {
                    tracing::info!(workflow_id = %self.def.id, task_id = %task_id, "Task re-admitted by operator");
                    if let Some(index) = self.def.tasks.iter().position(|t| t.id == task_id) {
                        self.task_changed(index);
                    }
                }
                Err(e) => {
                    tracing::warn!(workflow_id = %self.def.id, "Ignoring retry request: {}", e);
                    self.engine.emit(WorkflowEvent::Error {
                        workflow_id: self.def.id.clone(),
                        task_id: Some(task_id),
                        message: e.to_string(),
                    });
                }
            },
        }
    }

    async fn finish(mut self, termination: Termination) -> WorkflowReport {
        let mut rollbacks = Vec::new();
        match &termination {
            Termination::Completed => {
                tracing::info!(workflow_id = %self.def.id, "Workflow completed");
            }
            Termination::TaskFailed { tasks } => {
                tracing::error!(workflow_id = %self.def.id, failed = ?tasks, "Workflow failed");
                rollbacks = self.rollback().await;
            }
            Termination::Cancelled => {
                tracing::info!(
                    workflow_id = %self.def.id,
                    completed = ?self.completion_order,
                    "Workflow cancelled"
                );
            }
            Termination::Deadlocked { blocked } => {
                tracing::error!(workflow_id = %self.def.id, blocked = ?blocked, "Workflow deadlocked");
                self.engine.emit(WorkflowEvent::Error {
                    workflow_id: self.def.id.clone(),
                    task_id: None,
                    message: format!("No task can make progress: {}", blocked.join(", ")),
                });
            }
        }

        let status = if termination == Termination::Completed {
            WorkflowStatus::Completed
        } else {
            WorkflowStatus::Failed
        };
        self.set_workflow_status(status);

        WorkflowReport {
            workflow_id: self.def.id.clone(),
            status,
            termination,
            progress: self.def.progress,
            completed_steps: self.completion_order.clone(),
            failed_steps: self
                .def
                .tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Failed)
                .map(|t| t.id.clone())
                .collect(),
            tasks: self.def.tasks.iter().map(TaskDefinition::snapshot).collect(),
            rollbacks,
            attempts: self.attempts,
            elapsed: self.started.elapsed(),
        }
    }

    /// Invoke rollbacks of completed tasks, most recent first. Failures are
    /// logged and recorded; they never stop the remaining rollbacks.
    async fn rollback(&self) -> Vec<RollbackOutcome> {
        let mut outcomes = Vec::new();
        for task_id in self.completion_order.iter().rev() {
            let Some(task) = self.def.task(task_id) else {
                continue;
            };
            let Some(rollback) = task.rollback.clone() else {
                continue;
            };

            let timeout = task.timeout.unwrap_or(self.engine.config.default_task_timeout);
            let span = tracing::info_span!("rollback", workflow_id = %self.def.id, task_id = %task_id);
            let ctx = self.context(task, CancellationToken::new(), None, span.clone());
            tracing::info!(workflow_id = %self.def.id, task_id = %task_id, "Rolling back task");

            let result = tokio::time::timeout(timeout, rollback.run(ctx))
                .instrument(span)
                .await
                .unwrap_or_else(|_| Err(TaskError::Timeout(timeout)));
            let error = match result {
                Ok(_) => None,
                Err(e) => {
                    tracing::warn!(workflow_id = %self.def.id, task_id = %task_id, "Rollback failed: {}", e);
                    Some(e.to_string())
                }
            };
            outcomes.push(RollbackOutcome {
                task_id: task_id.clone(),
                error,
            });
        }
        outcomes
    }

    fn context(
        &self,
        task: &TaskDefinition,
        cancel: CancellationToken,
        tracking: Option<(Arc<ExecutionTracker>, Uuid)>,
        span: tracing::Span,
    ) -> TaskContext {
        TaskContext {
            workflow_id: self.def.id.clone(),
            task_id: task.id.clone(),
            attempt: task.retry_count,
            working_dir: self.def.working_dir.clone(),
            env: self.def.env.clone(),
            state: self.def.state.clone(),
            span,
            cancel,
            events: self.engine.events.clone(),
            tracking,
        }
    }

    fn set_task_status(&mut self, index: usize, target: TaskStatus) {
        let task = &mut self.def.tasks[index];
        debug_assert!(
            task.status.can_transition_to(target),
            "invalid task transition {} -> {}",
            task.status,
            target
        );
        tracing::debug!(task_id = %task.id, from = %task.status, to = %target, "Task status");
        task.status = target;
        self.task_changed(index);
    }

    /// Recompute progress and notify observers about task `index`.
    fn task_changed(&mut self, index: usize) {
        self.def.recompute_progress();
        let task = &self.def.tasks[index];
        self.engine.emit(WorkflowEvent::TaskStatus {
            workflow_id: self.def.id.clone(),
            task_id: task.id.clone(),
            status: task.status,
            retry_count: task.retry_count,
            error: task.last_error.clone(),
        });
        self.engine.publish(self.def);
    }

    fn set_workflow_status(&mut self, target: WorkflowStatus) {
        debug_assert!(
            self.def.status.can_transition_to(target),
            "invalid workflow transition {} -> {}",
            self.def.status,
            target
        );
        self.def.status = target;
        self.engine.emit(WorkflowEvent::WorkflowStatus {
            workflow_id: self.def.id.clone(),
            status: target,
            progress: self.def.progress,
        });
        self.engine.publish(self.def);
    }

    fn emit_metrics(&self) {
        let count = |status: TaskStatus| self.def.tasks.iter().filter(|t| t.status == status).count();
        self.engine.emit(WorkflowEvent::Metrics {
            workflow_id: self.def.id.clone(),
            completed: count(TaskStatus::Completed),
            failed: count(TaskStatus::Failed),
            total: self.def.tasks.len(),
            attempts: self.attempts,
            elapsed_ms: self.started.elapsed().as_millis() as u64,
        });
    }
}

fn failure_kind(err: &TaskError) -> FailureKind {
    match err {
        TaskError::Timeout(_) => FailureKind::Timeout,
        TaskError::Cancelled => FailureKind::Cancelled,
        TaskError::InvalidInput(_) => FailureKind::InvalidInput,
        TaskError::Tool(e) => FailureKind::from(e),
        TaskError::Failed(_) | TaskError::Turn(_) => FailureKind::ExecutionFailed,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde_json::json;
    use tokio::sync::Notify;

    use super::*;
    use crate::retry::FixedJitter;
    use crate::tracker::ExecutionStatus;
    use crate::workflow::breakpoint::BreakpointCondition;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    type Log = Arc<Mutex<Vec<String>>>;

    fn engine() -> WorkflowEngine {
        let mut config = EngineConfig::default();
        config.retry.initial_delay = Duration::from_millis(1);
        config.retry.max_delay = Duration::from_millis(4);
        WorkflowEngine::new(config)
            .with_retry_policy(RetryPolicy::with_jitter(Arc::new(FixedJitter(0.0))))
    }

    fn logged(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    fn ok_task(id: &str, log: &Log) -> TaskDefinition {
        let log = Arc::clone(log);
        TaskDefinition::new(id, move |ctx: TaskContext| {
            let log = Arc::clone(&log);
            async move {
                log.lock().unwrap().push(ctx.task_id.clone());
                Ok(json!(ctx.task_id))
            }
        })
    }

    fn failing_task(id: &str, calls: &Arc<AtomicU32>) -> TaskDefinition {
        let calls = Arc::clone(calls);
        TaskDefinition::new(id, move |_ctx| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TaskError::failed("boom"))
            }
        })
    }

    /// Task that signals `started`, then waits for `release` (or cancellation).
    fn gated_task(id: &str, started: &Arc<Notify>, release: &Arc<Notify>) -> TaskDefinition {
        let started = Arc::clone(started);
        let release = Arc::clone(release);
        TaskDefinition::new(id, move |ctx: TaskContext| {
            let started = Arc::clone(&started);
            let release = Arc::clone(&release);
            async move {
                started.notify_one();
                tokio::select! {
                    () = release.notified() => Ok(json!("released")),
                    () = ctx.cancel.cancelled() => Err(TaskError::Cancelled),
                }
            }
        })
    }

    #[tokio::test]
    async fn test_dependencies_run_in_order() {
        let log: Log = Arc::default();
        let engine = engine();
        let mut events = engine.subscribe();
        let mut wf = WorkflowDefinition::new("wf")
            .with_task(ok_task("b", &log).depends_on("a"))
            .with_task(ok_task("a", &log))
            .with_task(ok_task("c", &log));

        let report = engine.run(&mut wf).await.unwrap();
        assert!(report.is_success());
        assert_eq!(logged(&log), ["a", "b", "c"]);
        assert_eq!(report.completed_steps, ["a", "b", "c"]);
        assert_eq!(report.progress, 100.0);
        assert_eq!(wf.status, WorkflowStatus::Completed);
        assert_eq!(wf.task("a").unwrap().output, Some(json!("a")));

        // b waited on a and only ran once a had completed.
        let mut b_statuses = Vec::new();
        let mut a_done = false;
        while let Ok(event) = events.try_recv() {
            if let WorkflowEvent::TaskStatus { task_id, status, .. } = event {
                if task_id == "a" && status == TaskStatus::Completed {
                    a_done = true;
                }
                if task_id == "b" {
                    if status == TaskStatus::InProgress {
                        assert!(a_done);
                    }
                    b_statuses.push(status);
                }
            }
        }
        assert_eq!(b_statuses[0], TaskStatus::WaitingDependencies);
        assert!(b_statuses.contains(&TaskStatus::Completed));
    }

    #[tokio::test]
    async fn test_always_failing_task_is_attempted_max_attempts_plus_one() {
        let calls = Arc::new(AtomicU32::new(0));
        let log: Log = Arc::default();
        let mut wf = WorkflowDefinition::new("wf")
            .with_task(failing_task("a", &calls))
            .with_task(ok_task("b", &log).depends_on("a"));

        let report = engine().run(&mut wf).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(report.attempts, 4);
        assert_eq!(report.termination, Termination::TaskFailed { tasks: vec!["a".into()] });
        assert_eq!(report.failed_steps, ["a"]);
        assert_eq!(report.status, WorkflowStatus::Failed);

        let a = wf.task("a").unwrap();
        assert_eq!(a.status, TaskStatus::Failed);
        assert_eq!(a.retry_count, 3);
        assert_eq!(a.last_error.as_deref(), Some("boom"));
        assert!(logged(&log).is_empty());
        assert_eq!(wf.task("b").unwrap().status, TaskStatus::WaitingDependencies);
    }

    #[tokio::test]
    async fn test_non_retryable_task_fails_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut wf =
            WorkflowDefinition::new("wf").with_task(failing_task("a", &calls).with_retryable(false));

        let report = engine().run(&mut wf).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!report.is_success());
    }

    #[tokio::test]
    async fn test_independent_tasks_still_run_after_a_failure() {
        let calls = Arc::new(AtomicU32::new(0));
        let log: Log = Arc::default();
        let mut wf = WorkflowDefinition::new("wf")
            .with_task(failing_task("a", &calls).with_max_retries(0))
            .with_task(ok_task("b", &log));

        let report = engine().run(&mut wf).await.unwrap();
        assert_eq!(logged(&log), ["b"]);
        assert_eq!(report.completed_steps, ["b"]);
        assert_eq!(report.failed_steps, ["a"]);
        assert_eq!(report.progress, 50.0);
    }

    #[tokio::test]
    async fn test_timeout_is_a_retryable_failure() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let slow = TaskDefinition::new("slow", move |_ctx| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(json!(null))
            }
        })
        .with_timeout(Duration::from_millis(10))
        .with_max_retries(1);
        let mut wf = WorkflowDefinition::new("wf").with_task(slow);

        let report = engine().run(&mut wf).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!report.is_success());
        assert!(wf.task("slow").unwrap().last_error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_rollback_runs_in_reverse_completion_order() {
        let log: Log = Arc::default();
        let calls = Arc::new(AtomicU32::new(0));
        let undo = |id: &'static str, log: &Log, fail: bool| {
            let log = Arc::clone(log);
            move |_ctx: TaskContext| {
                let log = Arc::clone(&log);
                async move {
                    log.lock().unwrap().push(format!("undo-{id}"));
                    if fail {
                        Err(TaskError::failed("cannot undo"))
                    } else {
                        Ok(json!(null))
                    }
                }
            }
        };
        let mut wf = WorkflowDefinition::new("wf")
            .with_task(ok_task("a", &log).with_rollback(undo("a", &log, false)))
            .with_task(ok_task("b", &log).depends_on("a").with_rollback(undo("b", &log, true)))
            .with_task(ok_task("c", &log).depends_on("b"))
            .with_task(failing_task("d", &calls).depends_on("c").with_retryable(false));

        let report = engine().run(&mut wf).await.unwrap();
        assert_eq!(logged(&log), ["a", "b", "c", "undo-b", "undo-a"]);
        assert_eq!(
            report.rollbacks,
            [
                RollbackOutcome {
                    task_id: "b".into(),
                    error: Some("cannot undo".into()),
                },
                RollbackOutcome {
                    task_id: "a".into(),
                    error: None,
                },
            ]
        );
        // The original failure is still what the run reports.
        assert_eq!(report.termination, Termination::TaskFailed { tasks: vec!["d".into()] });
    }

    #[tokio::test]
    async fn test_cancel_stops_further_tasks_and_signals_cancellable_task() {
        let engine = Arc::new(engine());
        let controller = engine.controller();
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let log: Log = Arc::default();
        let wf = WorkflowDefinition::new("wf")
            .with_task(gated_task("a", &started, &release))
            .with_task(ok_task("b", &log));

        let runner = Arc::clone(&engine);
        let handle = tokio::spawn(async move {
            let mut wf = wf;
            let report = runner.run(&mut wf).await;
            (wf, report)
        });

        tokio::time::timeout(TEST_TIMEOUT, started.notified()).await.unwrap();
        controller.cancel();
        let (wf, report) = tokio::time::timeout(TEST_TIMEOUT, handle).await.unwrap().unwrap();
        let report = report.unwrap();

        assert_eq!(report.termination, Termination::Cancelled);
        assert_eq!(report.status, WorkflowStatus::Failed);
        assert!(report.completed_steps.is_empty());
        assert!(report.failed_steps.is_empty());
        assert_eq!(wf.task("a").unwrap().status, TaskStatus::Cancelled);
        assert_eq!(wf.task("b").unwrap().status, TaskStatus::Pending);
        assert!(logged(&log).is_empty());
    }

    #[tokio::test]
    async fn test_cancel_lets_non_cancellable_task_finish() {
        let engine = Arc::new(engine());
        let controller = engine.controller();
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let log: Log = Arc::default();
        let wf = WorkflowDefinition::new("wf")
            .with_task(gated_task("a", &started, &release).with_cancellable(false))
            .with_task(ok_task("b", &log));

        let runner = Arc::clone(&engine);
        let handle = tokio::spawn(async move {
            let mut wf = wf;
            runner.run(&mut wf).await
        });

        tokio::time::timeout(TEST_TIMEOUT, started.notified()).await.unwrap();
        controller.cancel();
        release.notify_one();
        let report = tokio::time::timeout(TEST_TIMEOUT, handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(report.termination, Termination::Cancelled);
        assert_eq!(report.completed_steps, ["a"]);
        assert!(logged(&log).is_empty());
    }

    #[tokio::test]
    async fn test_pause_holds_next_task_until_resume() {
        let engine = Arc::new(engine());
        let controller = engine.controller();
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let log: Log = Arc::default();
        let wf = WorkflowDefinition::new("wf")
            .with_task(gated_task("a", &started, &release))
            .with_task(ok_task("b", &log));

        let runner = Arc::clone(&engine);
        let handle = tokio::spawn(async move {
            let mut wf = wf;
            runner.run(&mut wf).await
        });

        tokio::time::timeout(TEST_TIMEOUT, started.notified()).await.unwrap();
        controller.pause();
        release.notify_one();

        let mut snapshots = controller.watch();
        tokio::time::timeout(
            TEST_TIMEOUT,
            snapshots.wait_for(|s| {
                s.as_ref().is_some_and(|s| {
                    s.status == WorkflowStatus::Paused && s.tasks[0].status == TaskStatus::Completed
                })
            }),
        )
        .await
        .unwrap()
        .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(logged(&log).is_empty());

        controller.resume();
        let report = tokio::time::timeout(TEST_TIMEOUT, handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(report.is_success());
        assert_eq!(logged(&log), ["b"]);
    }

    #[tokio::test]
    async fn test_breakpoint_pauses_before_task() {
        let engine = Arc::new(engine());
        let breakpoint = engine.add_breakpoint(DebugBreakpoint::new("b"));
        let mut events = engine.subscribe();
        let controller = engine.controller();
        let log: Log = Arc::default();
        let wf = WorkflowDefinition::new("wf")
            .with_task(ok_task("a", &log))
            .with_task(ok_task("b", &log).depends_on("a"));

        let runner = Arc::clone(&engine);
        let handle = tokio::spawn(async move {
            let mut wf = wf;
            runner.run(&mut wf).await
        });

        let hit = tokio::time::timeout(TEST_TIMEOUT, async {
            loop {
                if let Ok(WorkflowEvent::BreakpointHit { task_id, hit_count, .. }) = events.recv().await {
                    return (task_id, hit_count);
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(hit, ("b".to_string(), 1));
        assert_eq!(logged(&log), ["a"]);
        let snapshot = controller.snapshot().unwrap();
        assert_eq!(snapshot.status, WorkflowStatus::Paused);
        assert_eq!(snapshot.tasks[1].status, TaskStatus::Paused);

        controller.resume();
        let report = tokio::time::timeout(TEST_TIMEOUT, handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(report.is_success());
        assert_eq!(logged(&log), ["a", "b"]);
        assert_eq!(engine.breakpoints()[0].hit_count, 1);
        assert!(engine.remove_breakpoint(breakpoint));
        assert!(engine.breakpoints().is_empty());
    }

    #[tokio::test]
    async fn test_disabled_or_unmatched_breakpoint_does_not_pause() {
        let engine = engine();
        let id = engine.add_breakpoint(DebugBreakpoint::new("a"));
        engine.add_breakpoint(DebugBreakpoint::new("a").with_condition(
            BreakpointCondition::StateEquals {
                key: "debug".into(),
                value: json!(true),
            },
        ));
        assert!(engine.set_breakpoint_enabled(id, false));
        assert!(!engine.set_breakpoint_enabled(Uuid::new_v4(), false));

        let log: Log = Arc::default();
        let mut wf = WorkflowDefinition::new("wf").with_task(ok_task("a", &log));
        let report = tokio::time::timeout(TEST_TIMEOUT, engine.run(&mut wf))
            .await
            .unwrap()
            .unwrap();
        assert!(report.is_success());
        assert!(engine.breakpoints().iter().all(|b| b.hit_count == 0));
    }

    #[tokio::test]
    async fn test_retry_task_then_rerun_skips_completed_tasks() {
        let log: Log = Arc::default();
        let flaky_log = Arc::clone(&log);
        let flaky = TaskDefinition::new("flaky", move |ctx: TaskContext| {
            let log = Arc::clone(&flaky_log);
            async move {
                log.lock().unwrap().push("flaky".into());
                if ctx.state.get("fixed") == Some(json!(true)) {
                    Ok(json!("ok"))
                } else {
                    Err(TaskError::failed("not yet"))
                }
            }
        })
        .with_retryable(false)
        .depends_on("setup");
        let mut wf = WorkflowDefinition::new("wf")
            .with_task(ok_task("setup", &log))
            .with_task(flaky);
        let engine = engine();

        let first = engine.run(&mut wf).await.unwrap();
        assert!(!first.is_success());

        assert!(matches!(wf.retry_task("setup"), Err(WorkflowError::InvalidRetry { .. })));
        wf.retry_task("flaky").unwrap();
        wf.state.set("fixed", json!(true));

        let second = engine.run(&mut wf).await.unwrap();
        assert!(second.is_success());
        assert_eq!(second.completed_steps, ["setup", "flaky"]);
        assert_eq!(logged(&log), ["setup", "flaky", "flaky"]);
    }

    #[tokio::test]
    async fn test_retry_during_run_readmits_failed_task() {
        let engine = Arc::new(engine());
        let controller = engine.controller();
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let first_fails = TaskDefinition::new("a", move |_ctx| {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(TaskError::failed("boom"))
                } else {
                    Ok(json!("fixed"))
                }
            }
        })
        .with_retryable(false);
        let wf = WorkflowDefinition::new("wf")
            .with_task(first_fails)
            .with_task(gated_task("b", &started, &release));

        let runner = Arc::clone(&engine);
        let handle = tokio::spawn(async move {
            let mut wf = wf;
            let report = runner.run(&mut wf).await;
            (wf, report)
        });

        // "a" has already failed once "b" is running.
        tokio::time::timeout(TEST_TIMEOUT, started.notified()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        controller.retry("a");
        release.notify_one();

        let (wf, report) = tokio::time::timeout(TEST_TIMEOUT, handle).await.unwrap().unwrap();
        let report = report.unwrap();
        assert_eq!(report.termination, Termination::Completed);
        assert_eq!(report.completed_steps, ["b", "a"]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let a = wf.task("a").unwrap();
        assert_eq!(a.status, TaskStatus::Completed);
        assert_eq!(a.output, Some(json!("fixed")));
        assert_eq!(a.last_error, None);
    }

    #[tokio::test]
    async fn test_blocked_workflow_is_reported_as_deadlocked() {
        let log: Log = Arc::default();
        let mut upstream = ok_task("a", &log);
        upstream.status = TaskStatus::Cancelled;
        let mut wf = WorkflowDefinition::new("wf")
            .with_task(upstream)
            .with_task(ok_task("b", &log).depends_on("a"));

        let report = engine().run(&mut wf).await.unwrap();
        assert_eq!(
            report.termination,
            Termination::Deadlocked {
                blocked: vec!["a".into(), "b".into()]
            }
        );
        assert_eq!(report.status, WorkflowStatus::Failed);
        assert!(logged(&log).is_empty());
    }

    #[tokio::test]
    async fn test_invalid_graph_is_rejected_before_running() {
        let log: Log = Arc::default();
        let mut wf = WorkflowDefinition::new("wf")
            .with_task(ok_task("a", &log).depends_on("b"))
            .with_task(ok_task("b", &log).depends_on("a"));

        assert!(matches!(
            engine().run(&mut wf).await,
            Err(WorkflowError::CycleDetected(_))
        ));
        assert_eq!(wf.status, WorkflowStatus::Idle);
        assert!(logged(&log).is_empty());
    }

    #[tokio::test]
    async fn test_second_concurrent_run_is_rejected() {
        let engine = Arc::new(engine());
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let wf = WorkflowDefinition::new("wf").with_task(gated_task("a", &started, &release));

        let runner = Arc::clone(&engine);
        let handle = tokio::spawn(async move {
            let mut wf = wf;
            runner.run(&mut wf).await
        });
        tokio::time::timeout(TEST_TIMEOUT, started.notified()).await.unwrap();

        let mut other = WorkflowDefinition::new("other");
        assert!(matches!(
            engine.run(&mut other).await,
            Err(WorkflowError::AlreadyRunning)
        ));

        release.notify_one();
        let report = tokio::time::timeout(TEST_TIMEOUT, handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(report.is_success());
    }

    #[tokio::test]
    async fn test_progress_metrics_and_tracker_entries() {
        let tracker = Arc::new(ExecutionTracker::new());
        let engine = engine().with_tracker(Arc::clone(&tracker));
        let mut events = engine.subscribe();
        let calls = Arc::new(AtomicU32::new(0));
        let reporter = TaskDefinition::new("report", |ctx: TaskContext| async move {
            ctx.report_progress(50, "halfway");
            ctx.emit_output("working");
            Ok(json!(null))
        });
        let mut wf = WorkflowDefinition::new("wf")
            .with_task(reporter)
            .with_task(failing_task("bad", &calls).with_max_retries(1));

        engine.run(&mut wf).await.unwrap();

        let mut progress = Vec::new();
        let mut metrics = Vec::new();
        let mut percentages = Vec::new();
        while let Ok(event) = events.try_recv() {
            match event {
                WorkflowEvent::TaskProgress { percent, message, .. } => percentages.push((percent, message)),
                WorkflowEvent::WorkflowStatus { progress: p, .. } => progress.push(p),
                WorkflowEvent::Metrics { completed, failed, attempts, .. } => {
                    metrics.push((completed, failed, attempts))
                }
                _ => {}
            }
        }
        assert_eq!(percentages, [(50, "halfway".to_string())]);
        assert_eq!(metrics, [(1, 0, 1), (1, 1, 3)]);
        assert_eq!(progress.last(), Some(&50.0));

        let entries = tracker.snapshot();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].kind, ExecutionKind::Task);
        assert_eq!(entries[0].status, ExecutionStatus::Completed);
        assert_eq!(entries[0].output, "working");
        assert!(entries[1..].iter().all(|e| e.status == ExecutionStatus::Failed));
    }
}
