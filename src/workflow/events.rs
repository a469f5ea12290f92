//! Events a workflow run emits to observers.

use serde::Serialize;
use uuid::Uuid;

use crate::workflow::types::{TaskStatus, WorkflowStatus};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    TaskProgress {
        workflow_id: String,
        task_id: String,
        percent: u8,
        message: String,
    },
    TaskStatus {
        workflow_id: String,
        task_id: String,
        status: TaskStatus,
        retry_count: u32,
        error: Option<String>,
    },
    WorkflowStatus {
        workflow_id: String,
        status: WorkflowStatus,
        progress: f64,
    },
    /// Emitted after each task settles.
    Metrics {
        workflow_id: String,
        completed: usize,
        failed: usize,
        total: usize,
        attempts: u32,
        elapsed_ms: u64,
    },
    Error {
        workflow_id: String,
        task_id: Option<String>,
        message: String,
    },
    BreakpointHit {
        workflow_id: String,
        breakpoint_id: Uuid,
        task_id: String,
        hit_count: u32,
    },
}
