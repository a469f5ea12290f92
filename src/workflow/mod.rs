//! Workflow engine: dependency-ordered, retryable multi-step execution.
//!
//! - `types`: task/workflow definitions, statuses, `TaskContext`
//! - `graph`: validation of the dependency DAG
//! - `breakpoint`: debug breakpoints and their conditions
//! - `events`: events emitted while a workflow runs
//! - `engine`: `WorkflowEngine`, `WorkflowController`, `WorkflowReport`

pub mod breakpoint;
pub mod engine;
pub mod events;
pub mod graph;
pub mod types;

pub use breakpoint::{BreakpointCondition, DebugBreakpoint};
pub use engine::{RollbackOutcome, Termination, WorkflowController, WorkflowEngine, WorkflowReport};
pub use events::WorkflowEvent;
pub use types::{
    StateBag, TaskAction, TaskContext, TaskDefinition, TaskSnapshot, TaskStatus,
    WorkflowDefinition, WorkflowSnapshot, WorkflowStatus,
};
