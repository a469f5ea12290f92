//! Dependency graph checks run before a workflow starts.

use std::collections::{HashMap, HashSet};

use crate::error::WorkflowError;
use crate::workflow::types::{TaskDefinition, TaskStatus};

/// Reject duplicate ids, unknown dependencies and dependency cycles.
pub fn validate(tasks: &[TaskDefinition]) -> Result<(), WorkflowError> {
    let mut seen = HashSet::new();
    for task in tasks {
        if !seen.insert(task.id.as_str()) {
            return Err(WorkflowError::DuplicateTask(task.id.clone()));
        }
    }

    for task in tasks {
        if let Some(dependency) = task.dependencies.iter().find(|d| !seen.contains(d.as_str())) {
            return Err(WorkflowError::UnknownDependency {
                task: task.id.clone(),
                dependency: dependency.clone(),
            });
        }
    }

    // Kahn's algorithm: whatever never reaches in-degree zero sits on a cycle
    // or downstream of one.
    let mut in_degree: HashMap<&str, usize> = tasks
        .iter()
        .map(|t| (t.id.as_str(), t.dependencies.len()))
        .collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for task in tasks {
        for dep in &task.dependencies {
            dependents.entry(dep.as_str()).or_default().push(task.id.as_str());
        }
    }

    let mut ready: Vec<&str> = tasks
        .iter()
        .filter(|t| t.dependencies.is_empty())
        .map(|t| t.id.as_str())
        .collect();
    let mut visited = 0;
    while let Some(id) = ready.pop() {
        visited += 1;
        for dependent in dependents.get(id).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(dependent) {
                *degree -= 1;
                if *degree == 0 {
                    ready.push(*dependent);
                }
            }
        }
    }

    if visited < tasks.len() {
        let stuck = tasks
            .iter()
            .filter(|t| in_degree.get(t.id.as_str()).is_some_and(|d| *d > 0))
            .map(|t| t.id.clone())
            .collect();
        return Err(WorkflowError::CycleDetected(stuck));
    }

    Ok(())
}

/// Whether every dependency of `task` has completed.
pub fn dependencies_met(task: &TaskDefinition, tasks: &[TaskDefinition]) -> bool {
    task.dependencies.iter().all(|dep| {
        tasks
            .iter()
            .any(|t| &t.id == dep && t.status == TaskStatus::Completed)
    })
}
