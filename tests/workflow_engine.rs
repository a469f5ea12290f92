//! Workflow runs whose tasks drive model turns and touch the filesystem.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;
use tokio::time::timeout;

use assist_engine::config::EngineConfig;
use assist_engine::error::{LlmError, TaskError};
use assist_engine::llm::{ContentGenerator, Script, ScriptedGenerator};
use assist_engine::retry::{FixedJitter, RetryPolicy};
use assist_engine::tracker::{ExecutionKind, ExecutionStatus, ExecutionTracker};
use assist_engine::turn::TurnManager;
use assist_engine::workflow::{
    RollbackOutcome, TaskContext, TaskDefinition, TaskStatus, Termination, WorkflowDefinition,
    WorkflowEngine, WorkflowStatus,
};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.retry.initial_delay = Duration::from_millis(1);
    config.retry.max_delay = Duration::from_millis(5);
    config
}

fn engine() -> WorkflowEngine {
    WorkflowEngine::new(fast_config())
        .with_retry_policy(RetryPolicy::with_jitter(Arc::new(FixedJitter(0.0))))
}

/// Task that runs one turn with `prompt` (plus the value under `input_key`)
/// and stores the reply under `output_key`.
fn model_task(
    id: &str,
    generator: &Arc<ScriptedGenerator>,
    prompt: &'static str,
    input_key: Option<&'static str>,
    output_key: &'static str,
) -> TaskDefinition {
    let generator = Arc::clone(generator);
    TaskDefinition::new(id, move |ctx: TaskContext| {
        let generator: Arc<dyn ContentGenerator> = generator.clone();
        async move {
            let mut input = prompt.to_string();
            if let Some(key) = input_key {
                let previous = ctx
                    .state
                    .get(key)
                    .and_then(|v| v.as_str().map(str::to_string))
                    .ok_or_else(|| TaskError::InvalidInput(format!("missing {key}")))?;
                input = format!("{input}: {previous}");
            }
            let mut turn = TurnManager::new(generator, &fast_config());
            let outcome = turn.execute(input).await?;
            ctx.state.set(output_key, json!(outcome.content));
            Ok::<_, TaskError>(json!(outcome.content))
        }
    })
}

#[tokio::test]
async fn tasks_hand_model_output_to_dependents_through_state() {
    let generator = Arc::new(ScriptedGenerator::with_scripts(vec![
        Script::chunks(["Leaves ", "fall"]),
        Script::chunks(["Looks good"]),
    ]));
    let tracker = Arc::new(ExecutionTracker::new());
    let engine = engine().with_tracker(Arc::clone(&tracker));
    let mut wf = WorkflowDefinition::new("haiku")
        .with_task(
            model_task("review", &generator, "Review this", Some("draft"), "review")
                .depends_on("draft"),
        )
        .with_task(model_task("draft", &generator, "Write a haiku", None, "draft"));

    let report = timeout(TEST_TIMEOUT, engine.run(&mut wf))
        .await
        .unwrap()
        .unwrap();

    assert!(report.is_success());
    assert_eq!(report.completed_steps, ["draft", "review"]);
    assert_eq!(wf.state.get("draft"), Some(json!("Leaves fall")));
    assert_eq!(wf.task("review").unwrap().output, Some(json!("Looks good")));

    let requests = generator.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].messages[0].content, "Review this: Leaves fall");

    let entries = tracker.snapshot();
    let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, ["draft", "review"]);
    assert!(entries.iter().all(|e| e.kind == ExecutionKind::Task));
    assert!(entries.iter().all(|e| e.status == ExecutionStatus::Completed));
}

#[tokio::test]
async fn failed_turn_fails_the_task_and_rolls_back_earlier_work() {
    let dir = TempDir::new().unwrap();
    let generator = Arc::new(ScriptedGenerator::with_scripts(vec![Script::OpenError(
        LlmError::AuthFailed {
            provider: "scripted".to_string(),
        },
    )]));

    let prepare = TaskDefinition::new("prepare", |ctx: TaskContext| async move {
        tokio::fs::write(ctx.working_dir.join("draft.txt"), "scratch")
            .await
            .map_err(|e| TaskError::failed(e.to_string()))?;
        Ok::<_, TaskError>(json!("draft.txt"))
    })
    .with_rollback(|ctx: TaskContext| async move {
        tokio::fs::remove_file(ctx.working_dir.join("draft.txt"))
            .await
            .map_err(|e| TaskError::failed(e.to_string()))?;
        Ok::<_, TaskError>(json!(null))
    });

    let mut wf = WorkflowDefinition::new("publish")
        .with_working_dir(dir.path().to_path_buf())
        .with_task(prepare)
        .with_task(
            model_task("summarize", &generator, "Summarize", None, "summary")
                .depends_on("prepare")
                .with_max_retries(0),
        );

    let report = timeout(TEST_TIMEOUT, engine().run(&mut wf))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.status, WorkflowStatus::Failed);
    assert_eq!(
        report.termination,
        Termination::TaskFailed {
            tasks: vec!["summarize".into()]
        }
    );
    assert_eq!(
        report.rollbacks,
        [RollbackOutcome {
            task_id: "prepare".into(),
            error: None,
        }]
    );
    assert!(!dir.path().join("draft.txt").exists());

    let summarize = wf.task("summarize").unwrap();
    assert_eq!(summarize.status, TaskStatus::Failed);
    assert_eq!(summarize.retry_count, 0);
    assert!(
        summarize
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("Authentication failed"))
    );
    assert_eq!(generator.call_count(), 1);
}

#[tokio::test]
async fn cancel_observed_through_snapshots_stops_the_run() {
    let engine = Arc::new(engine());
    let controller = engine.controller();
    let mut snapshots = controller.watch();

    let wait = TaskDefinition::new("wait", |ctx: TaskContext| async move {
        ctx.cancel.cancelled().await;
        Err(TaskError::Cancelled)
    });
    let after = TaskDefinition::new("after", |_ctx: TaskContext| async { Ok(json!(null)) })
        .depends_on("wait");
    let wf = WorkflowDefinition::new("long")
        .with_task(wait)
        .with_task(after);

    let runner = Arc::clone(&engine);
    let handle = tokio::spawn(async move {
        let mut wf = wf;
        let report = runner.run(&mut wf).await;
        (wf, report)
    });

    timeout(
        TEST_TIMEOUT,
        snapshots.wait_for(|snapshot| {
            snapshot.as_ref().is_some_and(|s| {
                s.tasks
                    .iter()
                    .any(|t| t.id == "wait" && t.status == TaskStatus::InProgress)
            })
        }),
    )
    .await
    .unwrap()
    .unwrap();
    controller.cancel();

    let (wf, report) = timeout(TEST_TIMEOUT, handle).await.unwrap().unwrap();
    let report = report.unwrap();
    assert_eq!(report.termination, Termination::Cancelled);
    assert!(report.rollbacks.is_empty());
    assert_eq!(wf.task("wait").unwrap().status, TaskStatus::Cancelled);
    assert_eq!(
        wf.task("after").unwrap().status,
        TaskStatus::WaitingDependencies
    );

    let last = controller.snapshot().unwrap();
    assert_eq!(last.status, WorkflowStatus::Failed);
}
