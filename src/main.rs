use std::io::Write;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

use assist_engine::config::EngineConfig;
use assist_engine::llm::{ContentGenerator, Script, ScriptedGenerator, StreamEvent, ToolCallRequest};
use assist_engine::tools::{ToolDispatcher, ToolRegistry};
use assist_engine::tracker::ExecutionTracker;
use assist_engine::turn::{TurnEvent, TurnManager, TurnStatus};

/// Finished tracker entries kept for the session.
const TRACKER_RETENTION: usize = 500;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing();

    let config = EngineConfig::from_env()?;
    let working_dir = std::env::current_dir()?;

    // Offline generator: replies with an echo of the last user message.
    let generator = Arc::new(ScriptedGenerator::new());
    let registry = Arc::new(ToolRegistry::with_builtins(Some(working_dir.clone())));
    let tracker = Arc::new(ExecutionTracker::new().with_retention(TRACKER_RETENTION));

    eprintln!("assist v{}", env!("CARGO_PKG_VERSION"));
    eprintln!(
        "   Model: {}",
        config.turn.model.as_deref().unwrap_or(generator.model_name())
    );
    eprintln!("   Tools: {}", registry.list().await.join(", "));
    eprintln!("   Type a message and press Enter. /read <path>, /tokens, /reset, /quit.");
    eprintln!("   Ctrl-C cancels the running turn.\n");

    let mut turn = TurnManager::new(generator.clone(), &config)
        .with_tracker(Arc::clone(&tracker))
        .with_tools(registry.tool_definitions().await);
    let mut events = turn.subscribe();
    let canceller = turn.canceller();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            canceller.cancel();
        }
    });
    let dispatcher = ToolDispatcher::new(registry, working_dir);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };

        let input = line.trim();
        match input {
            "" => continue,
            "/quit" => break,
            "/reset" => {
                turn.reset();
                tracker.clear();
                eprintln!("(conversation cleared)");
                continue;
            }
            "/tokens" => {
                match turn.count_tokens().await {
                    Ok(count) => eprintln!("{} / {} tokens", count.token_count, count.context_limit),
                    Err(e) => eprintln!("Error: {e}"),
                }
                continue;
            }
            _ => {}
        }

        if let Some(path) = input.strip_prefix("/read ") {
            let mut params = serde_json::Map::new();
            params.insert("path".to_string(), serde_json::json!(path.trim()));
            let call = ToolCallRequest::new(uuid::Uuid::new_v4().to_string(), "read_file", params);
            generator.push(Script::events(vec![StreamEvent::ToolCall(call), StreamEvent::End]));
        }

        let outcome = match turn.execute(input).await {
            Ok(outcome) if outcome.status == TurnStatus::WaitingForTool => {
                dispatcher.resolve(&mut turn).await
            }
            other => other,
        };
        render(&mut events);
        if let Err(e) = outcome {
            tracing::debug!("Turn ended with error: {}", e);
        }
    }

    Ok(())
}

/// Print the events a turn emitted since the last call.
fn render(events: &mut broadcast::Receiver<TurnEvent>) {
    loop {
        match events.try_recv() {
            Ok(TurnEvent::Content { text }) => print!("{text}"),
            Ok(TurnEvent::ToolCall { request }) => eprintln!("  [tool] {} {}", request.name, request.id),
            Ok(TurnEvent::ToolResult { result }) => {
                let status = if result.outcome.is_success() { "ok" } else { "failed" };
                eprintln!("  [tool] {} {}", result.tool_call_id, status);
            }
            Ok(TurnEvent::Complete { .. }) => println!(),
            Ok(TurnEvent::Error {
                message,
                partial_content,
            }) => {
                println!();
                if !partial_content.is_empty() {
                    eprintln!("(partial) {partial_content}");
                }
                eprintln!("Error: {message}");
            }
            Ok(TurnEvent::Cancelled { partial_content }) => {
                println!();
                if !partial_content.is_empty() {
                    eprintln!("(partial) {partial_content}");
                }
                eprintln!("Cancelled");
            }
            Ok(TurnEvent::Start { .. }) => {}
            Err(broadcast::error::TryRecvError::Lagged(n)) => {
                tracing::warn!("Skipped {} turn events", n);
            }
            Err(_) => break,
        }
    }
}

/// Log to stderr, or to a daily rolling file under `ASSIST_LOG_DIR` when set.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match std::env::var("ASSIST_LOG_DIR") {
        Ok(dir) if !dir.trim().is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, "assist.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Some(guard)
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
            None
        }
    }
}
