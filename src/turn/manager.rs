//! Turn manager: one streaming exchange with the model, including tool-call
//! round-trips.
//!
//! ```text
//! IDLE ──execute──▶ IN_PROGRESS ──stream end, no calls──▶ COMPLETED
//!                      │   ▲
//!      stream end with │   │ last pending result submitted
//!          tool calls  ▼   │
//!                 WAITING_FOR_TOOL
//! IN_PROGRESS ──error after retries──▶ FAILED
//! IN_PROGRESS | WAITING_FOR_TOOL ──cancel──▶ CANCELLED
//! ```
//!
//! The manager exclusively owns its transcript. Content deltas are applied in
//! arrival order; the assistant message is finalized only once every tool
//! call raised during the turn has a result.
//!
//! The transcript stores a turn as `user, tool results…, assistant`. Requests
//! to the model re-order each turn so the assistant message that raised the
//! calls precedes their results.

use std::sync::{Arc, Mutex};

use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{EngineConfig, TurnConfig};
use crate::error::{LlmError, TurnError};
use crate::llm::{
    ChatMessage, ContentGenerator, GenerateRequest, GenerationConfig, GenerationStream, Role,
    StreamEvent, TokenCount, ToolCallRequest, ToolDefinition,
};
use crate::retry::{RetryConfig, RetryPolicy};
use crate::tools::tool::{FailureKind, ToolOutcome, ToolResult};
use crate::tracker::ExecutionTracker;
use crate::turn::events::TurnEvent;
use crate::turn::state::TurnStatus;

/// Cloneable handle that cancels the exchange its turn is running.
///
/// A cancel lets an in-flight stream open finish but stops the turn before
/// the next chunk is applied or another stream is opened. Cancels requested
/// while no exchange is underway are discarded by the next `execute`.
#[derive(Debug, Clone, Default)]
pub struct TurnCanceller {
    token: Arc<Mutex<CancellationToken>>,
}

impl TurnCanceller {
    pub fn cancel(&self) {
        self.lock().cancel();
    }

    /// Token for a new exchange, replacing a spent one.
    fn rearm(&self) -> CancellationToken {
        let mut token = self.lock();
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
        token.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CancellationToken> {
        self.token.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Result of driving a turn until it settles or needs tool results.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    pub status: TurnStatus,
    /// Assistant content merged so far (final content when completed).
    pub content: String,
    /// Every tool call raised during this turn.
    pub tool_calls: Vec<ToolCallRequest>,
    /// Calls still waiting for a result.
    pub pending_tool_calls: Vec<ToolCallRequest>,
}

#[derive(Debug, Clone)]
struct PendingCall {
    request: ToolCallRequest,
    tracking_id: Option<Uuid>,
}

/// Drives a single turn against a [`ContentGenerator`].
pub struct TurnManager {
    generator: Arc<dyn ContentGenerator>,
    config: TurnConfig,
    retry: RetryConfig,
    policy: RetryPolicy,
    tools: Vec<ToolDefinition>,
    tracker: Option<Arc<ExecutionTracker>>,
    events: broadcast::Sender<TurnEvent>,

    canceller: TurnCanceller,
    /// Token of the current exchange.
    cancel: CancellationToken,

    status: TurnStatus,
    messages: Vec<ChatMessage>,
    /// In-progress assistant content.
    buffer: String,
    raised: Vec<ToolCallRequest>,
    pending: Vec<PendingCall>,
}

impl TurnManager {
    pub fn new(generator: Arc<dyn ContentGenerator>, config: &EngineConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            generator,
            config: config.turn.clone(),
            retry: config.retry.clone(),
            policy: RetryPolicy::new(),
            tools: Vec::new(),
            tracker: None,
            events,
            canceller: TurnCanceller::default(),
            cancel: CancellationToken::new(),
            status: TurnStatus::Idle,
            messages: Vec::new(),
            buffer: String::new(),
            raised: Vec::new(),
            pending: Vec::new(),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_tracker(mut self, tracker: Arc<ExecutionTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Tools advertised to the model on every request.
    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    // ── Accessors ───────────────────────────────────────────────────

    pub fn status(&self) -> TurnStatus {
        self.status
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn has_pending_tool_calls(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_tool_calls(&self) -> Vec<ToolCallRequest> {
        self.pending.iter().map(|p| p.request.clone()).collect()
    }

    /// Tracker entry registered for a pending call, if a tracker is attached.
    pub fn tracking_id(&self, tool_call_id: &str) -> Option<Uuid> {
        self.pending
            .iter()
            .find(|p| p.request.id == tool_call_id)
            .and_then(|p| p.tracking_id)
    }

    pub fn tracker(&self) -> Option<&Arc<ExecutionTracker>> {
        self.tracker.as_ref()
    }

    /// Subscribe to this turn's events.
    pub fn subscribe(&self) -> broadcast::Receiver<TurnEvent> {
        self.events.subscribe()
    }

    /// Same as [`TurnManager::subscribe`], as a `Stream`.
    pub fn event_stream(&self) -> BroadcastStream<TurnEvent> {
        BroadcastStream::new(self.events.subscribe())
    }

    /// Handle for cancelling from another task while an exchange is awaited.
    pub fn canceller(&self) -> TurnCanceller {
        self.canceller.clone()
    }

    /// Count tokens of the current transcript.
    pub async fn count_tokens(&self) -> Result<TokenCount, LlmError> {
        self.generator.count_tokens(&self.messages).await
    }

    // ── Operations ──────────────────────────────────────────────────

    /// Start a new exchange with `user_input`.
    ///
    /// Fails immediately with [`TurnError::InvalidState`] while an exchange
    /// is underway; no stream is opened in that case.
    pub async fn execute(&mut self, user_input: impl Into<String>) -> Result<TurnOutcome, TurnError> {
        if self.status.is_active() {
            return Err(TurnError::InvalidState {
                operation: "execute",
                status: self.status,
            });
        }

        let input = user_input.into();
        self.messages.push(ChatMessage::user(input.clone()));
        self.cancel = self.canceller.rearm();
        self.buffer.clear();
        self.raised.clear();
        self.set_status(TurnStatus::InProgress);
        self.emit(TurnEvent::Start { input });

        self.run_generation().await
    }

    /// Resolve one pending tool call. Generation resumes once none remain.
    pub async fn submit_tool_result(&mut self, result: ToolResult) -> Result<TurnOutcome, TurnError> {
        if self.status != TurnStatus::WaitingForTool {
            return Err(TurnError::InvalidState {
                operation: "submit a tool result",
                status: self.status,
            });
        }

        let Some(index) = self
            .pending
            .iter()
            .position(|p| p.request.id == result.tool_call_id)
        else {
            return Err(TurnError::UnknownToolCall {
                id: result.tool_call_id,
            });
        };

        let resolved = self.pending.remove(index);
        if let (Some(tracker), Some(entry)) = (&self.tracker, resolved.tracking_id)
            && let Err(e) = tracker.complete(entry, result.outcome.clone())
        {
            tracing::debug!(tool_call_id = %result.tool_call_id, "Tracker rejected completion: {}", e);
        }

        self.messages.push(ChatMessage::tool_result(
            result.tool_call_id.clone(),
            result.outcome.to_message_content(),
        ));
        tracing::debug!(
            tool_call_id = %result.tool_call_id,
            tool = %resolved.request.name,
            remaining = self.pending.len(),
            "Tool result submitted"
        );
        self.emit(TurnEvent::ToolResult { result });

        if self.cancel.is_cancelled() {
            return Ok(self.settle_cancelled());
        }
        if !self.pending.is_empty() {
            return Ok(self.outcome());
        }

        self.set_status(TurnStatus::InProgress);
        self.run_generation().await
    }

    /// Stop the current exchange.
    ///
    /// A turn waiting for tool results settles as `Cancelled` at once, its
    /// pending calls abandoned. Otherwise this only affects an exchange
    /// driven through a [`TurnCanceller`]; settled turns are left as they are.
    pub fn cancel(&mut self) {
        self.canceller.cancel();
        if self.status == TurnStatus::WaitingForTool {
            self.settle_cancelled();
        }
    }

    /// Clear the transcript and pending calls and return to `Idle`.
    pub fn reset(&mut self) {
        self.abandon_pending("Turn was reset");
        self.messages.clear();
        self.buffer.clear();
        self.raised.clear();
        self.status = TurnStatus::Idle;
    }

    // ── Internals ───────────────────────────────────────────────────

    async fn run_generation(&mut self) -> Result<TurnOutcome, TurnError> {
        let cancel = self.cancel.clone();
        if cancel.is_cancelled() {
            return Ok(self.settle_cancelled());
        }
        let request = self.build_request();

        let mut stream = match self.open_stream(request, &cancel).await {
            Ok(Some(stream)) => stream,
            Ok(None) => return Ok(self.settle_cancelled()),
            Err(e) => return Err(self.fail(e)),
        };

        loop {
            let item = tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(self.settle_cancelled()),
                item = stream.next() => item,
            };
            match item {
                Some(Ok(StreamEvent::Content(text))) => {
                    self.buffer.push_str(&text);
                    self.emit(TurnEvent::Content { text });
                }
                Some(Ok(StreamEvent::ToolCall(request))) => self.raise_tool_call(request),
                Some(Ok(StreamEvent::End)) | None => break,
                Some(Err(e)) => return Err(self.fail(e)),
            }
        }

        if !self.pending.is_empty() {
            self.set_status(TurnStatus::WaitingForTool);
            return Ok(self.outcome());
        }

        Ok(self.finalize())
    }

    /// Open a generation stream, retrying transport failures per the retry policy.
    ///
    /// `None` means the exchange was cancelled. An open already underway is
    /// allowed to finish; its stream is then dropped unread.
    async fn open_stream(
        &self,
        request: GenerateRequest,
        cancel: &CancellationToken,
    ) -> Result<Option<GenerationStream>, LlmError> {
        let mut attempt = 0;
        loop {
            let opened = self.generator.generate_stream(request.clone()).await;
            if cancel.is_cancelled() {
                return Ok(None);
            }
            match opened {
                Ok(stream) => return Ok(Some(stream)),
                Err(e) if self.policy.should_retry(&e, attempt, &self.retry) => {
                    let delay = self.policy.next_delay(attempt, &self.retry);
                    tracing::debug!(
                        model = %self.generator.model_name(),
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying generation stream after error: {}",
                        e
                    );
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = cancel.cancelled() => return Ok(None),
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn raise_tool_call(&mut self, request: ToolCallRequest) {
        if self.pending.iter().any(|p| p.request.id == request.id) {
            tracing::warn!(tool_call_id = %request.id, "Ignoring duplicate tool call id");
            return;
        }
        let tracking_id = self.tracker.as_ref().map(|t| t.add_tool_call(&request));
        self.pending.push(PendingCall {
            request: request.clone(),
            tracking_id,
        });
        self.raised.push(request.clone());
        self.emit(TurnEvent::ToolCall { request });
    }

    /// Transcript in the order the model expects: every assistant message
    /// ahead of the tool results answering its calls, the in-progress
    /// assistant message leading the current turn's results. Results no
    /// assistant message claims (failed or cancelled turns) are left out.
    fn build_request(&self) -> GenerateRequest {
        let mut messages = Vec::with_capacity(self.messages.len() + 1);
        let mut results: Vec<&ChatMessage> = Vec::new();
        for message in &self.messages {
            match message.role {
                Role::Tool => results.push(message),
                Role::Assistant => {
                    messages.push(message.clone());
                    messages.extend(claim_results(&message.tool_calls, &mut results));
                }
                Role::User => {
                    messages.extend(claim_results(&[], &mut results));
                    messages.push(message.clone());
                }
            }
        }
        if !self.buffer.is_empty() || !self.raised.is_empty() {
            messages.push(ChatMessage::assistant_with_tool_calls(
                self.buffer.clone(),
                self.raised.clone(),
            ));
            messages.extend(claim_results(&self.raised, &mut results));
        }
        messages.extend(claim_results(&[], &mut results));

        GenerateRequest {
            messages,
            tools: self.tools.clone(),
            config: GenerationConfig::from(&self.config),
        }
    }

    fn finalize(&mut self) -> TurnOutcome {
        let content = std::mem::take(&mut self.buffer);
        let tool_calls = std::mem::take(&mut self.raised);
        self.messages.push(ChatMessage::assistant_with_tool_calls(
            content.clone(),
            tool_calls.clone(),
        ));
        self.set_status(TurnStatus::Completed);
        self.emit(TurnEvent::Complete {
            content: content.clone(),
            tool_calls: tool_calls.clone(),
        });

        TurnOutcome {
            status: TurnStatus::Completed,
            content,
            tool_calls,
            pending_tool_calls: Vec::new(),
        }
    }

    fn fail(&mut self, source: LlmError) -> TurnError {
        tracing::error!(model = %self.generator.model_name(), "Turn failed: {}", source);
        self.abandon_pending("Turn failed before the call was resolved");
        self.set_status(TurnStatus::Failed);
        let partial_content = self.buffer.clone();
        self.emit(TurnEvent::Error {
            message: source.to_string(),
            partial_content: partial_content.clone(),
        });
        TurnError::Generation {
            source,
            partial_content,
        }
    }

    fn settle_cancelled(&mut self) -> TurnOutcome {
        tracing::info!(
            model = %self.generator.model_name(),
            abandoned = self.pending.len(),
            "Turn cancelled"
        );
        self.abandon_pending("Turn was cancelled");
        self.set_status(TurnStatus::Cancelled);
        let content = std::mem::take(&mut self.buffer);
        self.emit(TurnEvent::Cancelled {
            partial_content: content.clone(),
        });

        TurnOutcome {
            status: TurnStatus::Cancelled,
            content,
            tool_calls: std::mem::take(&mut self.raised),
            pending_tool_calls: Vec::new(),
        }
    }

    /// Close tracker entries for calls that will never get a result.
    fn abandon_pending(&mut self, reason: &str) {
        for call in self.pending.drain(..) {
            if let (Some(tracker), Some(entry)) = (&self.tracker, call.tracking_id) {
                let _ = tracker.complete(entry, ToolOutcome::failure(FailureKind::Cancelled, reason));
            }
        }
    }

    /// Current state of the exchange as a [`TurnOutcome`].
    pub fn outcome(&self) -> TurnOutcome {
        TurnOutcome {
            status: self.status,
            content: self.buffer.clone(),
            tool_calls: self.raised.clone(),
            pending_tool_calls: self.pending_tool_calls(),
        }
    }

    fn set_status(&mut self, target: TurnStatus) {
        debug_assert!(
            self.status.can_transition_to(target),
            "invalid turn transition {} -> {}",
            self.status,
            target
        );
        tracing::debug!(from = %self.status, to = %target, "Turn status");
        self.status = target;
    }

    fn emit(&self, event: TurnEvent) {
        // No subscribers is fine; slow subscribers lag instead of blocking.
        let _ = self.events.send(event);
    }
}

/// Drain `results`, keeping those that answer one of `calls`.
fn claim_results(calls: &[ToolCallRequest], results: &mut Vec<&ChatMessage>) -> Vec<ChatMessage> {
    let mut claimed = Vec::with_capacity(results.len());
    for result in results.drain(..) {
        let answers = result
            .tool_call_id
            .as_deref()
            .is_some_and(|id| calls.iter().any(|c| c.id == id));
        if answers {
            claimed.push(result.clone());
        } else {
            tracing::debug!(tool_call_id = ?result.tool_call_id, "Leaving unclaimed tool result out of request");
        }
    }
    claimed
}
