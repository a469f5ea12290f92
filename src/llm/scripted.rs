//! Offline content generator that plays back scripted streams.
//!
//! Each call to `generate_stream` pops the next [`Script`]. When the queue is
//! empty the generator echoes the last user message, which keeps the binary
//! usable without a model backend.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;

use crate::error::LlmError;
use crate::llm::provider::{
    ChatMessage, ContentGenerator, GenerateRequest, GenerateResponse, GenerationStream, Role,
    StreamEvent, TokenCount, TokenUsage,
};

/// Default context window reported by `count_tokens`.
const DEFAULT_CONTEXT_LIMIT: usize = 200_000;

/// Rough characters-per-token ratio used for counting.
const CHARS_PER_TOKEN: usize = 4;

/// One scripted response.
#[derive(Debug)]
pub enum Script {
    /// Stream these items in order, then end.
    Stream(Vec<Result<StreamEvent, LlmError>>),
    /// Fail to open the stream.
    OpenError(LlmError),
    /// Emit these items and then never finish.
    Hang(Vec<StreamEvent>),
}

impl Script {
    /// Text chunks followed by an explicit end.
    pub fn chunks<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut items: Vec<Result<StreamEvent, LlmError>> = chunks
            .into_iter()
            .map(|c| Ok(StreamEvent::Content(c.into())))
            .collect();
        items.push(Ok(StreamEvent::End));
        Self::Stream(items)
    }

    /// Arbitrary events, all successful.
    pub fn events(events: Vec<StreamEvent>) -> Self {
        Self::Stream(events.into_iter().map(Ok).collect())
    }
}

/// Content generator backed by a queue of scripts.
#[derive(Debug)]
pub struct ScriptedGenerator {
    model: String,
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<GenerateRequest>>,
    context_limit: usize,
}

impl Default for ScriptedGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self {
            model: "scripted".to_string(),
            scripts: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            context_limit: DEFAULT_CONTEXT_LIMIT,
        }
    }

    pub fn with_scripts(scripts: impl IntoIterator<Item = Script>) -> Self {
        let generator = Self::new();
        generator
            .scripts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(scripts);
        generator
    }

    pub fn with_context_limit(mut self, limit: usize) -> Self {
        self.context_limit = limit;
        self
    }

    /// Queue another script.
    pub fn push(&self, script: Script) {
        self.scripts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(script);
    }

    /// Requests seen so far, in call order.
    pub fn requests(&self) -> Vec<GenerateRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Number of `generate_stream` calls made.
    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn next_script(&self, request: &GenerateRequest) -> Script {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());
        self.scripts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_else(|| echo_script(&request.messages))
    }
}

fn echo_script(messages: &[ChatMessage]) -> Script {
    let last_user = messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.as_str())
        .unwrap_or("(no input)");
    Script::chunks(["Echo: ".to_string(), last_user.to_string()])
}

fn estimate_tokens(messages: &[ChatMessage]) -> usize {
    messages
        .iter()
        .map(|m| m.content.chars().count().div_ceil(CHARS_PER_TOKEN))
        .sum()
}

#[async_trait]
impl ContentGenerator for ScriptedGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse, LlmError> {
        let input_tokens = estimate_tokens(&request.messages);
        let mut stream = self.generate_stream(request).await?;
        let mut content = String::new();
        let mut tool_calls = Vec::new();
        while let Some(item) = stream.next().await {
            match item? {
                StreamEvent::Content(text) => content.push_str(&text),
                StreamEvent::ToolCall(call) => tool_calls.push(call),
                StreamEvent::End => break,
            }
        }
        let output_tokens = content.chars().count().div_ceil(CHARS_PER_TOKEN);
        Ok(GenerateResponse {
            content,
            tool_calls,
            usage: TokenUsage {
                input_tokens: u32::try_from(input_tokens).unwrap_or(u32::MAX),
                output_tokens: u32::try_from(output_tokens).unwrap_or(u32::MAX),
            },
        })
    }

    async fn generate_stream(
        &self,
        request: GenerateRequest,
    ) -> Result<GenerationStream, LlmError> {
        match self.next_script(&request) {
            Script::Stream(items) => Ok(Box::pin(stream::iter(items))),
            Script::OpenError(err) => Err(err),
            Script::Hang(events) => Ok(Box::pin(
                stream::iter(events.into_iter().map(Ok)).chain(stream::pending()),
            )),
        }
    }

    async fn count_tokens(&self, messages: &[ChatMessage]) -> Result<TokenCount, LlmError> {
        Ok(TokenCount {
            token_count: estimate_tokens(messages),
            context_limit: self.context_limit,
        })
    }
}
