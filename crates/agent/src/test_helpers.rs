//! Shared test helpers: scripted providers, a factory, and small tools.

use crate::model_manager::ModelManager;
use async_trait::async_trait;
use blade_config::{BladeConfig, ModelConfig};
use blade_core::error::{ProviderError, ToolError};
use blade_core::message::{Message, MessageToolCall};
use blade_core::provider::{
    Provider, ProviderRequest, ProviderResponse, StreamChunk, StreamReceiver, ToolCallDelta, Usage,
};
use blade_core::tool::{Tool, ToolContext, ToolEffect, ToolKind, ToolResult};
use blade_providers::ProviderFactory;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

/// One scripted answer to a `stream()` call.
pub enum StreamScript {
    /// Send these items, then close the stream
    Chunks(Vec<Result<StreamChunk, ProviderError>>),
    /// Send these items and keep the stream open forever
    Stalled(Vec<Result<StreamChunk, ProviderError>>),
    /// Fail to open the stream
    OpenError(ProviderError),
}

/// A mock provider that replays scripted streams and blocking responses.
///
/// `stream()` pops the next stream script; once those run out it falls back
/// to wrapping the next blocking response as a single chunk. `complete()`
/// pops the next blocking response and fails once the queue is empty.
#[derive(Default)]
pub struct ScriptedProvider {
    streams: Mutex<VecDeque<StreamScript>>,
    responses: Mutex<VecDeque<Result<ProviderResponse, ProviderError>>>,
    requests: Mutex<Vec<ProviderRequest>>,
    stream_calls: Mutex<usize>,
    complete_calls: Mutex<usize>,
    held: Mutex<Vec<mpsc::Sender<Result<StreamChunk, ProviderError>>>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocking responses only.
    pub fn with_responses(responses: Vec<ProviderResponse>) -> Self {
        let provider = Self::new();
        for response in responses {
            provider.push_response(Ok(response));
        }
        provider
    }

    pub fn push_stream(&self, script: StreamScript) {
        self.streams.lock().unwrap().push_back(script);
    }

    pub fn push_response(&self, response: Result<ProviderResponse, ProviderError>) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn stream_calls(&self) -> usize {
        *self.stream_calls.lock().unwrap()
    }

    pub fn complete_calls(&self) -> usize {
        *self.complete_calls.lock().unwrap()
    }

    pub fn total_calls(&self) -> usize {
        self.stream_calls() + self.complete_calls()
    }

    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn next_response(&self) -> Result<ProviderResponse, ProviderError> {
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Err(ProviderError::ApiError {
                    status_code: 500,
                    message: "ScriptedProvider: no more responses".into(),
                })
            })
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        *self.complete_calls.lock().unwrap() += 1;
        self.requests.lock().unwrap().push(request);
        self.next_response()
    }

    async fn stream(&self, request: ProviderRequest) -> Result<StreamReceiver, ProviderError> {
        *self.stream_calls.lock().unwrap() += 1;
        self.requests.lock().unwrap().push(request);

        let script = self.streams.lock().unwrap().pop_front();
        let (items, keep_open) = match script {
            Some(StreamScript::Chunks(items)) => (items, false),
            Some(StreamScript::Stalled(items)) => (items, true),
            Some(StreamScript::OpenError(e)) => return Err(e),
            None => (vec![self.next_response().map(StreamChunk::from_response)], false),
        };

        let (tx, rx) = mpsc::channel(items.len() + 1);
        for item in items {
            tx.try_send(item).unwrap();
        }
        if keep_open {
            self.held.lock().unwrap().push(tx);
        }
        Ok(rx)
    }
}

/// Factory handing out the same scripted provider for every model.
pub struct ScriptedFactory {
    provider: Arc<ScriptedProvider>,
    built: Mutex<Vec<String>>,
}

impl ScriptedFactory {
    pub fn new(provider: Arc<ScriptedProvider>) -> Self {
        Self {
            provider,
            built: Mutex::new(Vec::new()),
        }
    }

    /// Model ids the factory was asked to build, in order.
    pub fn built(&self) -> Vec<String> {
        self.built.lock().unwrap().clone()
    }
}

impl ProviderFactory for ScriptedFactory {
    fn build(&self, model: &ModelConfig) -> Result<Arc<dyn Provider>, ProviderError> {
        self.built.lock().unwrap().push(model.id.clone());
        Ok(self.provider.clone())
    }
}

pub fn model(id: &str, max_context_tokens: Option<usize>) -> ModelConfig {
    ModelConfig {
        id: id.into(),
        name: String::new(),
        provider: "openai".into(),
        model: format!("{id}-wire"),
        api_key: Some("sk-test".into()),
        base_url: None,
        max_context_tokens,
        max_output_tokens: None,
        temperature: None,
        supports_thinking: false,
    }
}

/// Two models, `model-1` current.
pub fn test_config() -> BladeConfig {
    BladeConfig {
        models: vec![model("model-1", Some(32_000)), model("model-2", Some(8_000))],
        current_model_id: Some("model-1".into()),
        ..Default::default()
    }
}

pub fn model_manager(provider: Arc<ScriptedProvider>) -> Arc<ModelManager> {
    Arc::new(ModelManager::new(
        test_config(),
        Arc::new(ScriptedFactory::new(provider)),
    ))
}

pub fn usage(prompt: u32, completion: u32) -> Usage {
    Usage {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: prompt + completion,
    }
}

/// Create a simple text response (no tool calls).
pub fn make_text_response(text: &str) -> ProviderResponse {
    ProviderResponse {
        message: Message::assistant(text),
        usage: Some(usage(10, 5)),
        model: "mock-model".into(),
        finish_reason: Some("stop".into()),
        metadata: serde_json::Map::new(),
    }
}

/// Create a response with tool calls and optional leading text.
pub fn make_tool_call_response(tool_calls: Vec<MessageToolCall>, text: &str) -> ProviderResponse {
    let mut msg = Message::assistant(text);
    msg.tool_calls = tool_calls;
    ProviderResponse {
        message: msg,
        usage: Some(usage(10, 5)),
        model: "mock-model".into(),
        finish_reason: Some("tool_calls".into()),
        metadata: serde_json::Map::new(),
    }
}

/// Helper to create a tool call with a given id.
pub fn make_tool_call(id: &str, name: &str, args: serde_json::Value) -> MessageToolCall {
    MessageToolCall {
        id: id.to_string(),
        name: name.to_string(),
        arguments: serde_json::to_string(&args).unwrap(),
    }
}

pub fn text_chunk(text: &str) -> Result<StreamChunk, ProviderError> {
    Ok(StreamChunk {
        content: Some(text.into()),
        ..Default::default()
    })
}

pub fn thinking_chunk(text: &str) -> Result<StreamChunk, ProviderError> {
    Ok(StreamChunk {
        reasoning_content: Some(text.into()),
        ..Default::default()
    })
}

pub fn tool_chunk(
    index: u32,
    id: Option<&str>,
    name: Option<&str>,
    arguments: Option<&str>,
) -> Result<StreamChunk, ProviderError> {
    Ok(StreamChunk {
        tool_calls: vec![ToolCallDelta {
            index,
            id: id.map(Into::into),
            name: name.map(Into::into),
            arguments: arguments.map(Into::into),
        }],
        ..Default::default()
    })
}

pub fn finish_chunk(reason: &str, usage: Option<Usage>) -> Result<StreamChunk, ProviderError> {
    Ok(StreamChunk {
        finish_reason: Some(reason.into()),
        usage,
        ..Default::default()
    })
}

/// Read-only tool that echoes `text` after an optional delay in `delay_ms`.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }
    fn description(&self) -> &str {
        "Echoes back the input"
    }
    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "text": { "type": "string" },
                "delay_ms": { "type": "integer" }
            },
            "required": ["text"]
        })
    }
    fn kind(&self) -> ToolKind {
        ToolKind::ReadOnly
    }
    async fn execute(
        &self,
        arguments: serde_json::Value,
        _context: &ToolContext,
    ) -> Result<ToolResult, ToolError> {
        if let Some(ms) = arguments["delay_ms"].as_u64() {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        let text = arguments["text"].as_str().unwrap_or("").to_string();
        Ok(ToolResult::ok(text))
    }
}

/// Write-kind tool that records the order it ran in.
pub struct RecordingWriteTool {
    pub log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Tool for RecordingWriteTool {
    fn name(&self) -> &str {
        "write_file"
    }
    fn description(&self) -> &str {
        "Writes a file"
    }
    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object", "properties": {"path": {"type": "string"}}})
    }
    fn kind(&self) -> ToolKind {
        ToolKind::Write
    }
    async fn execute(
        &self,
        arguments: serde_json::Value,
        _context: &ToolContext,
    ) -> Result<ToolResult, ToolError> {
        let path = arguments["path"].as_str().unwrap_or("?").to_string();
        self.log.lock().unwrap().push(path.clone());
        Ok(ToolResult::ok(format!("wrote {path}")))
    }
}

/// Tool that replaces the task list.
pub struct TodoTool;

#[async_trait]
impl Tool for TodoTool {
    fn name(&self) -> &str {
        "todo_write"
    }
    fn description(&self) -> &str {
        "Updates the task list"
    }
    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object", "properties": {"todos": {"type": "array"}}})
    }
    fn kind(&self) -> ToolKind {
        ToolKind::ReadOnly
    }
    async fn execute(
        &self,
        arguments: serde_json::Value,
        _context: &ToolContext,
    ) -> Result<ToolResult, ToolError> {
        let todos = arguments["todos"].clone();
        Ok(ToolResult::ok("todos updated").with_effect(ToolEffect::TodoUpdate { todos }))
    }
}
