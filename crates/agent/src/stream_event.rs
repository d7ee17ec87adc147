//! Agent-level streaming events.
//!
//! `AgentEvent` is the only channel through which the scheduler reports
//! progress while a streaming loop runs. Events are sent in emission order
//! over a bounded mpsc channel, so a slow consumer slows the loop down.

use blade_core::tool::{ToolCall, ToolKind, ToolResult};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Events emitted by the agent during streaming execution.
///
/// - `turn_start`     a new model turn begins
/// - `content_delta`  partial text from the model
/// - `thinking_delta` partial reasoning from the model
/// - `stream_end`     the delta stream for this turn finished
/// - `content`        complete text of the turn
/// - `thinking`       complete reasoning of the turn
/// - `tool_start`     a tool call is being dispatched
/// - `tool_result`    a tool call finished
/// - `token_usage`    token accounting for the turn
/// - `compacting`     history compaction started or finished
/// - `todo_update`    a tool changed the task list
/// - `error`          the turn failed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    TurnStart {
        turn: u32,
        max_turns: u32,
    },

    ContentDelta {
        delta: String,
    },

    ThinkingDelta {
        delta: String,
    },

    StreamEnd,

    Content {
        content: String,
    },

    Thinking {
        content: String,
    },

    ToolStart {
        tool_call: ToolCall,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kind: Option<ToolKind>,
    },

    ToolResult {
        tool_call: ToolCall,
        result: ToolResult,
    },

    TokenUsage {
        input_tokens: u64,
        output_tokens: u64,
        total_tokens: u64,
        max_context_tokens: usize,
    },

    Compacting {
        is_compacting: bool,
    },

    TodoUpdate {
        todos: serde_json::Value,
    },

    Error {
        message: String,
    },
}

impl AgentEvent {
    /// Wire name of this event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::TurnStart { .. } => "turn_start",
            Self::ContentDelta { .. } => "content_delta",
            Self::ThinkingDelta { .. } => "thinking_delta",
            Self::StreamEnd => "stream_end",
            Self::Content { .. } => "content",
            Self::Thinking { .. } => "thinking",
            Self::ToolStart { .. } => "tool_start",
            Self::ToolResult { .. } => "tool_result",
            Self::TokenUsage { .. } => "token_usage",
            Self::Compacting { .. } => "compacting",
            Self::TodoUpdate { .. } => "todo_update",
            Self::Error { .. } => "error",
        }
    }
}

/// Where the loop sends events. Blocking invocations use a sink with no
/// receiver, so emission is a no-op.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::Sender<AgentEvent>>,
}

impl EventSink {
    pub fn none() -> Self {
        Self { tx: None }
    }

    pub fn new(tx: mpsc::Sender<AgentEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn is_streaming(&self) -> bool {
        self.tx.is_some()
    }

    /// Send an event unless `cancel` fires first; a cancelled event is
    /// dropped. Returns `false` once cancelled. A dropped receiver is not an
    /// error.
    pub async fn emit(&self, event: AgentEvent, cancel: &CancellationToken) -> bool {
        if cancel.is_cancelled() {
            return false;
        }
        let Some(tx) = &self.tx else {
            return true;
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = tx.send(event) => true,
        }
    }
}
