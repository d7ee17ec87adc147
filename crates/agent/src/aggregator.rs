//! Stream aggregator: rebuilds one complete response from a delta stream.
//!
//! Deltas are forwarded as `content_delta` / `thinking_delta` events the
//! moment they arrive. Tool-call fragments are merged by their position
//! index. When the stream is unusable (the backend rejects streaming, or the
//! stream ends without producing anything) the same request is retried as a
//! blocking call, so the caller always gets a well-formed response or a
//! real error. Once a delta has been forwarded the stream is committed: a
//! later failure is returned as an error rather than retried, so the final
//! content always equals the forwarded deltas.

use crate::stream_event::{AgentEvent, EventSink};
use blade_core::error::ProviderError;
use blade_core::message::MessageToolCall;
use blade_core::provider::{Provider, ProviderRequest, ProviderResponse, ToolCallDelta, Usage};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Error texts (lowercase) that mean the backend cannot stream this request.
pub const STREAMING_UNSUPPORTED_PHRASES: &[&str] = &[
    "streaming is not supported",
    "stream is not supported",
    "streaming not supported",
    "does not support streaming",
    "streaming is not available",
    "stream mode is not supported",
    "unsupported parameter: 'stream'",
    "unsupported value: 'stream'",
    "stream_options",
];

/// Whether an error says the backend cannot stream. Case-insensitive.
pub fn is_streaming_unsupported(error: &ProviderError) -> bool {
    let text = error.to_string().to_lowercase();
    STREAMING_UNSUPPORTED_PHRASES
        .iter()
        .any(|phrase| text.contains(phrase))
}

/// The complete response of one model turn.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregatedResponse {
    pub content: String,
    pub reasoning_content: Option<String>,
    /// Only calls with both an id and a name
    pub tool_calls: Vec<MessageToolCall>,
    pub usage: Option<Usage>,
    pub finish_reason: Option<String>,
    /// Cancellation stopped consumption early
    pub aborted: bool,
    /// Produced by the blocking path after the stream was unusable
    pub fell_back: bool,
}

impl AggregatedResponse {
    fn aborted() -> Self {
        Self {
            aborted: true,
            ..Default::default()
        }
    }

    fn from_response(response: ProviderResponse) -> Self {
        let tool_calls = response
            .message
            .tool_calls
            .into_iter()
            .filter(|tc| !tc.id.is_empty() && !tc.name.is_empty())
            .collect();
        Self {
            content: response.message.content,
            reasoning_content: response.message.reasoning_content.filter(|r| !r.is_empty()),
            tool_calls,
            usage: response.usage,
            finish_reason: response.finish_reason,
            aborted: false,
            fell_back: false,
        }
    }
}

/// One tool call being assembled from fragments.
#[derive(Debug, Default)]
struct PartialToolCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

impl PartialToolCall {
    fn merge(&mut self, delta: ToolCallDelta) {
        if self.id.is_none() {
            self.id = delta.id.filter(|id| !id.is_empty());
        }
        if self.name.is_none() {
            self.name = delta.name.filter(|name| !name.is_empty());
        }
        if let Some(fragment) = delta.arguments {
            self.arguments.push_str(&fragment);
        }
    }

    fn finish(self) -> Option<MessageToolCall> {
        match (self.id, self.name) {
            (Some(id), Some(name)) => Some(MessageToolCall {
                id,
                name,
                arguments: self.arguments,
            }),
            _ => None,
        }
    }
}

/// State of one streaming response. Discarded after `finish`.
#[derive(Default)]
struct Accumulator {
    chunks: usize,
    content: String,
    reasoning: String,
    tool_calls: BTreeMap<u32, PartialToolCall>,
    usage: Option<Usage>,
    finish_reason: Option<String>,
    aborted: bool,
}

impl Accumulator {
    fn is_empty(&self) -> bool {
        !self.forwarded() && self.tool_calls.is_empty()
    }

    /// Whether any delta reached the caller.
    fn forwarded(&self) -> bool {
        !self.content.is_empty() || !self.reasoning.is_empty()
    }

    fn finish(self) -> AggregatedResponse {
        let tool_calls = self
            .tool_calls
            .into_iter()
            .filter_map(|(index, partial)| {
                let call = partial.finish();
                if call.is_none() {
                    debug!(index, "Dropping incomplete tool call");
                }
                call
            })
            .collect();
        AggregatedResponse {
            content: self.content,
            reasoning_content: (!self.reasoning.is_empty()).then_some(self.reasoning),
            tool_calls,
            usage: self.usage,
            finish_reason: self.finish_reason,
            aborted: self.aborted,
            fell_back: false,
        }
    }
}

pub struct StreamAggregator {
    provider: Arc<dyn Provider>,
}

impl StreamAggregator {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self { provider }
    }

    /// Stream `request`, forwarding deltas to `events`, and return the
    /// aggregated response.
    pub async fn aggregate(
        &self,
        mut request: ProviderRequest,
        cancel: &CancellationToken,
        events: &EventSink,
    ) -> Result<AggregatedResponse, ProviderError> {
        if cancel.is_cancelled() {
            return Ok(AggregatedResponse::aborted());
        }

        request.stream = true;
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(AggregatedResponse::aborted()),
            opened = self.provider.stream(request.clone()) => opened,
        };
        let mut rx = match opened {
            Ok(rx) => rx,
            Err(e) => return self.recover(request, e, cancel).await,
        };

        let mut acc = Accumulator::default();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    acc.aborted = true;
                    break;
                }
                next = rx.recv() => next,
            };
            let Some(item) = next else { break };
            let chunk = match item {
                Ok(chunk) => chunk,
                Err(e) if acc.forwarded() => {
                    warn!(model = %request.model, error = %e, "Stream failed after deltas were forwarded");
                    return Err(e);
                }
                Err(e) => return self.recover(request, e, cancel).await,
            };
            acc.chunks += 1;

            if let Some(text) = chunk.reasoning_content.filter(|t| !t.is_empty()) {
                if !events.emit(AgentEvent::ThinkingDelta { delta: text.clone() }, cancel).await {
                    acc.aborted = true;
                    break;
                }
                acc.reasoning.push_str(&text);
            }
            if let Some(text) = chunk.content.filter(|t| !t.is_empty()) {
                if !events.emit(AgentEvent::ContentDelta { delta: text.clone() }, cancel).await {
                    acc.aborted = true;
                    break;
                }
                acc.content.push_str(&text);
            }
            for delta in chunk.tool_calls {
                acc.tool_calls.entry(delta.index).or_default().merge(delta);
            }
            if chunk.usage.is_some() {
                acc.usage = chunk.usage;
            }
            if let Some(reason) = chunk.finish_reason {
                trace!(reason = %reason, chunks = acc.chunks, "Stream finished");
                acc.finish_reason = Some(reason);
                // Usage often trails the finish chunk; take what is already buffered
                while let Ok(Ok(trailing)) = rx.try_recv() {
                    if trailing.usage.is_some() {
                        acc.usage = trailing.usage;
                    }
                }
                break;
            }
        }

        if acc.chunks == 0 && !acc.aborted && acc.is_empty() {
            warn!(model = %request.model, "Stream produced no chunks, retrying as a blocking call");
            return self.fallback(request, cancel).await;
        }

        Ok(acc.finish())
    }

    /// Blocking call, still cancellable.
    pub async fn complete(
        &self,
        mut request: ProviderRequest,
        cancel: &CancellationToken,
    ) -> Result<AggregatedResponse, ProviderError> {
        if cancel.is_cancelled() {
            return Ok(AggregatedResponse::aborted());
        }
        request.stream = false;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Ok(AggregatedResponse::aborted()),
            response = self.provider.complete(request) => {
                response.map(AggregatedResponse::from_response)
            }
        }
    }

    async fn recover(
        &self,
        request: ProviderRequest,
        error: ProviderError,
        cancel: &CancellationToken,
    ) -> Result<AggregatedResponse, ProviderError> {
        if !is_streaming_unsupported(&error) {
            return Err(error);
        }
        warn!(model = %request.model, error = %error, "Streaming unsupported, retrying as a blocking call");
        self.fallback(request, cancel).await
    }

    async fn fallback(
        &self,
        request: ProviderRequest,
        cancel: &CancellationToken,
    ) -> Result<AggregatedResponse, ProviderError> {
        let mut response = self.complete(request, cancel).await?;
        response.fell_back = !response.aborted;
        Ok(response)
    }
}
