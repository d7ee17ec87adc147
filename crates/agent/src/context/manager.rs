//! Session-scoped context manager.
//!
//! Owns the compaction service and the token counter. It outlives any one
//! backend handle: the model manager hands the same instance to every
//! execution engine it builds.

use super::token::EstimatingTokenCounter;
use blade_core::compaction::{CompactionResult, CompactionService, TokenCounter};
use blade_core::message::{Message, Role};
use blade_core::{Error, Result};
use std::sync::Arc;
use tracing::{debug, info};

pub struct ContextManager {
    compaction: Option<Arc<dyn CompactionService>>,
    token_counter: Arc<dyn TokenCounter>,
    /// Fraction of the context window that triggers compaction
    threshold: f32,
    /// Most messages kept verbatim after the summary
    keep_recent: usize,
}

impl ContextManager {
    pub fn new(token_counter: Arc<dyn TokenCounter>) -> Self {
        Self {
            compaction: None,
            token_counter,
            threshold: 0.8,
            keep_recent: 6,
        }
    }

    pub fn with_compaction(mut self, service: Arc<dyn CompactionService>) -> Self {
        self.compaction = Some(service);
        self
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_keep_recent(mut self, keep_recent: usize) -> Self {
        self.keep_recent = keep_recent;
        self
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn keep_recent(&self) -> usize {
        self.keep_recent
    }

    pub fn count_tokens(&self, messages: &[Message], model_id: &str) -> usize {
        self.token_counter.count(messages, model_id)
    }

    /// Whether the history is over the threshold and a compaction service exists.
    pub fn should_compact(
        &self,
        messages: &[Message],
        model_id: &str,
        max_context_tokens: usize,
    ) -> bool {
        if self.compaction.is_none() || max_context_tokens == 0 {
            return false;
        }
        let tokens = self.count_tokens(messages, model_id);
        let limit = (max_context_tokens as f64 * self.threshold as f64) as usize;
        debug!(tokens, limit, "Compaction check");
        tokens > limit
    }

    /// Replace the history with a summary message plus the recent tail.
    pub async fn compact(&self, messages: &[Message], model_id: &str) -> Result<Vec<Message>> {
        let service = self
            .compaction
            .as_ref()
            .ok_or_else(|| Error::Compaction("no compaction service configured".into()))?;

        let before = messages.len();
        let result = service.compact(messages, model_id).await?;
        let compacted = self.rebuild(result);
        info!(before, after = compacted.len(), "History compacted");
        Ok(compacted)
    }

    fn rebuild(&self, result: CompactionResult) -> Vec<Message> {
        let mut text = format!("[Conversation summary]\n{}", result.summary.trim());
        if !result.key_points.is_empty() {
            text.push_str("\n\nKey points:");
            for point in &result.key_points {
                text.push_str("\n- ");
                text.push_str(point);
            }
        }
        if let Some(tools) = result.tool_summary.as_deref().filter(|t| !t.is_empty()) {
            text.push_str("\n\nTool activity:\n");
            text.push_str(tools);
        }

        let mut summary = Message::user(text);
        summary
            .metadata
            .insert("compacted".into(), serde_json::Value::Bool(true));
        summary.metadata.insert(
            "token_count".into(),
            serde_json::Value::from(result.token_count as u64),
        );

        // A tool result must not lead the tail without its call
        let mut recent = result.recent_messages;
        let skip = recent.len().saturating_sub(self.keep_recent);
        let mut tail = recent.split_off(skip);
        let orphans = tail.iter().take_while(|m| m.role == Role::Tool).count();
        tail.drain(..orphans);

        let mut history = Vec::with_capacity(tail.len() + 1);
        history.push(summary);
        history.extend(tail);
        history
    }
}

impl Default for ContextManager {
    fn default() -> Self {
        Self::new(Arc::new(EstimatingTokenCounter))
    }
}
