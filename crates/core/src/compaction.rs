//! Context compaction and token counting seams.
//!
//! Compaction replaces older history with a summary so the conversation
//! stays within the active model's context window.

use crate::error::Result;
use crate::message::Message;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// What a compaction pass produces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionResult {
    /// Prose summary of the dropped history
    pub summary: String,

    #[serde(default)]
    pub key_points: Vec<String>,

    /// Tail of the history kept verbatim
    #[serde(default)]
    pub recent_messages: Vec<Message>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_summary: Option<String>,

    /// Token count of the compacted history
    pub token_count: usize,
}

/// Turns a long history into a summary plus a recent tail.
#[async_trait]
pub trait CompactionService: Send + Sync {
    async fn compact(&self, history: &[Message], model_id: &str) -> Result<CompactionResult>;
}

/// Counts tokens for a message list as a given model would.
pub trait TokenCounter: Send + Sync {
    fn count(&self, messages: &[Message], model_id: &str) -> usize;
}
