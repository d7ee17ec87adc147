//! Lifecycle hooks around tool execution.
//!
//! A hook system is told when a tool is about to run and when it finished.
//! Before execution it may veto the call; the agent loop then records the
//! call as a permission-denied failure.

use crate::tool::{ToolCall, ToolContext, ToolResult};
use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookDecision {
    Allow,
    Deny { reason: String },
}

#[async_trait]
pub trait HookSystem: Send + Sync {
    async fn pre_tool_use(&self, call: &ToolCall, context: &ToolContext) -> HookDecision;

    async fn post_tool_use(&self, _call: &ToolCall, _result: &ToolResult) {}
}
