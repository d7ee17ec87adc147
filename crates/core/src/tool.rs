//! Tool trait and the execution pipeline seam.
//!
//! The agent loop never calls a tool directly. It hands each requested call
//! to an [`ExecutionPipeline`], which evaluates permissions for the active
//! [`PermissionMode`] and, on approval, runs the tool. [`ToolRegistry`] is
//! the stock pipeline.

use crate::error::ToolError;
use crate::permission::{
    ConfirmationHandler, ConfirmationKind, ConfirmationRequest, PermissionMode,
};
use crate::provider::ToolDefinition;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A request to execute a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique call ID (matches the LLM's tool_call.id)
    pub id: String,

    /// Name of the tool to execute
    pub name: String,

    /// Arguments as a JSON value
    pub arguments: serde_json::Value,
}

/// Side-effect classification of a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    ReadOnly,
    Write,
    Execute,
}

/// Loop-level consequences a tool result can carry back to the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolEffect {
    /// The task list changed
    TodoUpdate { todos: serde_json::Value },
    /// Stop the loop after this call
    ExitLoop {
        approved: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_mode: Option<PermissionMode>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        plan_content: Option<String>,
    },
}

/// The result of a tool execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// Whether the tool executed successfully
    pub success: bool,

    /// Content handed back to the model
    pub llm_content: String,

    /// Content meant for a human-facing display
    pub display_content: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effect: Option<ToolEffect>,
}

impl ToolResult {
    /// A successful result shown the same way to the model and the user.
    pub fn ok(content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            success: true,
            llm_content: content.clone(),
            display_content: content,
            error: None,
            effect: None,
        }
    }

    /// A failed result. The model sees the error text so it can recover.
    pub fn failure(error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            success: false,
            llm_content: format!("Error: {error}"),
            display_content: error.clone(),
            error: Some(error),
            effect: None,
        }
    }

    pub fn with_effect(mut self, effect: ToolEffect) -> Self {
        self.effect = Some(effect);
        self
    }
}

impl From<ToolError> for ToolResult {
    fn from(err: ToolError) -> Self {
        Self::failure(err.to_string())
    }
}

/// Everything a tool may need to know about the call site.
#[derive(Clone)]
pub struct ToolContext {
    pub session_id: String,
    pub workspace_root: PathBuf,
    pub permission_mode: PermissionMode,
    pub confirmation: Option<Arc<dyn ConfirmationHandler>>,
    /// Long-running tools are expected to honor this themselves
    pub cancel: CancellationToken,
}

impl ToolContext {
    pub fn new(session_id: impl Into<String>, workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            session_id: session_id.into(),
            workspace_root: workspace_root.into(),
            permission_mode: PermissionMode::Default,
            confirmation: None,
            cancel: CancellationToken::new(),
        }
    }
}

/// The core Tool trait.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g., "read_file").
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the LLM).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    fn kind(&self) -> ToolKind {
        ToolKind::Execute
    }

    /// Whether calls may overlap with other concurrency-safe calls.
    fn is_concurrency_safe(&self) -> bool {
        self.kind() == ToolKind::ReadOnly
    }

    /// Whether the tool is declared to the model in `mode`.
    fn available_in(&self, _mode: PermissionMode) -> bool {
        true
    }

    /// Execute the tool with the given arguments.
    async fn execute(
        &self,
        arguments: serde_json::Value,
        context: &ToolContext,
    ) -> std::result::Result<ToolResult, ToolError>;

    /// Convert this tool into a ToolDefinition for sending to the LLM.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// Scheduling-relevant facts about a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolMetadata {
    pub kind: ToolKind,
    pub concurrency_safe: bool,
}

/// Permission evaluation plus execution, as seen by the agent loop.
#[async_trait]
pub trait ExecutionPipeline: Send + Sync {
    /// Function declarations the given mode allows the model to see.
    fn declarations(&self, mode: PermissionMode) -> Vec<ToolDefinition>;

    fn metadata(&self, tool_name: &str) -> Option<ToolMetadata>;

    /// Evaluate permissions and run the tool. Failures come back as
    /// unsuccessful results, never as errors.
    async fn execute(
        &self,
        tool_name: &str,
        input: serde_json::Value,
        context: &ToolContext,
    ) -> ToolResult;
}

/// Outcome of checking a tool kind against a permission mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionDecision {
    Allow,
    Ask,
    Deny,
}

/// The permission table.
pub fn evaluate_permission(mode: PermissionMode, kind: ToolKind) -> PermissionDecision {
    match (mode, kind) {
        (_, ToolKind::ReadOnly) => PermissionDecision::Allow,
        (PermissionMode::Plan, _) => PermissionDecision::Deny,
        (PermissionMode::Yolo, _) => PermissionDecision::Allow,
        (PermissionMode::AutoEdit, ToolKind::Write) => PermissionDecision::Allow,
        (PermissionMode::AutoEdit, ToolKind::Execute) => PermissionDecision::Ask,
        (PermissionMode::Default, _) => PermissionDecision::Ask,
    }
}

/// A registry of available tools.
///
/// The agent loop uses this to:
/// 1. Get tool definitions to send to the LLM
/// 2. Look up, authorize and execute tools when the LLM requests them
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    /// Get all tool definitions, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<_> = self.tools.values().map(|t| t.to_definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// List all registered tool names.
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    async fn authorize(
        &self,
        tool: &dyn Tool,
        context: &ToolContext,
    ) -> std::result::Result<(), ToolError> {
        match evaluate_permission(context.permission_mode, tool.kind()) {
            PermissionDecision::Allow => Ok(()),
            PermissionDecision::Deny => Err(ToolError::PermissionDenied {
                tool_name: tool.name().to_string(),
                reason: format!("not allowed in {} mode", context.permission_mode),
            }),
            PermissionDecision::Ask => {
                let Some(handler) = &context.confirmation else {
                    return Ok(());
                };
                let response = handler
                    .confirm(ConfirmationRequest {
                        kind: ConfirmationKind::ToolExecution,
                        tool_name: tool.name().to_string(),
                        message: format!("Allow {} to run?", tool.name()),
                        plan_content: None,
                    })
                    .await;
                if response.approved {
                    Ok(())
                } else {
                    Err(ToolError::PermissionDenied {
                        tool_name: tool.name().to_string(),
                        reason: response
                            .reason
                            .unwrap_or_else(|| "rejected by user".to_string()),
                    })
                }
            }
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionPipeline for ToolRegistry {
    fn declarations(&self, mode: PermissionMode) -> Vec<ToolDefinition> {
        let mut defs: Vec<_> = self
            .tools
            .values()
            .filter(|t| t.available_in(mode))
            .filter(|t| evaluate_permission(mode, t.kind()) != PermissionDecision::Deny)
            .map(|t| t.to_definition())
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    fn metadata(&self, tool_name: &str) -> Option<ToolMetadata> {
        self.tools.get(tool_name).map(|t| ToolMetadata {
            kind: t.kind(),
            concurrency_safe: t.is_concurrency_safe(),
        })
    }

    async fn execute(
        &self,
        tool_name: &str,
        input: serde_json::Value,
        context: &ToolContext,
    ) -> ToolResult {
        let Some(tool) = self.tools.get(tool_name) else {
            return ToolError::NotFound(tool_name.to_string()).into();
        };

        if context.cancel.is_cancelled() {
            return ToolError::Cancelled(tool_name.to_string()).into();
        }

        if let Err(e) = self.authorize(tool.as_ref(), context).await {
            debug!(tool = %tool_name, error = %e, "Tool call not authorized");
            return e.into();
        }

        match tool.execute(input, context).await {
            Ok(result) => result,
            Err(e) => e.into(),
        }
    }
}
