//! # Blade Core
//!
//! Domain types, traits, and error definitions for the Blade agent runtime.
//! This crate has no framework dependencies. It defines the vocabulary the
//! provider, session, and agent crates implement against.
//!
//! ## Seams
//!
//! Every pluggable subsystem is a trait here:
//! - [`Provider`] talks to a model backend
//! - [`ExecutionPipeline`] authorizes and runs tools
//! - [`HookSystem`] observes and may veto tool calls
//! - [`CompactionService`] and [`TokenCounter`] keep history within budget
//! - [`SessionLog`] persists the conversation
//! - [`ConfirmationHandler`] asks the user

pub mod compaction;
pub mod error;
pub mod event;
pub mod hook;
pub mod message;
pub mod permission;
pub mod provider;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use compaction::{CompactionResult, CompactionService, TokenCounter};
pub use error::{Error, ProviderError, Result, StoreError, ToolError};
pub use event::{
    PartData, SessionEvent, SessionEventDraft, SessionEventKind, SessionLog, ToolPartState,
};
pub use hook::{HookDecision, HookSystem};
pub use message::{ContentPart, Message, MessageToolCall, Role, UserInput};
pub use permission::{
    ConfirmationHandler, ConfirmationKind, ConfirmationRequest, ConfirmationResponse,
    PermissionMode,
};
pub use provider::{
    Provider, ProviderRequest, ProviderResponse, StreamChunk, StreamReceiver, ToolCallDelta,
    ToolDefinition, Usage,
};
pub use tool::{
    ExecutionPipeline, Tool, ToolCall, ToolContext, ToolEffect, ToolKind, ToolMetadata,
    ToolRegistry, ToolResult,
};
