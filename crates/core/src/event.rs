//! Durable session log: the append-only record underlying a conversation.
//!
//! Each entry is a typed event stamped with a monotonic id, the session id,
//! an ISO timestamp, the working directory, the VCS branch if known, and a
//! schema version. Messages may point at a parent message so side-chains
//! (subagents) can branch off a conversation.

use crate::error::StoreError;
use crate::message::Role;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const SESSION_SCHEMA_VERSION: u32 = 1;

/// Lifecycle of a tool part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolPartState {
    Running,
    Completed { output: String },
    Failed { error: String },
}

/// Payload of a message part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "part_type", rename_all = "snake_case")]
pub enum PartData {
    Text { text: String },
    Reasoning { text: String },
    Tool {
        call_id: String,
        name: String,
        input: serde_json::Value,
        state: ToolPartState,
    },
}

/// All event kinds the log records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEventKind {
    SessionCreated {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subagent_type: Option<String>,
        #[serde(default)]
        is_sidechain: bool,
    },
    SessionUpdated {
        turns_count: u32,
        tool_calls_count: u32,
        tokens_used: u64,
        success: bool,
    },
    MessageCreated {
        message_id: String,
        role: Role,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_message_id: Option<String>,
    },
    PartCreated {
        message_id: String,
        part_id: String,
        part: PartData,
    },
    PartUpdated {
        message_id: String,
        part_id: String,
        part: PartData,
    },
}

impl SessionEventKind {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::SessionCreated { .. } => "session_created",
            Self::SessionUpdated { .. } => "session_updated",
            Self::MessageCreated { .. } => "message_created",
            Self::PartCreated { .. } => "part_created",
            Self::PartUpdated { .. } => "part_updated",
        }
    }
}

/// A stamped, persisted log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub id: u64,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub cwd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<String>,
    pub version: u32,
    #[serde(flatten)]
    pub kind: SessionEventKind,
}

/// An event before the log has assigned it an id.
#[derive(Debug, Clone)]
pub struct SessionEventDraft {
    pub session_id: String,
    pub cwd: String,
    pub git_branch: Option<String>,
    pub kind: SessionEventKind,
}

impl SessionEventDraft {
    /// Stamp the draft with its log id and the current time.
    pub fn stamp(self, id: u64) -> SessionEvent {
        SessionEvent {
            id,
            session_id: self.session_id,
            timestamp: Utc::now(),
            cwd: self.cwd,
            git_branch: self.git_branch,
            version: SESSION_SCHEMA_VERSION,
            kind: self.kind,
        }
    }
}

/// Append-only storage for session events.
#[async_trait]
pub trait SessionLog: Send + Sync {
    fn name(&self) -> &str;

    /// Persist an event and return it with its assigned id.
    async fn append(&self, draft: SessionEventDraft) -> Result<SessionEvent, StoreError>;

    /// All events of one session, in append order.
    async fn events(&self, session_id: &str) -> Result<Vec<SessionEvent>, StoreError>;
}

/// Current branch of the git checkout at `root`, read from `.git/HEAD`.
pub fn detect_git_branch(root: &Path) -> Option<String> {
    let head = std::fs::read_to_string(root.join(".git").join("HEAD")).ok()?;
    head.trim()
        .strip_prefix("ref: refs/heads/")
        .map(|branch| branch.to_string())
}
