//! Writes loop progress to the durable session log.
//!
//! A failed write is logged and swallowed; the conversation keeps going.

use crate::context::ChatContext;
use blade_core::event::{
    PartData, SessionEventDraft, SessionEventKind, SessionLog, ToolPartState, detect_git_branch,
};
use blade_core::message::Message;
use blade_core::tool::{ToolCall, ToolResult};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

pub(crate) struct SessionRecorder {
    log: Arc<dyn SessionLog>,
    session_id: String,
    cwd: String,
    git_branch: Option<String>,
}

impl SessionRecorder {
    pub(crate) fn new(log: Arc<dyn SessionLog>, ctx: &ChatContext) -> Self {
        Self {
            log,
            session_id: ctx.session_id.clone(),
            cwd: ctx.workspace_root.display().to_string(),
            git_branch: detect_git_branch(&ctx.workspace_root),
        }
    }

    async fn append(&self, kind: SessionEventKind) {
        let event_type = kind.event_type();
        let draft = SessionEventDraft {
            session_id: self.session_id.clone(),
            cwd: self.cwd.clone(),
            git_branch: self.git_branch.clone(),
            kind,
        };
        if let Err(e) = self.log.append(draft).await {
            warn!(
                session_id = %self.session_id,
                log = self.log.name(),
                event = event_type,
                error = %e,
                "Session log write failed"
            );
        }
    }

    pub(crate) async fn session_created(&self, ctx: &ChatContext) {
        self.append(SessionEventKind::SessionCreated {
            user_id: ctx.user_id.clone(),
            parent_session_id: ctx.parent_session_id.clone(),
            subagent_type: ctx.subagent_type.clone(),
            is_sidechain: ctx.is_sidechain,
        })
        .await;
    }

    /// `message_created` plus one part each for reasoning and text.
    pub(crate) async fn message(&self, message: &Message, parent_message_id: Option<&str>) {
        self.append(SessionEventKind::MessageCreated {
            message_id: message.id.clone(),
            role: message.role,
            parent_message_id: parent_message_id.map(str::to_string),
        })
        .await;

        if let Some(reasoning) = message.reasoning_content.as_deref().filter(|r| !r.is_empty()) {
            self.part_created(
                &message.id,
                new_part_id(),
                PartData::Reasoning {
                    text: reasoning.to_string(),
                },
            )
            .await;
        }
        if !message.content.is_empty() {
            self.part_created(
                &message.id,
                new_part_id(),
                PartData::Text {
                    text: message.content.clone(),
                },
            )
            .await;
        }
    }

    async fn part_created(&self, message_id: &str, part_id: String, part: PartData) {
        self.append(SessionEventKind::PartCreated {
            message_id: message_id.to_string(),
            part_id,
            part,
        })
        .await;
    }

    /// Record a dispatched tool call. Returns the part id for the update.
    pub(crate) async fn tool_started(&self, message_id: &str, call: &ToolCall) -> String {
        let part_id = new_part_id();
        self.part_created(
            message_id,
            part_id.clone(),
            PartData::Tool {
                call_id: call.id.clone(),
                name: call.name.clone(),
                input: call.arguments.clone(),
                state: ToolPartState::Running,
            },
        )
        .await;
        part_id
    }

    pub(crate) async fn tool_finished(
        &self,
        message_id: &str,
        part_id: &str,
        call: &ToolCall,
        state: ToolPartState,
    ) {
        self.append(SessionEventKind::PartUpdated {
            message_id: message_id.to_string(),
            part_id: part_id.to_string(),
            part: PartData::Tool {
                call_id: call.id.clone(),
                name: call.name.clone(),
                input: call.arguments.clone(),
                state,
            },
        })
        .await;
    }

    pub(crate) async fn session_updated(
        &self,
        turns_count: u32,
        tool_calls_count: u32,
        tokens_used: u64,
        success: bool,
    ) {
        self.append(SessionEventKind::SessionUpdated {
            turns_count,
            tool_calls_count,
            tokens_used,
            success,
        })
        .await;
    }
}

/// Part state for a finished tool call.
pub(crate) fn finished_state(result: &ToolResult) -> ToolPartState {
    if result.success {
        ToolPartState::Completed {
            output: result.llm_content.clone(),
        }
    } else {
        ToolPartState::Failed {
            error: result
                .error
                .clone()
                .unwrap_or_else(|| result.llm_content.clone()),
        }
    }
}

fn new_part_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use blade_core::error::StoreError;
    use blade_core::event::SessionEvent;
    use blade_session::InMemorySessionLog;

    struct BrokenLog;

    #[async_trait]
    impl SessionLog for BrokenLog {
        fn name(&self) -> &str {
            "broken"
        }
        async fn append(&self, _draft: SessionEventDraft) -> Result<SessionEvent, StoreError> {
            Err(StoreError::Storage("disk full".into()))
        }
        async fn events(&self, _session_id: &str) -> Result<Vec<SessionEvent>, StoreError> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn message_writes_parts_in_order() {
        let log = Arc::new(InMemorySessionLog::new());
        let ctx = ChatContext::new("s1", "/nonexistent-workspace");
        let recorder = SessionRecorder::new(log.clone(), &ctx);

        let mut message = Message::assistant("answer");
        message.reasoning_content = Some("thought".into());
        recorder.message(&message, Some("parent")).await;

        let events = log.events("s1").await.unwrap();
        let types: Vec<_> = events.iter().map(|e| e.kind.event_type()).collect();
        assert_eq!(types, ["message_created", "part_created", "part_created"]);
        assert!(matches!(
            &events[0].kind,
            SessionEventKind::MessageCreated { parent_message_id: Some(p), .. } if p == "parent"
        ));
        assert!(matches!(
            &events[1].kind,
            SessionEventKind::PartCreated { part: PartData::Reasoning { .. }, .. }
        ));
        assert_eq!(events[0].cwd, "/nonexistent-workspace");
        assert_eq!(events[0].git_branch, None);
    }

    #[tokio::test]
    async fn tool_part_lifecycle_shares_part_id() {
        let log = Arc::new(InMemorySessionLog::new());
        let recorder = SessionRecorder::new(log.clone(), &ChatContext::new("s1", "/w"));
        let call = ToolCall {
            id: "call_1".into(),
            name: "echo".into(),
            arguments: serde_json::json!({"text": "x"}),
        };

        let part_id = recorder.tool_started("m1", &call).await;
        recorder
            .tool_finished("m1", &part_id, &call, finished_state(&ToolResult::ok("x")))
            .await;

        let events = log.events("s1").await.unwrap();
        match (&events[0].kind, &events[1].kind) {
            (
                SessionEventKind::PartCreated { part_id: a, part: PartData::Tool { state: ToolPartState::Running, .. }, .. },
                SessionEventKind::PartUpdated { part_id: b, part: PartData::Tool { state: ToolPartState::Completed { output }, .. }, .. },
            ) => {
                assert_eq!(a, b);
                assert_eq!(output, "x");
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[tokio::test]
    async fn write_failures_are_swallowed() {
        let recorder = SessionRecorder::new(Arc::new(BrokenLog), &ChatContext::new("s1", "/w"));
        recorder.message(&Message::user("hi"), None).await;
        recorder.session_updated(1, 0, 10, true).await;
    }

    #[test]
    fn failed_result_maps_to_failed_state() {
        let state = finished_state(&ToolResult::failure("boom"));
        assert_eq!(
            state,
            ToolPartState::Failed {
                error: "boom".into()
            }
        );
    }
}
