//! Per-session and per-invocation state handed to the scheduler.
//!
//! [`ChatContext`] is owned by the caller and lives as long as the
//! conversation. [`LoopOptions`] configures one loop invocation and is
//! thrown away afterwards.

pub mod manager;
pub mod token;

pub use manager::ContextManager;
pub use token::{
    EstimatingTokenCounter, estimate_message_tokens, estimate_messages_tokens, estimate_tokens,
    estimate_tool_tokens, estimate_tools_tokens,
};

use blade_core::message::Message;
use blade_core::permission::{ConfirmationHandler, PermissionMode};
use futures::future::BoxFuture;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Per-session state. The scheduler appends to `messages` while a loop runs;
/// the caller must not touch it concurrently.
#[derive(Clone)]
pub struct ChatContext {
    pub messages: Vec<Message>,
    pub user_id: Option<String>,
    pub session_id: String,
    pub workspace_root: PathBuf,
    pub cancel: Option<CancellationToken>,
    pub confirmation_handler: Option<Arc<dyn ConfirmationHandler>>,
    pub permission_mode: PermissionMode,
    /// Replaces the built-in system prompt when set
    pub system_prompt: Option<String>,

    // Subagent lineage
    pub parent_session_id: Option<String>,
    pub subagent_type: Option<String>,
    pub is_sidechain: bool,
}

impl ChatContext {
    pub fn new(session_id: impl Into<String>, workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            messages: Vec::new(),
            user_id: None,
            session_id: session_id.into(),
            workspace_root: workspace_root.into(),
            cancel: None,
            confirmation_handler: None,
            permission_mode: PermissionMode::Default,
            system_prompt: None,
            parent_session_id: None,
            subagent_type: None,
            is_sidechain: false,
        }
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_confirmation_handler(mut self, handler: Arc<dyn ConfirmationHandler>) -> Self {
        self.confirmation_handler = Some(handler);
        self
    }

    pub fn with_permission_mode(mut self, mode: PermissionMode) -> Self {
        self.permission_mode = mode;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Mark this context as a subagent side-chain of `parent_session_id`.
    pub fn as_subagent(
        mut self,
        parent_session_id: impl Into<String>,
        subagent_type: impl Into<String>,
    ) -> Self {
        self.parent_session_id = Some(parent_session_id.into());
        self.subagent_type = Some(subagent_type.into());
        self.is_sidechain = true;
        self
    }
}

/// What the scheduler knows when the turn limit is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnLimitInfo {
    pub turns_count: u32,
    pub max_turns: u32,
    pub tool_calls_count: u32,
}

/// Answer from the turn-limit callback.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnLimitDecision {
    pub proceed: bool,
    pub reason: Option<String>,
}

impl TurnLimitDecision {
    pub fn proceed(reason: impl Into<String>) -> Self {
        Self {
            proceed: true,
            reason: Some(reason.into()),
        }
    }

    pub fn stop() -> Self {
        Self::default()
    }
}

/// Asked whether to keep going once the turn limit is reached.
pub type TurnLimitCallback =
    Arc<dyn Fn(TurnLimitInfo) -> BoxFuture<'static, TurnLimitDecision> + Send + Sync>;

/// Per-invocation overrides.
#[derive(Clone, Default)]
pub struct LoopOptions {
    /// Overrides the configured turn limit (`-1` unlimited, `0` disabled)
    pub max_turns: Option<i64>,
    pub auto_compact: Option<bool>,
    pub cancel: Option<CancellationToken>,
    pub on_turn_limit_reached: Option<TurnLimitCallback>,
    pub system_prompt: Option<String>,
    /// Switch to this model before the first turn (best effort)
    pub model: Option<String>,
}

impl LoopOptions {
    pub fn with_max_turns(mut self, max_turns: i64) -> Self {
        self.max_turns = Some(max_turns);
        self
    }

    pub fn with_auto_compact(mut self, enabled: bool) -> Self {
        self.auto_compact = Some(enabled);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_turn_limit_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(TurnLimitInfo) -> BoxFuture<'static, TurnLimitDecision> + Send + Sync + 'static,
    {
        self.on_turn_limit_reached = Some(Arc::new(callback));
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        self.model = Some(model_id.into());
        self
    }
}

/// One token that fires when either the session or the invocation signal
/// fires. Cancelling the returned token never cancels the sources.
///
/// With two sources a watcher task is spawned; it exits when the returned
/// token is cancelled, so callers should cancel it (or hold a drop guard)
/// once the invocation ends.
pub fn link_cancellation(
    session: Option<&CancellationToken>,
    invocation: Option<&CancellationToken>,
) -> CancellationToken {
    match (session, invocation) {
        (None, None) => CancellationToken::new(),
        (Some(one), None) | (None, Some(one)) => one.child_token(),
        (Some(a), Some(b)) => {
            let combined = a.child_token();
            if b.is_cancelled() {
                combined.cancel();
                return combined;
            }
            let watcher = combined.clone();
            let other = b.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = other.cancelled() => watcher.cancel(),
                    _ = watcher.cancelled() => {}
                }
            });
            combined
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_builders() {
        let ctx = ChatContext::new("s1", "/work")
            .with_permission_mode(PermissionMode::Plan)
            .with_system_prompt("custom")
            .as_subagent("parent", "explorer");

        assert_eq!(ctx.permission_mode, PermissionMode::Plan);
        assert_eq!(ctx.system_prompt.as_deref(), Some("custom"));
        assert!(ctx.is_sidechain);
        assert_eq!(ctx.parent_session_id.as_deref(), Some("parent"));
        assert!(ctx.messages.is_empty());
    }

    #[tokio::test]
    async fn turn_limit_callback_is_invoked() {
        let options = LoopOptions::default().with_turn_limit_callback(|info| {
            Box::pin(async move {
                if info.turns_count < 20 {
                    TurnLimitDecision::proceed("keep going")
                } else {
                    TurnLimitDecision::stop()
                }
            })
        });
        let callback = options.on_turn_limit_reached.unwrap();
        let info = TurnLimitInfo {
            turns_count: 10,
            max_turns: 10,
            tool_calls_count: 3,
        };
        assert!(callback(info).await.proceed);
    }

    #[tokio::test]
    async fn linked_token_follows_either_source() {
        let session = CancellationToken::new();
        let invocation = CancellationToken::new();
        let linked = link_cancellation(Some(&session), Some(&invocation));
        assert!(!linked.is_cancelled());

        invocation.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), linked.cancelled())
            .await
            .unwrap();
        assert!(!session.is_cancelled());
    }

    #[tokio::test]
    async fn linked_token_starts_cancelled_when_a_source_is() {
        let session = CancellationToken::new();
        session.cancel();
        let linked = link_cancellation(Some(&session), Some(&CancellationToken::new()));
        assert!(linked.is_cancelled());

        let invocation = CancellationToken::new();
        invocation.cancel();
        assert!(link_cancellation(None, Some(&invocation)).is_cancelled());
    }

    #[tokio::test]
    async fn cancelling_linked_token_leaves_sources_alone() {
        let session = CancellationToken::new();
        let linked = link_cancellation(Some(&session), None);
        linked.cancel();
        assert!(!session.is_cancelled());
        assert!(!link_cancellation(None, None).is_cancelled());
    }
}
