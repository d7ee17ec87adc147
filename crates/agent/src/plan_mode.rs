//! Plan mode: the injector that wraps scheduler invocations, and the
//! `exit_plan_mode` tool the model calls once its plan is ready.

use crate::context::{ChatContext, LoopOptions};
use crate::loop_runner::Agent;
use crate::result::LoopResult;
use crate::stream_event::AgentEvent;
use async_trait::async_trait;
use blade_core::error::ToolError;
use blade_core::message::{ContentPart, UserInput};
use blade_core::permission::{
    ConfirmationKind, ConfirmationRequest, ConfirmationResponse, PermissionMode,
};
use blade_core::tool::{Tool, ToolContext, ToolEffect, ToolKind, ToolResult};
use tokio::sync::mpsc;
use tracing::{debug, info};

pub const EXIT_PLAN_MODE_TOOL: &str = "exit_plan_mode";

/// Prepended to every user message while in Plan mode.
pub const PLAN_MODE_REMINDER: &str = "<system-reminder>\n\
Plan mode is active. Do not edit files, run commands, or change any state. \
Research with read-only tools, then call exit_plan_mode with your complete plan.\n\
</system-reminder>";

/// Rewrites the prompt and the user message, then hands off to the scheduler.
pub struct PlanModeInjector<'a> {
    agent: &'a Agent,
}

impl<'a> PlanModeInjector<'a> {
    pub fn new(agent: &'a Agent) -> Self {
        Self { agent }
    }

    /// Put the reminder in front of the user's text.
    ///
    /// Multi-part input gets it prepended to the first text part, or as a
    /// new leading text part when there is none.
    pub fn inject_reminder(input: UserInput) -> UserInput {
        match input {
            UserInput::Text(text) => UserInput::Text(format!("{PLAN_MODE_REMINDER}\n\n{text}")),
            UserInput::Parts(mut parts) => {
                let first_text = parts.iter_mut().find_map(|part| match part {
                    ContentPart::Text { text } => Some(text),
                    ContentPart::Image { .. } => None,
                });
                match first_text {
                    Some(text) => *text = format!("{PLAN_MODE_REMINDER}\n\n{text}"),
                    None => parts.insert(0, ContentPart::text(PLAN_MODE_REMINDER)),
                }
                UserInput::Parts(parts)
            }
        }
    }

    /// Build the Plan-mode system prompt for this invocation. A prompt set by
    /// the caller replaces the built-in base instructions.
    fn prepare(&self, ctx: &ChatContext, mut options: LoopOptions) -> LoopOptions {
        let base = options
            .system_prompt
            .take()
            .or_else(|| ctx.system_prompt.clone());
        let builder = match base {
            Some(base) => self.agent.prompt_builder().clone().with_base_instructions(base),
            None => self.agent.prompt_builder().clone(),
        };
        options.system_prompt = Some(builder.build(&ctx.workspace_root, PermissionMode::Plan));
        options
    }

    pub async fn run(
        &self,
        input: UserInput,
        ctx: &mut ChatContext,
        options: LoopOptions,
    ) -> LoopResult {
        debug!(session_id = %ctx.session_id, "Running in plan mode");
        let options = self.prepare(ctx, options);
        self.agent
            .run_loop(Self::inject_reminder(input), ctx, options)
            .await
    }

    pub async fn run_stream(
        &self,
        input: UserInput,
        ctx: &mut ChatContext,
        options: LoopOptions,
        events: mpsc::Sender<AgentEvent>,
    ) -> LoopResult {
        debug!(session_id = %ctx.session_id, "Running in plan mode (streaming)");
        let options = self.prepare(ctx, options);
        self.agent
            .run_loop_stream(Self::inject_reminder(input), ctx, options, events)
            .await
    }
}

/// Asks the user to approve the plan and ends the loop either way.
pub struct ExitPlanModeTool;

#[async_trait]
impl Tool for ExitPlanModeTool {
    fn name(&self) -> &str {
        EXIT_PLAN_MODE_TOOL
    }

    fn description(&self) -> &str {
        "Present the finished implementation plan to the user for approval and leave plan mode. \
         Call this only when the plan is complete."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "plan": {
                    "type": "string",
                    "description": "The full plan, in markdown"
                }
            },
            "required": ["plan"]
        })
    }

    fn kind(&self) -> ToolKind {
        ToolKind::ReadOnly
    }

    fn available_in(&self, mode: PermissionMode) -> bool {
        mode == PermissionMode::Plan
    }

    async fn execute(
        &self,
        arguments: serde_json::Value,
        context: &ToolContext,
    ) -> Result<ToolResult, ToolError> {
        if context.permission_mode != PermissionMode::Plan {
            return Err(ToolError::ExecutionFailed {
                tool_name: EXIT_PLAN_MODE_TOOL.into(),
                reason: format!("not in plan mode (current mode: {})", context.permission_mode),
            });
        }

        let plan = arguments["plan"]
            .as_str()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| ToolError::InvalidArguments("'plan' must be a non-empty string".into()))?
            .to_string();

        let response = match &context.confirmation {
            Some(handler) => {
                handler
                    .confirm(ConfirmationRequest {
                        kind: ConfirmationKind::ExitPlanMode,
                        tool_name: EXIT_PLAN_MODE_TOOL.into(),
                        message: "Approve this plan and start implementing it?".into(),
                        plan_content: Some(plan.clone()),
                    })
                    .await
            }
            None => ConfirmationResponse::approve(),
        };

        if response.approved {
            let target_mode = response.target_mode.unwrap_or(PermissionMode::Default);
            info!(session_id = %context.session_id, target_mode = %target_mode, "Plan approved");
            let mut result = ToolResult::ok(format!(
                "The user approved the plan. Plan mode is over; continue in {target_mode} mode."
            ));
            result.display_content = "Plan approved".into();
            Ok(result.with_effect(ToolEffect::ExitLoop {
                approved: true,
                target_mode: Some(target_mode),
                plan_content: Some(plan),
            }))
        } else {
            let reason = response
                .reason
                .unwrap_or_else(|| "no reason given".to_string());
            info!(session_id = %context.session_id, reason = %reason, "Plan rejected");
            Ok(
                ToolResult::failure(format!("The user rejected the plan: {reason}")).with_effect(
                    ToolEffect::ExitLoop {
                        approved: false,
                        target_mode: None,
                        plan_content: Some(plan),
                    },
                ),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::LoopErrorKind;
    use crate::test_helpers::*;
    use blade_core::message::Role;
    use blade_core::permission::ConfirmationHandler;
    use blade_core::tool::ToolRegistry;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    struct ScriptedApproval {
        response: ConfirmationResponse,
        seen: Mutex<Vec<ConfirmationRequest>>,
    }

    impl ScriptedApproval {
        fn new(response: ConfirmationResponse) -> Arc<Self> {
            Arc::new(Self {
                response,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ConfirmationHandler for ScriptedApproval {
        async fn confirm(&self, request: ConfirmationRequest) -> ConfirmationResponse {
            self.seen.lock().unwrap().push(request);
            self.response.clone()
        }
    }

    fn plan_agent(provider: Arc<ScriptedProvider>) -> Agent {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        registry.register(Arc::new(RecordingWriteTool {
            log: Arc::new(Mutex::new(Vec::new())),
        }));
        registry.register(Arc::new(ExitPlanModeTool));
        Agent::new(model_manager(provider), Arc::new(registry))
    }

    fn plan_ctx() -> ChatContext {
        ChatContext::new("plan-session", "/nonexistent-workspace")
            .with_permission_mode(PermissionMode::Plan)
    }

    fn exit_call(plan: &str) -> blade_core::message::MessageToolCall {
        make_tool_call("call_exit", EXIT_PLAN_MODE_TOOL, json!({ "plan": plan }))
    }

    #[test]
    fn reminder_wraps_plain_text() {
        let input = PlanModeInjector::inject_reminder("add a flag".into());
        let UserInput::Text(text) = input else {
            panic!("expected text input");
        };
        assert!(text.starts_with("<system-reminder>"));
        assert!(text.ends_with("add a flag"));
    }

    #[test]
    fn reminder_goes_into_first_text_part() {
        let input = UserInput::Parts(vec![
            ContentPart::Image {
                url: "data:image/png;base64,AAAA".into(),
                mime_type: Some("image/png".into()),
            },
            ContentPart::text("what is this"),
            ContentPart::text("second"),
        ]);
        let UserInput::Parts(parts) = PlanModeInjector::inject_reminder(input) else {
            panic!("expected parts");
        };
        assert_eq!(parts.len(), 3);
        assert!(matches!(&parts[0], ContentPart::Image { .. }));
        let first = parts[1].as_text().unwrap();
        assert!(first.starts_with(PLAN_MODE_REMINDER));
        assert!(first.ends_with("what is this"));
        assert_eq!(parts[2].as_text(), Some("second"));
    }

    #[test]
    fn reminder_becomes_leading_part_without_text() {
        let input = UserInput::Parts(vec![ContentPart::Image {
            url: "https://example.com/a.png".into(),
            mime_type: None,
        }]);
        let UserInput::Parts(parts) = PlanModeInjector::inject_reminder(input) else {
            panic!("expected parts");
        };
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].as_text(), Some(PLAN_MODE_REMINDER));
    }

    #[tokio::test]
    async fn plan_mode_prompt_and_tools() {
        let provider = Arc::new(ScriptedProvider::with_responses(vec![make_text_response(
            "Here is what I found.",
        )]));
        let agent = plan_agent(provider.clone());
        let mut ctx = plan_ctx();

        let result = agent.chat("look around", &mut ctx, LoopOptions::default()).await;

        assert!(result.success);
        let request = &provider.requests()[0];
        assert_eq!(request.messages[0].role, Role::System);
        assert!(request.messages[0].content.contains("<plan_mode>"));
        assert!(request.messages[1].content.starts_with("<system-reminder>"));

        let tools: Vec<_> = request.tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(tools, ["echo", "exit_plan_mode"]);
        assert!(ctx.messages.iter().all(|m| m.role != Role::System));
    }

    #[tokio::test]
    async fn caller_prompt_keeps_plan_rules() {
        let provider = Arc::new(ScriptedProvider::with_responses(vec![make_text_response("ok")]));
        let agent = plan_agent(provider.clone());
        let mut ctx = plan_ctx().with_system_prompt("You review code.");

        agent.chat("go", &mut ctx, LoopOptions::default()).await;

        let prompt = &provider.requests()[0].messages[0].content;
        assert!(prompt.starts_with("You review code."));
        assert!(prompt.contains("<plan_mode>"));
    }

    #[tokio::test]
    async fn approved_plan_surfaces_transition() {
        let provider = Arc::new(ScriptedProvider::with_responses(vec![
            make_tool_call_response(vec![exit_call("1. Add flag\n2. Test it")], "Plan ready."),
            make_text_response("should not be requested"),
        ]));
        let agent = plan_agent(provider.clone());
        let approval = ScriptedApproval::new(ConfirmationResponse {
            approved: true,
            target_mode: Some(PermissionMode::AutoEdit),
            reason: None,
        });
        let mut ctx = plan_ctx().with_confirmation_handler(approval.clone());

        let result = agent.chat("plan it", &mut ctx, LoopOptions::default()).await;

        assert!(result.success, "{result:?}");
        assert!(result.metadata.should_exit_loop);
        assert_eq!(result.metadata.target_mode, Some(PermissionMode::AutoEdit));
        assert_eq!(
            result.metadata.plan_content.as_deref(),
            Some("1. Add flag\n2. Test it")
        );
        assert_eq!(result.final_message, "1. Add flag\n2. Test it");
        assert_eq!(provider.total_calls(), 1);

        let seen = approval.seen.lock().unwrap();
        assert_eq!(seen[0].kind, ConfirmationKind::ExitPlanMode);
        assert_eq!(seen[0].plan_content.as_deref(), Some("1. Add flag\n2. Test it"));
    }

    #[tokio::test]
    async fn rejected_plan_is_canceled() {
        let provider = Arc::new(ScriptedProvider::with_responses(vec![make_tool_call_response(
            vec![exit_call("1. Delete everything")],
            "",
        )]));
        let agent = plan_agent(provider);
        let approval = ScriptedApproval::new(ConfirmationResponse::reject("too risky"));
        let mut ctx = plan_ctx().with_confirmation_handler(approval);

        let result = agent.chat("plan it", &mut ctx, LoopOptions::default()).await;

        assert!(!result.success);
        let error = result.error.unwrap();
        assert_eq!(error.kind, LoopErrorKind::Canceled);
        assert!(error.details.unwrap().contains("too risky"));
        assert!(result.metadata.should_exit_loop);
        assert_eq!(result.metadata.target_mode, None);
    }

    #[tokio::test]
    async fn streaming_plan_mode_uses_same_injection() {
        let provider = Arc::new(ScriptedProvider::with_responses(vec![make_text_response("ok")]));
        let agent = plan_agent(provider.clone());
        let mut ctx = plan_ctx();
        let (tx, mut rx) = mpsc::channel(32);

        let result = agent
            .chat_stream("look", &mut ctx, LoopOptions::default(), tx)
            .await;

        assert!(result.success);
        assert_eq!(rx.recv().await.unwrap().event_type(), "turn_start");
        assert!(ctx.messages[0].content.starts_with("<system-reminder>"));
        assert!(provider.requests()[0].stream);
    }

    #[tokio::test]
    async fn exit_tool_is_hidden_outside_plan_mode() {
        let provider = Arc::new(ScriptedProvider::with_responses(vec![make_text_response(
            "Nothing to plan.",
        )]));
        let agent = plan_agent(provider.clone());
        let mut ctx = ChatContext::new("plain-session", "/nonexistent-workspace")
            .with_permission_mode(PermissionMode::AutoEdit);

        let result = agent.chat("hello", &mut ctx, LoopOptions::default()).await;

        assert!(result.success);
        let tools: Vec<_> = provider.requests()[0]
            .tools
            .iter()
            .map(|t| t.name.clone())
            .collect();
        assert_eq!(tools, ["echo", "write_file"]);
    }

    #[tokio::test]
    async fn tool_refuses_outside_plan_mode() {
        let ctx = ToolContext::new("s1", "/w");
        let err = ExitPlanModeTool
            .execute(json!({"plan": "x"}), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::ExecutionFailed { .. }));
    }

    #[tokio::test]
    async fn tool_without_handler_approves_into_default_mode() {
        let mut ctx = ToolContext::new("s1", "/w");
        ctx.permission_mode = PermissionMode::Plan;

        let result = ExitPlanModeTool
            .execute(json!({"plan": "  do it  "}), &ctx)
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(
            result.effect,
            Some(ToolEffect::ExitLoop {
                approved: true,
                target_mode: Some(PermissionMode::Default),
                plan_content: Some("do it".into()),
            })
        );
    }

    #[tokio::test]
    async fn tool_requires_plan_text() {
        let mut ctx = ToolContext::new("s1", "/w");
        ctx.permission_mode = PermissionMode::Plan;
        let err = ExitPlanModeTool
            .execute(json!({"plan": "   "}), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }
}
