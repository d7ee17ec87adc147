//! The turn scheduler.
//!
//! One invocation drives the conversation turn by turn: ask the active model
//! for a response, run any tool calls it requested, append everything to
//! history, and go again until the model answers without tools or a limit,
//! cancellation, or a detected loop ends it.

use crate::context::{
    ChatContext, LoopOptions, TurnLimitDecision, TurnLimitInfo, estimate_tokens,
    link_cancellation,
};
use crate::loop_detection::LoopDetector;
use crate::model_manager::ModelManager;
use crate::plan_mode::PlanModeInjector;
use crate::prompt::SystemPromptBuilder;
use crate::recorder::{SessionRecorder, finished_state};
use crate::result::{LoopError, LoopErrorKind, LoopMetadata, LoopResult};
use crate::stream_event::{AgentEvent, EventSink};
use blade_config::BladeConfig;
use blade_core::error::ToolError;
use blade_core::event::{SessionLog, ToolPartState};
use blade_core::hook::{HookDecision, HookSystem};
use blade_core::message::{Message, MessageToolCall, Role, UserInput};
use blade_core::permission::PermissionMode;
use blade_core::tool::{
    ExecutionPipeline, ToolCall, ToolContext, ToolEffect, ToolMetadata, ToolResult,
};
use blade_providers::DefaultProviderFactory;
use blade_session::{JsonlSessionLog, NoopSessionLog};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

fn loop_error(kind: LoopErrorKind, message: impl Into<String>, details: Option<String>) -> LoopError {
    LoopError {
        kind,
        message: message.into(),
        details,
    }
}

fn aborted() -> LoopError {
    loop_error(LoopErrorKind::Aborted, "Operation aborted", None)
}

/// A tool call waiting to be dispatched and committed.
struct PendingCall {
    /// Assistant message carrying this one call
    message: Message,
    call: ToolCall,
    parse_error: Option<String>,
    metadata: Option<ToolMetadata>,
    part_id: String,
}

impl PendingCall {
    fn concurrency_safe(&self) -> bool {
        self.metadata.is_some_and(|m| m.concurrency_safe)
    }
}

/// Parse a model-supplied argument string. Empty means no arguments.
fn parse_arguments(raw: &str) -> Result<serde_json::Value, String> {
    if raw.trim().is_empty() {
        return Ok(serde_json::json!({}));
    }
    serde_json::from_str(raw).map_err(|e| format!("arguments are not valid JSON: {e}"))
}

/// The execution core: scheduler plus everything it coordinates.
pub struct Agent {
    model_manager: Arc<ModelManager>,
    pipeline: Arc<dyn ExecutionPipeline>,
    session_log: Arc<dyn SessionLog>,
    hooks: Option<Arc<dyn HookSystem>>,
    prompt_builder: SystemPromptBuilder,

    /// `-1` unlimited (up to the safety ceiling), `0` disabled
    max_turns: i64,
    safety_turn_limit: u32,
    auto_compact: bool,
    /// Use the delta stream when the caller listens for events
    stream: bool,
    loop_threshold: u32,
}

impl Agent {
    /// Create an agent with limits taken from the model manager's config and
    /// no session persistence.
    pub fn new(model_manager: Arc<ModelManager>, pipeline: Arc<dyn ExecutionPipeline>) -> Self {
        let config = model_manager.config();
        Self {
            max_turns: config.max_turns,
            safety_turn_limit: config.safety_turn_limit,
            auto_compact: config.compaction.auto_compact,
            stream: config.stream,
            loop_threshold: config.loop_detection.effective_threshold(),
            model_manager,
            pipeline,
            session_log: Arc::new(NoopSessionLog::default()),
            hooks: None,
            prompt_builder: SystemPromptBuilder::new(),
        }
    }

    /// Wire up real backends and a JSON-lines session log from configuration.
    pub fn from_config(config: BladeConfig, pipeline: Arc<dyn ExecutionPipeline>) -> Self {
        let session_dir = config.session_dir();
        let model_manager = Arc::new(ModelManager::new(config, Arc::new(DefaultProviderFactory)));
        Self::new(model_manager, pipeline).with_session_log(Arc::new(JsonlSessionLog::new(session_dir)))
    }

    pub fn with_session_log(mut self, log: Arc<dyn SessionLog>) -> Self {
        self.session_log = log;
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn HookSystem>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn with_prompt_builder(mut self, builder: SystemPromptBuilder) -> Self {
        self.prompt_builder = builder;
        self
    }

    pub fn with_max_turns(mut self, max_turns: i64) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn with_safety_turn_limit(mut self, limit: u32) -> Self {
        self.safety_turn_limit = limit;
        self
    }

    pub fn with_auto_compact(mut self, enabled: bool) -> Self {
        self.auto_compact = enabled;
        self
    }

    pub fn with_streaming(mut self, enabled: bool) -> Self {
        self.stream = enabled;
        self
    }

    /// Consecutive identical tool calls that count as a loop. 0 disables.
    pub fn with_loop_threshold(mut self, threshold: u32) -> Self {
        self.loop_threshold = threshold;
        self
    }

    pub fn model_manager(&self) -> &Arc<ModelManager> {
        &self.model_manager
    }

    pub fn pipeline(&self) -> &Arc<dyn ExecutionPipeline> {
        &self.pipeline
    }

    pub fn prompt_builder(&self) -> &SystemPromptBuilder {
        &self.prompt_builder
    }

    /// Blocking entry point. Routes through the Plan-mode injector when the
    /// context is in Plan mode.
    pub async fn chat(
        &self,
        input: impl Into<UserInput>,
        ctx: &mut ChatContext,
        options: LoopOptions,
    ) -> LoopResult {
        if ctx.permission_mode == PermissionMode::Plan {
            PlanModeInjector::new(self).run(input.into(), ctx, options).await
        } else {
            self.run_loop(input.into(), ctx, options).await
        }
    }

    /// Streaming entry point. Events arrive on `events` in emission order.
    pub async fn chat_stream(
        &self,
        input: impl Into<UserInput>,
        ctx: &mut ChatContext,
        options: LoopOptions,
        events: mpsc::Sender<AgentEvent>,
    ) -> LoopResult {
        if ctx.permission_mode == PermissionMode::Plan {
            PlanModeInjector::new(self)
                .run_stream(input.into(), ctx, options, events)
                .await
        } else {
            self.run_loop_stream(input.into(), ctx, options, events).await
        }
    }

    /// Run the scheduler with blocking model calls and no events.
    pub async fn run_loop(
        &self,
        input: UserInput,
        ctx: &mut ChatContext,
        options: LoopOptions,
    ) -> LoopResult {
        self.run(input, ctx, options, EventSink::none()).await
    }

    /// Run the scheduler, reporting progress on `events`.
    pub async fn run_loop_stream(
        &self,
        input: UserInput,
        ctx: &mut ChatContext,
        options: LoopOptions,
        events: mpsc::Sender<AgentEvent>,
    ) -> LoopResult {
        self.run(input, ctx, options, EventSink::new(events)).await
    }

    async fn run(
        &self,
        input: UserInput,
        ctx: &mut ChatContext,
        options: LoopOptions,
        events: EventSink,
    ) -> LoopResult {
        let started = Instant::now();
        let mut meta = LoopMetadata {
            configured_max_turns: options.max_turns.unwrap_or(self.max_turns),
            ..Default::default()
        };

        if meta.configured_max_turns == 0 {
            info!(session_id = %ctx.session_id, "Chat disabled by turn limit");
            return LoopResult::failure(
                LoopErrorKind::ChatDisabled,
                "Chat is disabled (max turns is 0)",
                None,
                meta,
            );
        }

        let cancel = link_cancellation(ctx.cancel.as_ref(), options.cancel.as_ref());
        let _cancel_guard = cancel.clone().drop_guard();
        if cancel.is_cancelled() {
            info!(session_id = %ctx.session_id, "Cancelled before start");
            return LoopResult::failure(LoopErrorKind::Aborted, "Operation aborted", None, meta);
        }

        info!(
            session_id = %ctx.session_id,
            mode = %ctx.permission_mode,
            history = ctx.messages.len(),
            "Loop started"
        );

        let recorder = SessionRecorder::new(self.session_log.clone(), ctx);
        let outcome = self
            .execute(input, ctx, &options, &events, &recorder, &cancel, &mut meta)
            .await;

        ctx.messages.retain(|m| m.role != Role::System);
        meta.duration_ms = started.elapsed().as_millis() as u64;

        let result = match outcome {
            Ok(final_message) => LoopResult::success(final_message, meta),
            Err(error) => LoopResult::failure(error.kind, error.message, error.details, meta),
        };
        recorder
            .session_updated(
                result.metadata.turns_count,
                result.metadata.tool_calls_count,
                result.metadata.tokens_used,
                result.success,
            )
            .await;

        info!(
            session_id = %ctx.session_id,
            success = result.success,
            error = result.error_kind().map(|k| k.as_str()).unwrap_or("none"),
            turns = result.metadata.turns_count,
            tool_calls = result.metadata.tool_calls_count,
            duration_ms = result.metadata.duration_ms,
            "Loop finished"
        );
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute(
        &self,
        input: UserInput,
        ctx: &mut ChatContext,
        options: &LoopOptions,
        events: &EventSink,
        recorder: &SessionRecorder,
        cancel: &CancellationToken,
        meta: &mut LoopMetadata,
    ) -> Result<String, LoopError> {
        if let Some(model_id) = options.model.as_deref() {
            self.model_manager.switch_if_needed(model_id);
        }

        // The user message hits the log before any model call
        if ctx.messages.is_empty() {
            recorder.session_created(ctx).await;
        }
        let user_message = input.into_message();
        let parent_id = ctx.messages.last().map(|m| m.id.clone());
        recorder.message(&user_message, parent_id.as_deref()).await;
        ctx.messages.push(user_message);

        let system_prompt = options
            .system_prompt
            .clone()
            .or_else(|| ctx.system_prompt.clone())
            .unwrap_or_else(|| {
                self.prompt_builder
                    .build(&ctx.workspace_root, ctx.permission_mode)
            });

        let safety = self.safety_turn_limit.max(1);
        let base_limit = if meta.configured_max_turns < 0 {
            safety
        } else {
            meta.configured_max_turns.min(safety as i64) as u32
        };
        let mut limit = base_limit;
        meta.actual_max_turns = limit;

        let auto_compact = options.auto_compact.unwrap_or(self.auto_compact);
        let streaming = events.is_streaming() && self.stream;
        let mut detector = LoopDetector::new(self.loop_threshold);
        let tool_context = ToolContext {
            session_id: ctx.session_id.clone(),
            workspace_root: ctx.workspace_root.clone(),
            permission_mode: ctx.permission_mode,
            confirmation: ctx.confirmation_handler.clone(),
            cancel: cancel.clone(),
        };

        loop {
            if cancel.is_cancelled() {
                return Err(aborted());
            }

            if meta.turns_count >= limit {
                if meta.turns_count >= safety {
                    meta.hit_safety_limit = true;
                    warn!(session_id = %ctx.session_id, safety, "Safety turn limit reached");
                    return Err(loop_error(
                        LoopErrorKind::MaxTurnsExceeded,
                        format!("Reached the safety limit of {safety} turns"),
                        None,
                    ));
                }

                let decision = match &options.on_turn_limit_reached {
                    Some(callback) => {
                        let info = TurnLimitInfo {
                            turns_count: meta.turns_count,
                            max_turns: limit,
                            tool_calls_count: meta.tool_calls_count,
                        };
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return Err(aborted()),
                            decision = callback(info) => decision,
                        }
                    }
                    None => TurnLimitDecision::stop(),
                };
                if !decision.proceed {
                    return Err(loop_error(
                        LoopErrorKind::MaxTurnsExceeded,
                        format!("Reached the maximum of {limit} turns"),
                        decision.reason,
                    ));
                }

                limit = limit.saturating_add(base_limit).min(safety);
                meta.actual_max_turns = limit;
                info!(
                    session_id = %ctx.session_id,
                    limit,
                    reason = decision.reason.as_deref().unwrap_or(""),
                    "Turn limit extended"
                );
                continue;
            }

            meta.turns_count += 1;
            let turn = meta.turns_count;
            debug!(session_id = %ctx.session_id, turn, max_turns = limit, "Turn started");
            events
                .emit(
                    AgentEvent::TurnStart {
                        turn,
                        max_turns: limit,
                    },
                    cancel,
                )
                .await;

            // Re-fetched every turn: the model may have been switched
            let engine = match self.model_manager.engine() {
                Ok(engine) => engine,
                Err(e) => {
                    events
                        .emit(
                            AgentEvent::Error {
                                message: e.to_string(),
                            },
                            cancel,
                        )
                        .await;
                    return Err(loop_error(
                        LoopErrorKind::ApiError,
                        "No usable model",
                        Some(e.to_string()),
                    ));
                }
            };
            let model_id = engine.model().id.clone();

            let tools = self.pipeline.declarations(ctx.permission_mode);
            let request = engine.build_request(&ctx.messages, Some(&system_prompt), tools);
            let response = if streaming {
                engine.aggregator().aggregate(request, cancel, events).await
            } else {
                engine.aggregator().complete(request, cancel).await
            };
            let response = match response {
                Ok(response) => response,
                Err(e) => {
                    warn!(session_id = %ctx.session_id, model = %model_id, error = %e, "Model request failed");
                    events
                        .emit(
                            AgentEvent::Error {
                                message: e.to_string(),
                            },
                            cancel,
                        )
                        .await;
                    return Err(loop_error(
                        LoopErrorKind::ApiError,
                        "Model request failed",
                        Some(e.to_string()),
                    ));
                }
            };
            if response.aborted {
                return Err(aborted());
            }
            if response.fell_back {
                debug!(session_id = %ctx.session_id, turn, "Turn served by blocking fallback");
            }

            if streaming {
                events.emit(AgentEvent::StreamEnd, cancel).await;
            }
            if let Some(reasoning) = &response.reasoning_content {
                events
                    .emit(
                        AgentEvent::Thinking {
                            content: reasoning.clone(),
                        },
                        cancel,
                    )
                    .await;
            }
            if !response.content.is_empty() {
                events
                    .emit(
                        AgentEvent::Content {
                            content: response.content.clone(),
                        },
                        cancel,
                    )
                    .await;
            }

            let (input_tokens, output_tokens) = match response.usage {
                Some(usage) => (usage.prompt_tokens as u64, usage.completion_tokens as u64),
                None => {
                    let input = engine.context_manager().count_tokens(&ctx.messages, &model_id)
                        + estimate_tokens(&system_prompt);
                    let output = estimate_tokens(&response.content)
                        + response
                            .reasoning_content
                            .as_deref()
                            .map(estimate_tokens)
                            .unwrap_or(0);
                    (input as u64, output as u64)
                }
            };
            meta.tokens_used += input_tokens + output_tokens;
            events
                .emit(
                    AgentEvent::TokenUsage {
                        input_tokens,
                        output_tokens,
                        total_tokens: input_tokens + output_tokens,
                        max_context_tokens: self.model_manager.current_model_max_context_tokens(),
                    },
                    cancel,
                )
                .await;

            if response.tool_calls.is_empty() {
                let mut message = Message::assistant(response.content.clone());
                message.reasoning_content = response.reasoning_content.clone();
                let parent_id = ctx.messages.last().map(|m| m.id.clone());
                recorder.message(&message, parent_id.as_deref()).await;
                ctx.messages.push(message);
                return Ok(response.content);
            }

            let (pending, repeated) = self.prepare_calls(
                response.tool_calls,
                response.content,
                response.reasoning_content,
                &mut detector,
            );

            if let Some(final_message) = self
                .run_tool_calls(pending, ctx, &tool_context, events, recorder, cancel, meta)
                .await?
            {
                return Ok(final_message);
            }

            if let Some(name) = repeated {
                return Err(loop_error(
                    LoopErrorKind::LoopDetected,
                    format!(
                        "Tool '{name}' was called {} times in a row with identical input",
                        detector.threshold()
                    ),
                    None,
                ));
            }

            if auto_compact {
                self.maybe_compact(ctx, events, cancel).await?;
            }
        }
    }

    /// Parse arguments, run loop detection, and build one assistant message
    /// per call. Calls from the first repeated one onwards are dropped; the
    /// repeated tool's name is returned alongside.
    fn prepare_calls(
        &self,
        calls: Vec<MessageToolCall>,
        content: String,
        reasoning: Option<String>,
        detector: &mut LoopDetector,
    ) -> (Vec<PendingCall>, Option<String>) {
        let mut pending = Vec::with_capacity(calls.len());
        let mut repeated = None;
        let mut content = Some(content);
        let mut reasoning = reasoning;

        for tool_call in calls {
            let parsed = parse_arguments(&tool_call.arguments);
            let arguments = match &parsed {
                Ok(value) => value.clone(),
                Err(_) => serde_json::Value::String(tool_call.arguments.clone()),
            };
            if detector.record(&tool_call.name, &arguments) {
                repeated = Some(tool_call.name.clone());
                break;
            }

            // Text and reasoning ride on the first message only
            let mut message =
                Message::assistant_tool_call(content.take().unwrap_or_default(), tool_call.clone());
            message.reasoning_content = reasoning.take();

            pending.push(PendingCall {
                message,
                metadata: self.pipeline.metadata(&tool_call.name),
                call: ToolCall {
                    id: tool_call.id,
                    name: tool_call.name,
                    arguments,
                },
                parse_error: parsed.err(),
                part_id: String::new(),
            });
        }
        (pending, repeated)
    }

    /// Dispatch and commit tool calls in request order. Consecutive
    /// concurrency-safe calls run together; anything else runs alone.
    ///
    /// Returns the final message when a tool ended the loop successfully.
    #[allow(clippy::too_many_arguments)]
    async fn run_tool_calls(
        &self,
        pending: Vec<PendingCall>,
        ctx: &mut ChatContext,
        tool_context: &ToolContext,
        events: &EventSink,
        recorder: &SessionRecorder,
        cancel: &CancellationToken,
        meta: &mut LoopMetadata,
    ) -> Result<Option<String>, LoopError> {
        let mut batches: Vec<Vec<PendingCall>> = Vec::new();
        for call in pending {
            match batches.last_mut() {
                Some(batch)
                    if call.concurrency_safe() && batch.iter().all(|c| c.concurrency_safe()) =>
                {
                    batch.push(call)
                }
                _ => batches.push(vec![call]),
            }
        }

        let mut parent_id = ctx.messages.last().map(|m| m.id.clone());
        let mut exit: Option<Result<String, LoopError>> = None;

        for mut batch in batches {
            if cancel.is_cancelled() {
                return Err(aborted());
            }

            for pending in batch.iter_mut() {
                recorder.message(&pending.message, parent_id.as_deref()).await;
                parent_id = Some(pending.message.id.clone());
                pending.part_id = recorder.tool_started(&pending.message.id, &pending.call).await;
                events
                    .emit(
                        AgentEvent::ToolStart {
                            tool_call: pending.call.clone(),
                            kind: pending.metadata.map(|m| m.kind),
                        },
                        cancel,
                    )
                    .await;
            }

            let dispatched = join_all(batch.iter().map(|p| self.dispatch(p, tool_context)));
            let results = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                results = dispatched => Some(results),
            };
            let Some(results) = results else {
                for pending in &batch {
                    recorder
                        .tool_finished(
                            &pending.message.id,
                            &pending.part_id,
                            &pending.call,
                            ToolPartState::Failed {
                                error: "cancelled".into(),
                            },
                        )
                        .await;
                }
                return Err(aborted());
            };

            for (pending, result) in batch.into_iter().zip(results) {
                recorder
                    .tool_finished(
                        &pending.message.id,
                        &pending.part_id,
                        &pending.call,
                        finished_state(&result),
                    )
                    .await;
                events
                    .emit(
                        AgentEvent::ToolResult {
                            tool_call: pending.call.clone(),
                            result: result.clone(),
                        },
                        cancel,
                    )
                    .await;
                ctx.messages.push(pending.message);
                ctx.messages.push(Message::tool_result(
                    pending.call.id.clone(),
                    result.llm_content.clone(),
                ));
                meta.tool_calls_count += 1;

                match result.effect {
                    Some(ToolEffect::TodoUpdate { todos }) => {
                        events.emit(AgentEvent::TodoUpdate { todos }, cancel).await;
                    }
                    Some(ToolEffect::ExitLoop {
                        approved,
                        target_mode,
                        plan_content,
                    }) if exit.is_none() => {
                        meta.should_exit_loop = true;
                        if approved {
                            info!(session_id = %ctx.session_id, target_mode = ?target_mode, "Plan approved");
                            meta.target_mode = target_mode;
                            exit = Some(Ok(plan_content
                                .clone()
                                .unwrap_or_else(|| result.llm_content.clone())));
                            meta.plan_content = plan_content;
                        } else {
                            info!(session_id = %ctx.session_id, "Plan rejected");
                            exit = Some(Err(loop_error(
                                LoopErrorKind::Canceled,
                                "Plan was not approved",
                                result.error.clone().or(Some(result.llm_content.clone())),
                            )));
                        }
                    }
                    _ => {}
                }
            }

            if exit.is_some() {
                break;
            }
        }

        exit.transpose()
    }

    async fn dispatch(&self, pending: &PendingCall, context: &ToolContext) -> ToolResult {
        if let Some(error) = &pending.parse_error {
            return ToolError::InvalidArguments(error.clone()).into();
        }

        if let Some(hooks) = &self.hooks
            && let HookDecision::Deny { reason } = hooks.pre_tool_use(&pending.call, context).await
        {
            debug!(tool = %pending.call.name, reason = %reason, "Tool call vetoed by hook");
            return ToolError::PermissionDenied {
                tool_name: pending.call.name.clone(),
                reason,
            }
            .into();
        }

        debug!(tool = %pending.call.name, call_id = %pending.call.id, "Dispatching tool call");
        let result = self
            .pipeline
            .execute(&pending.call.name, pending.call.arguments.clone(), context)
            .await;

        if let Some(hooks) = &self.hooks {
            hooks.post_tool_use(&pending.call, &result).await;
        }
        result
    }

    /// Compact the history when it is over budget for the active model.
    /// A failed compaction leaves the history as it was.
    async fn maybe_compact(
        &self,
        ctx: &mut ChatContext,
        events: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<(), LoopError> {
        let context_manager = self.model_manager.context_manager();
        let max_context_tokens = self.model_manager.current_model_max_context_tokens();
        let model_id = self.model_manager.current_model_id().unwrap_or_default();
        if !context_manager.should_compact(&ctx.messages, &model_id, max_context_tokens) {
            return Ok(());
        }

        info!(session_id = %ctx.session_id, model = %model_id, max_context_tokens, "Compacting history");
        events
            .emit(
                AgentEvent::Compacting {
                    is_compacting: true,
                },
                cancel,
            )
            .await;
        let compacted = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            compacted = context_manager.compact(&ctx.messages, &model_id) => Some(compacted),
        };
        events
            .emit(
                AgentEvent::Compacting {
                    is_compacting: false,
                },
                cancel,
            )
            .await;

        match compacted {
            None => Err(aborted()),
            Some(Ok(messages)) => {
                ctx.messages = messages;
                Ok(())
            }
            Some(Err(e)) => {
                warn!(session_id = %ctx.session_id, error = %e, "Compaction failed, keeping full history");
                Ok(())
            }
        }
    }
}
