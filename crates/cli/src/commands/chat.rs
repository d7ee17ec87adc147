//! `blade chat`: interactive or single-message chat mode.

use async_trait::async_trait;
use blade_agent::{Agent, AgentEvent, ChatContext, ExitPlanModeTool, LoopOptions, LoopResult};
use blade_config::BladeConfig;
use blade_core::permission::{
    ConfirmationHandler, ConfirmationKind, ConfirmationRequest, ConfirmationResponse,
    PermissionMode,
};
use blade_core::tool::ToolRegistry;
use std::io::Write;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub struct ChatArgs {
    pub message: Option<String>,
    pub model: Option<String>,
    pub plan: bool,
    pub max_turns: Option<i64>,
    pub no_stream: bool,
}

pub async fn run(args: ChatArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = BladeConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;

    if config.models.is_empty() {
        eprintln!();
        eprintln!("  ERROR: No models configured!");
        eprintln!();
        eprintln!("  Add at least one model to your config file:");
        eprintln!("    {}", BladeConfig::config_dir().join("config.toml").display());
        eprintln!();
        eprintln!("    [[models]]");
        eprintln!("    id = \"gpt-4o\"");
        eprintln!("    provider = \"openai\"");
        eprintln!("    model = \"gpt-4o\"");
        eprintln!();
        eprintln!("  and set BLADE_API_KEY (or api_key in the model entry).");
        eprintln!();
        return Err("No models configured. See above for setup instructions.".into());
    }

    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(ExitPlanModeTool));

    let initial_mode = if args.plan {
        PermissionMode::Plan
    } else {
        config.permission_mode
    };
    let session_dir = config.session_dir();
    let agent = Agent::from_config(config, Arc::new(registry)).with_streaming(!args.no_stream);

    let cwd = std::env::current_dir()?;
    let session_id = uuid::Uuid::new_v4().to_string();
    let mut ctx = ChatContext::new(session_id.clone(), cwd)
        .with_permission_mode(initial_mode)
        .with_confirmation_handler(Arc::new(StdinConfirmation));

    let mut options = LoopOptions::default();
    if let Some(max_turns) = args.max_turns {
        options = options.with_max_turns(max_turns);
    }
    if let Some(model) = args.model {
        options = options.with_model(model);
    }

    if let Some(message) = args.message {
        let result = run_turn(&agent, &mut ctx, message, options).await;
        report(&result, &mut ctx);
        if !result.success {
            return Err(result
                .error
                .map(|e| e.message)
                .unwrap_or_else(|| "chat failed".into())
                .into());
        }
        return Ok(());
    }

    println!();
    println!("  Blade, interactive mode");
    println!();
    println!(
        "  Model:     {}",
        agent
            .model_manager()
            .resolve(options.model.as_deref())
            .map(|m| m.display_name().to_string())
            .unwrap_or_else(|e| format!("unavailable ({e})"))
    );
    println!("  Mode:      {}", ctx.permission_mode);
    println!("  Session:   {session_id}");
    println!("  Log:       {}", session_dir.display());
    println!();
    println!("  Type your message and press Enter.");
    println!("  Type 'exit' to quit. Ctrl+C interrupts a running answer.");
    println!();

    loop {
        print!("  You > ");
        std::io::stdout().flush()?;

        let Some(line) = read_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if matches!(line, "exit" | "quit") {
            break;
        }

        println!();
        let result = run_turn(&agent, &mut ctx, line.to_string(), options.clone()).await;
        report(&result, &mut ctx);
        println!();
    }

    println!();
    println!("  Goodbye!");
    println!();
    Ok(())
}

/// One invocation with streamed output. Ctrl+C cancels just this invocation.
async fn run_turn(
    agent: &Agent,
    ctx: &mut ChatContext,
    message: String,
    options: LoopOptions,
) -> LoopResult {
    let cancel = CancellationToken::new();
    let watcher = cancel.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            watcher.cancel();
        }
    });

    let (tx, mut rx) = mpsc::channel(256);
    let printer = async move {
        let mut renderer = Renderer::default();
        while let Some(event) = rx.recv().await {
            renderer.render(&event);
        }
    };

    let (result, ()) = tokio::join!(
        agent.chat_stream(message, ctx, options.with_cancel(cancel), tx),
        printer
    );
    ctrl_c.abort();
    result
}

fn report(result: &LoopResult, ctx: &mut ChatContext) {
    if result.success {
        if result.metadata.should_exit_loop
            && let Some(mode) = result.metadata.target_mode
        {
            ctx.permission_mode = mode;
            println!("  Plan approved. Switched to {mode} mode.");
        }
        tracing::debug!(
            turns = result.metadata.turns_count,
            tool_calls = result.metadata.tool_calls_count,
            tokens = result.metadata.tokens_used,
            duration_ms = result.metadata.duration_ms,
            "Answer complete"
        );
        return;
    }

    if let Some(error) = &result.error {
        eprintln!("  [{}] {}", error.kind, error.message);
        if let Some(details) = &error.details {
            eprintln!("          {details}");
        }
        if result.metadata.hit_safety_limit {
            eprintln!(
                "          safety ceiling of {} turns reached",
                result.metadata.actual_max_turns
            );
        }
    }
}

/// Prints loop events as they arrive.
#[derive(Default)]
struct Renderer {
    streamed_content: bool,
}

impl Renderer {
    fn render(&mut self, event: &AgentEvent) {
        match event {
            AgentEvent::TurnStart { .. } => self.streamed_content = false,
            AgentEvent::ContentDelta { delta } => {
                if !self.streamed_content {
                    print!("  Assistant > ");
                    self.streamed_content = true;
                }
                print!("{delta}");
                let _ = std::io::stdout().flush();
            }
            AgentEvent::ThinkingDelta { .. } | AgentEvent::Thinking { .. } => {}
            AgentEvent::StreamEnd => {
                if self.streamed_content {
                    println!();
                }
            }
            AgentEvent::Content { content } => {
                if !self.streamed_content {
                    for line in content.lines() {
                        println!("  Assistant > {line}");
                    }
                }
            }
            AgentEvent::ToolStart { tool_call, .. } => {
                eprintln!("  [tool] {} {}", tool_call.name, tool_call.arguments);
            }
            AgentEvent::ToolResult { tool_call, result } => {
                let status = if result.success { "ok" } else { "failed" };
                eprintln!("  [tool] {} {status}", tool_call.name);
            }
            AgentEvent::TokenUsage {
                total_tokens,
                max_context_tokens,
                ..
            } => {
                tracing::debug!(total_tokens, max_context_tokens, "Token usage");
            }
            AgentEvent::Compacting { is_compacting } => {
                if *is_compacting {
                    eprintln!("  (compacting conversation history)");
                }
            }
            AgentEvent::TodoUpdate { todos } => {
                eprintln!("  [todos]");
                if let Some(items) = todos.as_array() {
                    for item in items {
                        let text = item
                            .get("content")
                            .and_then(|c| c.as_str())
                            .or_else(|| item.as_str())
                            .unwrap_or_default();
                        eprintln!("    - {text}");
                    }
                }
            }
            AgentEvent::Error { message } => {
                if self.streamed_content {
                    println!();
                    self.streamed_content = false;
                }
                eprintln!("  [error] {message}");
            }
        }
    }
}

/// Read one line from stdin off the async runtime. `None` at end of input.
async fn read_line() -> std::io::Result<Option<String>> {
    tokio::task::spawn_blocking(|| -> std::io::Result<Option<String>> {
        let mut line = String::new();
        let read = std::io::stdin().read_line(&mut line)?;
        Ok((read > 0).then_some(line))
    })
    .await
    .map_err(std::io::Error::other)?
}

/// Asks on the terminal.
struct StdinConfirmation;

#[async_trait]
impl ConfirmationHandler for StdinConfirmation {
    async fn confirm(&self, request: ConfirmationRequest) -> ConfirmationResponse {
        match request.kind {
            ConfirmationKind::ExitPlanMode => {
                println!();
                println!("  Proposed plan:");
                for line in request.plan_content.as_deref().unwrap_or_default().lines() {
                    println!("    {line}");
                }
                println!();
                print!("  Approve? [a]uto-edit / [d]efault / [y]olo / [n]o > ");
            }
            ConfirmationKind::ToolExecution => {
                print!("  {} [y/N] > ", request.message);
            }
        }
        let _ = std::io::stdout().flush();

        let answer = match read_line().await {
            Ok(Some(line)) => line.trim().to_lowercase(),
            _ => String::new(),
        };
        parse_answer(&request.kind, &answer)
    }
}

fn parse_answer(kind: &ConfirmationKind, answer: &str) -> ConfirmationResponse {
    let approve_into = |mode| ConfirmationResponse {
        approved: true,
        target_mode: Some(mode),
        reason: None,
    };
    match (kind, answer) {
        (ConfirmationKind::ExitPlanMode, "a" | "auto-edit" | "y" | "yes") => {
            approve_into(PermissionMode::AutoEdit)
        }
        (ConfirmationKind::ExitPlanMode, "d" | "default") => approve_into(PermissionMode::Default),
        (ConfirmationKind::ExitPlanMode, "yolo") => approve_into(PermissionMode::Yolo),
        (ConfirmationKind::ToolExecution, "y" | "yes") => ConfirmationResponse::approve(),
        _ => ConfirmationResponse::reject("rejected by user"),
    }
}
