//! System prompt construction.
//!
//! The prompt is rebuilt for every invocation so it always reflects the
//! current mode, date, and branch. Sections, in order:
//!
//! 1. **Base instructions** (built in or supplied)
//! 2. **Environment** (platform, working directory, date, git branch)
//! 3. **Project instructions** (`BLADE.md` in the workspace root)
//! 4. **Mode rules** (Plan mode only)
//!
//! Each section is wrapped in an XML-like tag. Missing project files are
//! skipped.

use blade_core::event::detect_git_branch;
use blade_core::permission::PermissionMode;
use std::path::Path;
use tracing::debug;

pub const PROJECT_INSTRUCTIONS_FILE: &str = "BLADE.md";

const DEFAULT_INSTRUCTIONS: &str = concat!(
    "You are Blade, an AI coding agent working inside the user's project. ",
    "Use the available tools to inspect and change the workspace when that helps. ",
    "Prefer small, verifiable steps and report what you did. ",
    "Be concise and accurate.",
);

const PLAN_MODE_RULES: &str = concat!(
    "You are in plan mode. Only read-only tools are available. ",
    "Investigate the codebase, then write a concrete, step-by-step implementation plan. ",
    "Do not modify files or run commands that change state. ",
    "When the plan is ready, call the exit_plan_mode tool with the full plan so the user can approve it.",
);

#[derive(Debug, Clone)]
pub struct SystemPromptBuilder {
    base_instructions: String,
    project_file: String,
}

impl Default for SystemPromptBuilder {
    fn default() -> Self {
        Self {
            base_instructions: DEFAULT_INSTRUCTIONS.to_string(),
            project_file: PROJECT_INSTRUCTIONS_FILE.to_string(),
        }
    }
}

impl SystemPromptBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.base_instructions = instructions.into();
        self
    }

    pub fn with_project_file(mut self, file_name: impl Into<String>) -> Self {
        self.project_file = file_name.into();
        self
    }

    /// Assemble the prompt for `workspace_root` in `mode`.
    pub fn build(&self, workspace_root: &Path, mode: PermissionMode) -> String {
        let mut sections = vec![self.base_instructions.trim().to_string()];
        sections.push(wrap("environment", &environment(workspace_root)));

        let project_path = workspace_root.join(&self.project_file);
        if let Some(content) = std::fs::read_to_string(&project_path)
            .ok()
            .filter(|c| !c.trim().is_empty())
        {
            debug!(file = %project_path.display(), "Loaded project instructions");
            sections.push(wrap("project_instructions", content.trim()));
        }

        if mode == PermissionMode::Plan {
            sections.push(wrap("plan_mode", PLAN_MODE_RULES));
        }

        sections.join("\n\n")
    }
}

fn environment(workspace_root: &Path) -> String {
    let mut lines = vec![
        format!("Platform: {}", std::env::consts::OS),
        format!("Working directory: {}", workspace_root.display()),
        format!("Date: {}", chrono::Local::now().format("%Y-%m-%d")),
    ];
    if let Some(branch) = detect_git_branch(workspace_root) {
        lines.push(format!("Git branch: {branch}"));
    }
    lines.join("\n")
}

fn wrap(tag: &str, body: &str) -> String {
    format!("<{tag}>\n{body}\n</{tag}>")
}
