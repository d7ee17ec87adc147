//! Terminal outcome of one loop invocation.

use blade_core::permission::PermissionMode;
use serde::{Deserialize, Serialize};

/// Why a loop ended unsuccessfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopErrorKind {
    /// The caller ended the loop cooperatively (e.g. a rejected plan)
    Canceled,
    MaxTurnsExceeded,
    /// The backend failed and the blocking fallback failed too
    ApiError,
    /// The same tool call repeated too many times in a row
    LoopDetected,
    /// The cancellation signal fired
    Aborted,
    /// Turn limit configured as zero
    ChatDisabled,
}

impl LoopErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Canceled => "canceled",
            Self::MaxTurnsExceeded => "max_turns_exceeded",
            Self::ApiError => "api_error",
            Self::LoopDetected => "loop_detected",
            Self::Aborted => "aborted",
            Self::ChatDisabled => "chat_disabled",
        }
    }
}

impl std::fmt::Display for LoopErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopError {
    #[serde(rename = "type")]
    pub kind: LoopErrorKind,
    pub message: String,
    /// Underlying error text, kept verbatim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoopMetadata {
    pub turns_count: u32,
    pub tool_calls_count: u32,
    pub duration_ms: u64,
    pub tokens_used: u64,
    /// Limit as configured; `-1` means unlimited
    pub configured_max_turns: i64,
    /// Limit actually enforced, after extensions and the safety ceiling
    pub actual_max_turns: u32,
    pub hit_safety_limit: bool,
    /// The caller must leave the loop (plan approved or rejected)
    pub should_exit_loop: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_mode: Option<PermissionMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopResult {
    pub success: bool,
    pub final_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<LoopError>,
    pub metadata: LoopMetadata,
}

impl LoopResult {
    pub fn success(final_message: impl Into<String>, metadata: LoopMetadata) -> Self {
        Self {
            success: true,
            final_message: final_message.into(),
            error: None,
            metadata,
        }
    }

    pub fn failure(
        kind: LoopErrorKind,
        message: impl Into<String>,
        details: Option<String>,
        metadata: LoopMetadata,
    ) -> Self {
        Self {
            success: false,
            final_message: String::new(),
            error: Some(LoopError {
                kind,
                message: message.into(),
                details,
            }),
            metadata,
        }
    }

    /// Kind of the error, if the loop failed.
    pub fn error_kind(&self) -> Option<LoopErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}
