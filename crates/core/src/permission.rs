//! Permission modes and the confirmation seam.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// How much freedom the agent has to act.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionMode {
    /// Read-only tools run freely, everything else asks first (default)
    #[default]
    Default,
    /// Read-only and file-editing tools run freely, execution asks first
    AutoEdit,
    /// Everything runs without asking
    Yolo,
    /// Propose a plan for approval, never act
    Plan,
}

impl PermissionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::AutoEdit => "auto_edit",
            Self::Yolo => "yolo",
            Self::Plan => "plan",
        }
    }
}

impl std::fmt::Display for PermissionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PermissionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(Self::Default),
            "auto_edit" | "autoEdit" => Ok(Self::AutoEdit),
            "yolo" => Ok(Self::Yolo),
            "plan" => Ok(Self::Plan),
            other => Err(format!("unknown permission mode '{other}'")),
        }
    }
}

/// What the user is being asked to confirm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationKind {
    /// Run a tool that needs approval under the current mode
    ToolExecution,
    /// Leave plan mode and carry out the proposed plan
    ExitPlanMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationRequest {
    pub kind: ConfirmationKind,
    pub tool_name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_content: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfirmationResponse {
    pub approved: bool,
    /// Mode to switch to after an approved plan
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_mode: Option<PermissionMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ConfirmationResponse {
    pub fn approve() -> Self {
        Self {
            approved: true,
            ..Default::default()
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            target_mode: None,
            reason: Some(reason.into()),
        }
    }
}

/// Asks a human (or a policy standing in for one) to approve an action.
#[async_trait]
pub trait ConfirmationHandler: Send + Sync {
    async fn confirm(&self, request: ConfirmationRequest) -> ConfirmationResponse;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_round_trips_through_strings() {
        for mode in [
            PermissionMode::Default,
            PermissionMode::AutoEdit,
            PermissionMode::Yolo,
            PermissionMode::Plan,
        ] {
            assert_eq!(mode.as_str().parse::<PermissionMode>().unwrap(), mode);
        }
        assert!("sudo".parse::<PermissionMode>().is_err());
    }

    #[test]
    fn mode_serializes_snake_case() {
        let json = serde_json::to_string(&PermissionMode::AutoEdit).unwrap();
        assert_eq!(json, r#""auto_edit""#);
    }

    #[test]
    fn reject_carries_reason() {
        let response = ConfirmationResponse::reject("not now");
        assert!(!response.approved);
        assert_eq!(response.reason.as_deref(), Some("not now"));
    }
}
