//! Configuration loading, validation, and management for Blade.
//!
//! Loads configuration from `~/.blade/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use blade_core::permission::PermissionMode;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.blade/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BladeConfig {
    /// Every model the session may switch between
    #[serde(default)]
    pub models: Vec<ModelConfig>,

    /// Id of the model used when a caller does not ask for one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_model_id: Option<String>,

    /// Turn limit per invocation. `-1` means unlimited up to the safety
    /// ceiling, `0` disables chat entirely.
    #[serde(default = "default_max_turns")]
    pub max_turns: i64,

    /// Hard ceiling that applies even when `max_turns` is unlimited
    #[serde(default = "default_safety_turn_limit")]
    pub safety_turn_limit: u32,

    /// User preference for reasoning output; only honored by models that support it
    #[serde(default)]
    pub thinking_enabled: bool,

    #[serde(default = "default_true")]
    pub stream: bool,

    #[serde(default)]
    pub permission_mode: PermissionMode,

    #[serde(default)]
    pub compaction: CompactionConfig,

    #[serde(default)]
    pub loop_detection: LoopDetectionConfig,

    #[serde(default)]
    pub session: SessionConfig,
}

fn default_max_turns() -> i64 {
    -1
}
fn default_safety_turn_limit() -> u32 {
    100
}
fn default_true() -> bool {
    true
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

/// One model backend the agent can talk to.
#[derive(Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Stable id used for lookups and switching
    pub id: String,

    /// Display name
    #[serde(default)]
    pub name: String,

    /// Backend family (e.g., "openai", "deepseek", "ollama")
    #[serde(default = "default_provider")]
    pub provider: String,

    /// Model string sent on the wire
    pub model: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Context window ceiling in tokens
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_context_tokens: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Whether the backend can emit a reasoning channel
    #[serde(default)]
    pub supports_thinking: bool,
}

fn default_provider() -> String {
    "openai".into()
}

impl std::fmt::Debug for ModelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelConfig")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("api_key", &redact(&self.api_key))
            .field("base_url", &self.base_url)
            .field("max_context_tokens", &self.max_context_tokens)
            .field("max_output_tokens", &self.max_output_tokens)
            .field("temperature", &self.temperature)
            .field("supports_thinking", &self.supports_thinking)
            .finish()
    }
}

impl ModelConfig {
    /// Name to show a human, falling back to the id.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    #[serde(default = "default_true")]
    pub auto_compact: bool,

    /// Fraction of the context window that triggers compaction
    #[serde(default = "default_compaction_threshold")]
    pub threshold: f32,

    /// Messages kept verbatim after compaction
    #[serde(default = "default_keep_recent")]
    pub keep_recent: usize,
}

fn default_compaction_threshold() -> f32 {
    0.8
}
fn default_keep_recent() -> usize {
    6
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            auto_compact: true,
            threshold: default_compaction_threshold(),
            keep_recent: default_keep_recent(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopDetectionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Consecutive identical tool calls that count as a loop (0 disables)
    #[serde(default = "default_loop_threshold")]
    pub threshold: u32,
}

fn default_loop_threshold() -> u32 {
    5
}

impl Default for LoopDetectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: default_loop_threshold(),
        }
    }
}

impl LoopDetectionConfig {
    /// Threshold actually in force; 0 when detection is off.
    pub fn effective_threshold(&self) -> u32 {
        if self.enabled { self.threshold } else { 0 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Directory for JSON-lines session logs. Defaults to `~/.blade/sessions`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

impl BladeConfig {
    /// Load configuration from the default path (~/.blade/config.toml).
    ///
    /// Environment overrides, applied after the file:
    /// - `BLADE_API_KEY` fills the key of every model that has none
    /// - `BLADE_MODEL` selects the current model
    /// - `BLADE_BASE_URL` replaces every model's base URL
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup (the process environment in `load`).
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup("BLADE_API_KEY") {
            for model in self.models.iter_mut().filter(|m| m.api_key.is_none()) {
                model.api_key = Some(key.clone());
            }
        }

        if let Some(model) = lookup("BLADE_MODEL") {
            self.current_model_id = Some(model);
        }

        if let Some(url) = lookup("BLADE_BASE_URL") {
            for model in &mut self.models {
                model.base_url = Some(url.clone());
            }
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".blade")
    }

    /// Directory the JSON-lines session log writes to.
    pub fn session_dir(&self) -> PathBuf {
        self.session
            .dir
            .clone()
            .unwrap_or_else(|| Self::config_dir().join("sessions"))
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for model in &self.models {
            if model.id.is_empty() {
                return Err(ConfigError::ValidationError(
                    "model id must not be empty".into(),
                ));
            }
            if !seen.insert(model.id.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate model id '{}'",
                    model.id
                )));
            }
            if let Some(t) = model.temperature
                && !(0.0..=2.0).contains(&t)
            {
                return Err(ConfigError::ValidationError(format!(
                    "temperature for model '{}' must be between 0.0 and 2.0",
                    model.id
                )));
            }
        }

        if let Some(current) = &self.current_model_id
            && self.find_model(current).is_none()
        {
            return Err(ConfigError::ValidationError(format!(
                "current_model_id '{current}' does not match any configured model"
            )));
        }

        let threshold = self.compaction.threshold;
        if threshold <= 0.0 || threshold > 1.0 {
            return Err(ConfigError::ValidationError(
                "compaction.threshold must be in (0.0, 1.0]".into(),
            ));
        }

        Ok(())
    }

    /// Look up a model by id.
    pub fn find_model(&self, id: &str) -> Option<&ModelConfig> {
        self.models.iter().find(|m| m.id == id)
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for BladeConfig {
    fn default() -> Self {
        Self {
            models: vec![],
            current_model_id: None,
            max_turns: default_max_turns(),
            safety_turn_limit: default_safety_turn_limit(),
            thinking_enabled: false,
            stream: true,
            permission_mode: PermissionMode::Default,
            compaction: CompactionConfig::default(),
            loop_detection: LoopDetectionConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
