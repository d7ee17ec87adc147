//! Model lifecycle: resolves which model is active and owns the backend handle.
//!
//! `apply` is the only place the active backend changes. Everything else
//! re-fetches the engine through [`ModelManager::engine`] each turn, since a
//! switch may happen between turns. The [`ContextManager`] is session-scoped
//! and carried over into every rebuilt engine.

use crate::aggregator::StreamAggregator;
use crate::context::ContextManager;
use blade_config::{BladeConfig, ModelConfig};
use blade_core::message::Message;
use blade_core::provider::{ProviderRequest, ToolDefinition};
use blade_core::{Error, Result};
use blade_providers::ProviderFactory;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

/// Model id meaning "whatever the session is already using".
pub const INHERIT_MODEL: &str = "inherit";

/// Context window assumed for models that do not declare one.
pub const DEFAULT_MAX_CONTEXT_TOKENS: usize = 128_000;

const DEFAULT_TEMPERATURE: f32 = 0.7;

/// A backend handle bound to one model entry.
pub struct ExecutionEngine {
    aggregator: StreamAggregator,
    model: ModelConfig,
    thinking: bool,
    context_manager: Arc<ContextManager>,
}

impl ExecutionEngine {
    pub fn aggregator(&self) -> &StreamAggregator {
        &self.aggregator
    }

    pub fn model(&self) -> &ModelConfig {
        &self.model
    }

    pub fn thinking(&self) -> bool {
        self.thinking
    }

    pub fn context_manager(&self) -> &Arc<ContextManager> {
        &self.context_manager
    }

    pub fn max_context_tokens(&self) -> usize {
        self.model
            .max_context_tokens
            .unwrap_or(DEFAULT_MAX_CONTEXT_TOKENS)
    }

    /// Build a request. The system prompt goes first and never touches history.
    pub fn build_request(
        &self,
        history: &[Message],
        system_prompt: Option<&str>,
        tools: Vec<ToolDefinition>,
    ) -> ProviderRequest {
        let mut messages = Vec::with_capacity(history.len() + 1);
        if let Some(prompt) = system_prompt.filter(|p| !p.is_empty()) {
            messages.push(Message::system(prompt));
        }
        messages.extend_from_slice(history);

        ProviderRequest {
            model: self.model.model.clone(),
            messages,
            temperature: self.model.temperature.unwrap_or(DEFAULT_TEMPERATURE),
            max_tokens: self.model.max_output_tokens,
            tools,
            stream: false,
            thinking: self.thinking,
            stop: vec![],
        }
    }
}

struct ModelState {
    current_model_id: Option<String>,
    max_context_tokens: usize,
    engine: Option<Arc<ExecutionEngine>>,
}

/// Session-scoped owner of the active model.
pub struct ModelManager {
    config: BladeConfig,
    factory: Arc<dyn ProviderFactory>,
    context_manager: Arc<ContextManager>,
    state: RwLock<ModelState>,
}

impl ModelManager {
    pub fn new(config: BladeConfig, factory: Arc<dyn ProviderFactory>) -> Self {
        let context_manager = Arc::new(
            ContextManager::default()
                .with_threshold(config.compaction.threshold)
                .with_keep_recent(config.compaction.keep_recent),
        );
        Self {
            config,
            factory,
            context_manager,
            state: RwLock::new(ModelState {
                current_model_id: None,
                max_context_tokens: DEFAULT_MAX_CONTEXT_TOKENS,
                engine: None,
            }),
        }
    }

    /// Replace the context manager. Only meaningful before the first engine is built.
    pub fn with_context_manager(mut self, context_manager: Arc<ContextManager>) -> Self {
        self.context_manager = context_manager;
        self
    }

    pub fn config(&self) -> &BladeConfig {
        &self.config
    }

    pub fn context_manager(&self) -> &Arc<ContextManager> {
        &self.context_manager
    }

    fn read(&self) -> RwLockReadGuard<'_, ModelState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, ModelState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn current_model_id(&self) -> Option<String> {
        self.read().current_model_id.clone()
    }

    /// Context window of the model actually in use.
    pub fn current_model_max_context_tokens(&self) -> usize {
        self.read().max_context_tokens
    }

    /// Find the model entry for `requested`.
    ///
    /// `None` and `"inherit"` mean the session's current model, then the
    /// configured current model, then the first configured model.
    pub fn resolve(&self, requested: Option<&str>) -> Result<ModelConfig> {
        match requested.filter(|id| !id.is_empty() && *id != INHERIT_MODEL) {
            Some(id) => self
                .config
                .find_model(id)
                .cloned()
                .ok_or_else(|| Error::ModelNotFound(id.to_string())),
            None => {
                let session_current = self.current_model_id();
                session_current
                    .as_deref()
                    .and_then(|id| self.config.find_model(id))
                    .or_else(|| {
                        self.config
                            .current_model_id
                            .as_deref()
                            .and_then(|id| self.config.find_model(id))
                    })
                    .or_else(|| self.config.models.first())
                    .cloned()
                    .ok_or_else(|| Error::ModelNotFound(INHERIT_MODEL.to_string()))
            }
        }
    }

    /// Build a new backend for `model` and make it current.
    pub fn apply(&self, model: &ModelConfig, label: &str) -> Result<Arc<ExecutionEngine>> {
        let provider = self.factory.build(model)?;
        let thinking = model.supports_thinking && self.config.thinking_enabled;
        let engine = Arc::new(ExecutionEngine {
            aggregator: StreamAggregator::new(provider),
            model: model.clone(),
            thinking,
            context_manager: self.context_manager.clone(),
        });

        let mut state = self.write();
        state.current_model_id = Some(model.id.clone());
        state.max_context_tokens = engine.max_context_tokens();
        state.engine = Some(engine.clone());
        info!(
            model = %model.id,
            label,
            thinking,
            max_context_tokens = state.max_context_tokens,
            "Model applied"
        );
        Ok(engine)
    }

    /// Switch to `model_id` unless it is empty or already current.
    ///
    /// Best effort: an unknown id or a backend build failure is logged and
    /// the current model stays. Returns whether a switch happened.
    pub fn switch_if_needed(&self, model_id: &str) -> bool {
        if model_id.is_empty() || model_id == INHERIT_MODEL {
            return false;
        }
        if self.current_model_id().as_deref() == Some(model_id) {
            debug!(model = %model_id, "Model already current");
            return false;
        }
        let Some(model) = self.config.find_model(model_id) else {
            warn!(model = %model_id, "Requested model is not configured, keeping current");
            return false;
        };
        match self.apply(model, "switch") {
            Ok(_) => true,
            Err(e) => {
                warn!(model = %model_id, error = %e, "Model switch failed, keeping current");
                false
            }
        }
    }

    /// The active engine, built from the resolved model on first use.
    pub fn engine(&self) -> Result<Arc<ExecutionEngine>> {
        if let Some(engine) = self.read().engine.clone() {
            return Ok(engine);
        }
        let model = self.resolve(None)?;
        self.apply(&model, "init")
    }
}
