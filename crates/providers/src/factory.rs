//! Provider factory: builds a backend handle from a model entry.
//!
//! The model manager asks the factory for a fresh provider every time the
//! active model changes, so tests swap in their own factory to script
//! responses.

use crate::openai_compat::OpenAiCompatProvider;
use blade_config::ModelConfig;
use blade_core::error::ProviderError;
use blade_core::provider::Provider;
use std::sync::Arc;
use tracing::debug;

/// Builds provider handles from model configuration.
pub trait ProviderFactory: Send + Sync {
    fn build(&self, model: &ModelConfig) -> Result<Arc<dyn Provider>, ProviderError>;
}

/// Builds OpenAI-compatible providers for every known backend family.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultProviderFactory;

impl ProviderFactory for DefaultProviderFactory {
    fn build(&self, model: &ModelConfig) -> Result<Arc<dyn Provider>, ProviderError> {
        let base_url = match &model.base_url {
            Some(url) => url.clone(),
            None => default_base_url(&model.provider).ok_or_else(|| {
                ProviderError::NotConfigured(format!(
                    "provider '{}' has no known endpoint; set base_url for model '{}'",
                    model.provider, model.id
                ))
            })?,
        };

        let api_key = match (&model.api_key, is_local(&model.provider)) {
            (Some(key), _) => key.clone(),
            (None, true) => model.provider.clone(),
            (None, false) => {
                return Err(ProviderError::NotConfigured(format!(
                    "model '{}' has no API key",
                    model.id
                )));
            }
        };

        debug!(model = %model.id, provider = %model.provider, base_url = %base_url, "Building provider");
        Ok(Arc::new(OpenAiCompatProvider::new(
            &model.provider,
            base_url,
            api_key,
        )))
    }
}

/// Backends served from the local machine that accept any key.
fn is_local(provider_name: &str) -> bool {
    matches!(provider_name, "ollama" | "vllm" | "llamacpp" | "llama.cpp")
}

/// Get the default base URL for well-known providers.
pub fn default_base_url(provider_name: &str) -> Option<String> {
    let url = match provider_name {
        "openrouter" => "https://openrouter.ai/api/v1",
        "openai" => "https://api.openai.com/v1",
        "ollama" => "http://localhost:11434/v1",
        "deepseek" => "https://api.deepseek.com/v1",
        "groq" => "https://api.groq.com/openai/v1",
        "together" => "https://api.together.xyz/v1",
        "fireworks" => "https://api.fireworks.ai/inference/v1",
        "moonshot" => "https://api.moonshot.cn/v1",
        "dashscope" | "qwen" => "https://dashscope.aliyuncs.com/compatible-mode/v1",
        "vllm" => "http://localhost:8000/v1",
        "llamacpp" | "llama.cpp" => "http://localhost:8080/v1",
        _ => return None,
    };
    Some(url.to_string())
}
