//! `blade models`: list configured models.

use blade_agent::DEFAULT_MAX_CONTEXT_TOKENS;
use blade_config::{BladeConfig, ModelConfig};

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = BladeConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;

    if config.models.is_empty() {
        println!("  No models configured.");
        println!(
            "  Add [[models]] entries to {}",
            BladeConfig::config_dir().join("config.toml").display()
        );
        return Ok(());
    }

    let current = config
        .current_model_id
        .as_deref()
        .or_else(|| config.models.first().map(|m| m.id.as_str()));

    println!("  Configured models");
    println!();
    for model in &config.models {
        println!("{}", describe(model, current == Some(model.id.as_str())));
    }
    println!();
    println!(
        "  Thinking:  {}",
        if config.thinking_enabled { "on" } else { "off" }
    );
    Ok(())
}

fn describe(model: &ModelConfig, current: bool) -> String {
    let marker = if current { "*" } else { " " };
    let context = model
        .max_context_tokens
        .unwrap_or(DEFAULT_MAX_CONTEXT_TOKENS);
    let mut line = format!(
        "  {marker} {:<20} {:<10} {:<28} ctx {context}",
        model.id, model.provider, model.model
    );
    if model.supports_thinking {
        line.push_str("  thinking");
    }
    if model.api_key.is_none() {
        line.push_str("  (no api key)");
    }
    line
}
