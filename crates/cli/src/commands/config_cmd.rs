//! `blade config`: configuration management commands.

use blade_config::BladeConfig;

pub async fn validate() -> Result<(), Box<dyn std::error::Error>> {
    println!("  Validating configuration...");

    match BladeConfig::load() {
        Ok(config) => {
            println!("   Config parsed successfully");

            let mut warnings = Vec::new();
            if config.models.is_empty() {
                warnings.push("No models configured".to_string());
            }
            for model in config.models.iter().filter(|m| m.api_key.is_none()) {
                warnings.push(format!(
                    "Model '{}' has no API key (set BLADE_API_KEY or api_key)",
                    model.id
                ));
            }
            if config.max_turns == 0 {
                warnings.push("max_turns is 0, chat is disabled".to_string());
            }

            if warnings.is_empty() {
                println!("   All checks passed");
            } else {
                println!();
                for w in &warnings {
                    println!("   warning: {w}");
                }
            }

            println!();
            println!("   Models:      {}", config.models.len());
            println!(
                "   Current:     {}",
                config.current_model_id.as_deref().unwrap_or("(first model)")
            );
            println!("   Mode:        {}", config.permission_mode);
            println!("   Max turns:   {}", config.max_turns);
            println!("   Sessions:    {}", config.session_dir().display());
        }
        Err(e) => {
            println!("   Config error: {e}");
            return Err(e.into());
        }
    }

    Ok(())
}

pub async fn show() -> Result<(), Box<dyn std::error::Error>> {
    let config = BladeConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    println!("{}", toml::to_string_pretty(&redacted(config))?);
    Ok(())
}

pub async fn path() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = BladeConfig::config_dir().join("config.toml");
    println!("{}", config_path.display());
    Ok(())
}

fn redacted(mut config: BladeConfig) -> BladeConfig {
    for model in &mut config.models {
        if model.api_key.is_some() {
            model.api_key = Some("[REDACTED]".into());
        }
    }
    config
}
