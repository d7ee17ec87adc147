//! Blade CLI, the main entry point.
//!
//! Commands:
//! - `chat`    Interactive or single-message chat with the agent
//! - `models`  List configured models
//! - `config`  Show, locate, or validate the configuration

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(name = "blade", about = "Blade, an AI coding agent", version, author)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat with the agent
    Chat {
        /// Send a single message instead of entering interactive mode
        #[arg(short, long)]
        message: Option<String>,

        /// Model id from the config to use for this session
        #[arg(long)]
        model: Option<String>,

        /// Start in plan mode: research and propose, never act
        #[arg(long)]
        plan: bool,

        /// Turn budget per message (-1 unlimited, 0 disables chat)
        #[arg(long, allow_negative_numbers = true)]
        max_turns: Option<i64>,

        /// Wait for whole responses instead of streaming
        #[arg(long)]
        no_stream: bool,
    },

    /// List configured models
    Models,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration (keys redacted)
    Show,
    /// Print the config file path
    Path,
    /// Check the configuration for errors
    Validate,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Chat {
            message,
            model,
            plan,
            max_turns,
            no_stream,
        } => {
            commands::chat::run(commands::chat::ChatArgs {
                message,
                model,
                plan,
                max_turns,
                no_stream,
            })
            .await?
        }
        Commands::Models => commands::models::run().await?,
        Commands::Config { action } => match action.unwrap_or(ConfigAction::Show) {
            ConfigAction::Show => commands::config_cmd::show().await?,
            ConfigAction::Path => commands::config_cmd::path().await?,
            ConfigAction::Validate => commands::config_cmd::validate().await?,
        },
    }

    Ok(())
}
