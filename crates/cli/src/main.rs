//! Tidewire CLI: the main entry point.
//!
//! Commands:
//! - `run`     - Send one message, or chat line by line
//! - `config`  - Show the config path, the default config, or validate it

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "tidewire",
    about = "Tidewire: staged LLM request pipeline with tools and background tasks",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent against a workspace
    Run {
        /// Send a single message instead of entering interactive mode
        #[arg(short, long)]
        message: Option<String>,

        /// Workspace root (defaults to the current directory)
        #[arg(short, long, env = "TIDEWIRE_WORKSPACE")]
        workspace: Option<PathBuf>,

        /// Record file changes instead of making them
        #[arg(long)]
        dry_run: bool,

        /// Let tools touch paths outside the workspace without asking
        #[arg(long)]
        allow_outside: bool,
    },

    /// Configuration helpers
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the config file path
    Path,
    /// Print a config file with every default filled in
    Default,
    /// Load and validate the config file
    Validate,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing
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
        Commands::Run {
            message,
            workspace,
            dry_run,
            allow_outside,
        } => {
            commands::run::run(commands::run::RunOptions {
                message,
                workspace,
                dry_run,
                allow_outside,
            })
            .await?
        }
        Commands::Config { action: None } => {
            commands::config_cmd::path();
            println!();
            commands::config_cmd::show_default();
        }
        Commands::Config {
            action: Some(action),
        } => match action {
            ConfigAction::Path => commands::config_cmd::path(),
            ConfigAction::Default => commands::config_cmd::show_default(),
            ConfigAction::Validate => commands::config_cmd::validate()?,
        },
    }

    Ok(())
}
