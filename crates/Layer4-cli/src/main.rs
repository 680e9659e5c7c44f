//! Crucible CLI - Main entry point

mod cli;
mod console;

use clap::{Parser, Subcommand};
use crucible_foundation::SandboxConfig;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Crucible - run tasks in throwaway containers
#[derive(Parser, Debug)]
#[command(name = "crucible")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Read configuration from this file instead of the global/project files
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a task file (JSON, or TOML by extension)
    Run {
        task_file: PathBuf,

        /// Print the full task report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Report whether a container engine is available
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    // Load configuration
    let config = match &args.config {
        Some(path) => SandboxConfig::load_from(path)?,
        None => SandboxConfig::load()?,
    };

    match args.command {
        Command::Run { task_file, json } => {
            let success = cli::run_task(config, &task_file, json).await?;
            if !success {
                std::process::exit(1);
            }
        }
        Command::Check => cli::check(&config).await?,
    }

    Ok(())
}
