/// Warden CLI - supervise a local inference agent
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod context;

use commands::{config, preflight, start, status};
use context::Context;

#[derive(Parser)]
#[command(name = "warden")]
#[command(about = "Sidecar supervisor for a local inference agent", long_about = None)]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Config directory (defaults to the platform config dir, e.g. ~/.config/warden)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override log level
    #[arg(long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run preflight, start the agent and stream its logs until Ctrl-C
    Start {
        /// Print events as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Run the preflight checks without starting anything
    Preflight {
        /// Output the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Query a running agent's health and metrics
    Status {
        /// Agent HTTP port (defaults to the configured port)
        #[arg(short, long)]
        port: Option<u16>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Manage the agent config and wallet key
    #[command(subcommand)]
    Config(config::ConfigCommands),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing with custom level if provided
    let log_level = args.log_level.as_deref().unwrap_or("info");
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let ctx = Context::resolve(args.config.as_deref())?;

    match args.command {
        Commands::Start { json } => {
            start::execute(&ctx, json).await?;
        }

        Commands::Preflight { json } => {
            preflight::execute(&ctx, json).await?;
        }

        Commands::Status { port, json } => {
            status::execute(&ctx, port, json).await?;
        }

        Commands::Config(cmd) => {
            config::execute(&ctx, &cmd).await?;
        }
    }

    Ok(())
}
