//! Run the agent in the foreground until interrupted or it fails.

use crate::context::Context;
use anyhow::{bail, Result};
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use warden_core::{
    AgentStatus, CommandOutcome, LogEntry, LogLevel, RuntimeBridge, Supervisor, SupervisorEvent,
};

/// Prints supervisor events to the terminal.
struct ConsoleBridge {
    json: bool,
}

impl ConsoleBridge {
    fn print_log(entry: &LogEntry) {
        let level = match entry.level {
            LogLevel::Debug => entry.level.as_str().dimmed(),
            LogLevel::Info => entry.level.as_str().green(),
            LogLevel::Warning => entry.level.as_str().yellow(),
            LogLevel::Error => entry.level.as_str().red(),
        };
        println!(
            "{} {} {}",
            entry.timestamp.format("%H:%M:%S").to_string().dimmed(),
            level,
            entry.message
        );
    }
}

impl RuntimeBridge for ConsoleBridge {
    /// Bundled agent binaries ship next to the `warden` executable.
    fn resource_dir(&self) -> Option<PathBuf> {
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.to_path_buf()))
    }

    fn emit(&self, event: &SupervisorEvent) {
        if self.json {
            match serde_json::to_string(event) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!("Failed to serialize event: {}", e),
            }
            return;
        }

        match event {
            SupervisorEvent::Log(entry) => Self::print_log(entry),
            SupervisorEvent::Status { status } => {
                let label = match status {
                    AgentStatus::Running => status.to_string().green().bold(),
                    AgentStatus::Error => status.to_string().red().bold(),
                    _ => status.to_string().cyan().bold(),
                };
                println!("{} {}", "●".cyan(), label);
            }
            SupervisorEvent::LoadingProgress(progress) => {
                println!(
                    "{} {:?} {:.0}%",
                    "…".dimmed(),
                    progress.phase,
                    progress.percent
                );
            }
        }
    }
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to install CTRL+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received CTRL+C signal");
        },
        () = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}

pub async fn execute(ctx: &Context, json: bool) -> Result<()> {
    let settings = ctx.settings()?;
    let config = ctx.config_store().load()?;

    if !json {
        println!(
            "{}",
            format!(
                "Starting {} (model {}, port {})",
                settings.binary_name, config.model_file, config.http_port
            )
            .green()
            .bold()
        );
    }

    let supervisor = Supervisor::builder(settings)
        .bridge(Arc::new(ConsoleBridge { json }))
        .build();

    match supervisor.start(config).await? {
        CommandOutcome::Accepted => {}
        CommandOutcome::Ignored => bail!("Agent is already starting"),
    }

    let mut status = supervisor.subscribe_status();
    let failed = tokio::select! {
        () = shutdown_signal() => false,
        _ = status.wait_for(|s| *s == AgentStatus::Error) => true,
    };

    if failed {
        bail!("Agent stopped unexpectedly");
    }

    if !json {
        println!("{}", "Stopping agent...".yellow());
    }
    supervisor.stop().await?;
    Ok(())
}
