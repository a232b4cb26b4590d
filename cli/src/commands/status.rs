use crate::context::Context;
use anyhow::Result;
use colored::Colorize;
use warden_core::{HealthProbe, HttpHealthProbe};

/// One-shot health and metrics query against a running agent.
pub async fn execute(ctx: &Context, port: Option<u16>, json: bool) -> Result<()> {
    let settings = ctx.settings()?;
    let port = match port {
        Some(port) => port,
        None => ctx.config_store().load()?.http_port,
    };

    let base_url = format!("http://{}:{}", settings.host, port);
    let probe = HttpHealthProbe::new(&base_url, settings.poll_request_timeout());

    let health = probe.health().await;
    let metrics = match &health {
        Ok(_) => probe.metrics().await.ok(),
        Err(_) => None,
    };

    if json {
        let value = serde_json::json!({
            "url": base_url,
            "reachable": health.is_ok(),
            "health": health.as_ref().ok(),
            "metrics": metrics,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("\n{} {}", "Agent".bold(), base_url.cyan());
    match health {
        Ok(health) => {
            let status = if health.is_ready() {
                health.status.green()
            } else {
                health.status.yellow()
            };
            println!("  Status:  {}", status);
            if let Some(model) = &health.model {
                println!("  Model:   {}", model);
            }
            if let Some(progress) = health.loading_progress() {
                println!("  Loading: {:.0}%", progress.percent);
            }
            if let Some(uptime) = health.uptime {
                println!("  Uptime:  {}s", uptime);
            }
        }
        Err(e) => {
            println!("  Status:  {} ({})", "unreachable".red(), e);
        }
    }

    if let Some(metrics) = metrics {
        println!("\n{}", "Metrics".bold());
        println!("  Tokens processed:  {}", metrics.total_tokens_processed);
        println!("  Prompt tokens:     {}", metrics.prompt_tokens);
        println!("  Tokens/second:     {:.1}", metrics.tokens_per_second);
        println!("  Active requests:   {}", metrics.requests_processing);
        if metrics.total_requests > 0 {
            println!("  Requests:          {}", metrics.total_requests);
            println!("  Avg latency:       {:.0} ms", metrics.avg_latency_ms);
        }
    }
    println!();

    Ok(())
}
