use crate::context::Context;
use anyhow::{bail, Result};
use colored::Colorize;
use warden_core::{PreflightReport, PreflightValidator};

fn print_report(report: &PreflightReport) {
    for check in &report.checks {
        let symbol = if check.passed {
            "✓".green()
        } else {
            "✗".red()
        };
        println!("  {} {}: {}", symbol, check.name.bold(), check.message);
    }
}

pub async fn execute(ctx: &Context, json: bool) -> Result<()> {
    let settings = ctx.settings()?;
    let config = ctx.config_store().load()?;

    let report = PreflightValidator::standard(&settings).run(&config).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("\n{}", "Preflight checks".bold());
        print_report(&report);
        println!();
    }

    if !report.passed {
        bail!("Preflight failed: {}", report.failed_names().join(", "));
    }

    if !json {
        println!("{}", "All checks passed".green().bold());
    }
    Ok(())
}
