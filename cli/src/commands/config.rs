use crate::context::Context;
use anyhow::{bail, Context as _, Result};
use clap::Subcommand;
use colored::Colorize;
use std::io::BufRead;
use warden_core::secrets::PASSPHRASE_ENV;
use warden_core::{PrivateKey, SecretError, SupervisorSettings};

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the agent config (key masked) and file locations
    Show,

    /// Write default agent-config.json and warden.toml
    Init {
        /// Overwrite existing files
        #[arg(short, long)]
        force: bool,
    },

    /// Store the wallet private key (reads stdin when omitted)
    SetKey {
        /// 0x-prefixed 64 hex digit key
        key: Option<String>,
    },
}

pub async fn execute(ctx: &Context, cmd: &ConfigCommands) -> Result<()> {
    match cmd {
        ConfigCommands::Show => show(ctx),
        ConfigCommands::Init { force } => init(ctx, *force),
        ConfigCommands::SetKey { key } => set_key(ctx, key.as_deref()),
    }
}

fn show(ctx: &Context) -> Result<()> {
    let store = ctx.config_store();
    let config = store.load()?;

    let mut value = serde_json::to_value(&config)?;
    value["privateKey"] = if config.private_key.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::Value::String(config.private_key.masked())
    };

    println!("{}", serde_json::to_string_pretty(&value)?);
    println!();
    println!("{} {}", "Config:".bold(), store.path().display());
    println!("{} {}", "Settings:".bold(), ctx.settings_path().display());
    println!("{} {}", "Key store:".bold(), ctx.secret_store().name());
    Ok(())
}

fn init(ctx: &Context, force: bool) -> Result<()> {
    let store = ctx.config_store();
    if store.write_defaults(force)? {
        println!("{} {}", "Wrote".green(), store.path().display());
    } else {
        println!(
            "{} {} (use --force to overwrite)",
            "Kept".yellow(),
            store.path().display()
        );
    }

    let settings_path = ctx.settings_path();
    if force || !settings_path.exists() {
        std::fs::create_dir_all(ctx.dir())?;
        std::fs::write(&settings_path, SupervisorSettings::default().to_toml()?)
            .with_context(|| format!("Failed to write {}", settings_path.display()))?;
        println!("{} {}", "Wrote".green(), settings_path.display());
    } else {
        println!(
            "{} {} (use --force to overwrite)",
            "Kept".yellow(),
            settings_path.display()
        );
    }
    Ok(())
}

fn set_key(ctx: &Context, key: Option<&str>) -> Result<()> {
    let key = match key {
        Some(key) => PrivateKey::new(key),
        None => {
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line)?;
            PrivateKey::new(line)
        }
    };

    if !key.has_valid_format() {
        bail!("Invalid private key: expected 0x followed by 64 hex digits");
    }

    let store = ctx.config_store();
    let mut config = store.load()?;
    config.private_key = key;

    match store.save(&config) {
        Ok(()) => {}
        Err(warden_core::ConfigError::Secret(SecretError::ReadOnly)) => {
            bail!("No writable key store: set {} to encrypt the key on disk", PASSPHRASE_ENV)
        }
        Err(e) => return Err(e.into()),
    }

    println!(
        "{} {} ({})",
        "Stored key".green(),
        config.private_key.masked(),
        ctx.key_path().display()
    );
    Ok(())
}
