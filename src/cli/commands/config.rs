use anyhow::{Context, Result};
use clap::Subcommand;
use std::process::Command;

use crate::cli::output::{Formatter, get_formatter};
use crate::models::{Config, OutputFormat};

const MASK: &str = "********";

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    #[command(about = "Write a configuration file with default values")]
    Init {
        #[arg(long, help = "Force overwrite existing config")]
        force: bool,
    },
    #[command(about = "Show the effective configuration (secrets masked)")]
    Show,
    #[command(about = "Show configuration and data file paths")]
    Path,
    #[command(about = "Edit configuration file")]
    Edit,
}

pub async fn handle_config(cmd: ConfigCommand, format: OutputFormat, _verbose: bool) -> Result<()> {
    let formatter = get_formatter(format);

    match cmd {
        ConfigCommand::Init { force } => handle_init(force, formatter.as_ref()),
        ConfigCommand::Show => handle_show(format),
        ConfigCommand::Path => handle_path(format),
        ConfigCommand::Edit => handle_edit(formatter.as_ref()),
    }
}

fn handle_init(force: bool, formatter: &dyn Formatter) -> Result<()> {
    let config_path =
        Config::config_path().ok_or_else(|| anyhow::anyhow!("could not determine config directory"))?;

    if config_path.exists() && !force {
        anyhow::bail!(
            "Config already exists at: {}\nUse --force to overwrite.",
            config_path.display()
        );
    }

    Config::default().save().context("failed to write config")?;
    println!(
        "{}",
        formatter.format_message(&format!("Created config at: {}", config_path.display()))
    );
    Ok(())
}

fn handle_show(format: OutputFormat) -> Result<()> {
    let config = masked(Config::load()?);

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&config)?),
        OutputFormat::Text => {
            if let Some(path) = Config::config_path() {
                println!("# {}", path.display());
            }
            print!("{}", toml::to_string_pretty(&config)?);
        }
        OutputFormat::Markdown => {
            println!("## Configuration\n");
            println!("```toml");
            print!("{}", toml::to_string_pretty(&config)?);
            println!("```");
        }
    }
    Ok(())
}

/// Replace credentials with a fixed mask so `show` output is safe to share.
fn masked(mut config: Config) -> Config {
    if config.embedding.api_key.is_some() {
        config.embedding.api_key = Some(MASK.into());
    }
    if config.generation.api_key.is_some() {
        config.generation.api_key = Some(MASK.into());
    }
    if let Some(url) = config.store.postgres.url.take() {
        config.store.postgres.url = Some(mask_url_password(&url));
    }
    config
}

fn mask_url_password(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let Some((userinfo, host)) = rest.rsplit_once('@') else {
        return url.to_string();
    };
    match userinfo.split_once(':') {
        Some((user, _)) => format!("{}://{}:{}@{}", scheme, user, MASK, host),
        None => url.to_string(),
    }
}

fn handle_path(format: OutputFormat) -> Result<()> {
    let config_path = Config::config_path();
    let config = Config::load().unwrap_or_default();
    let ledger_path = config.ledger_path();
    let snapshot_path = config.snapshot_path();

    if format == OutputFormat::Json {
        let json = serde_json::json!({
            "config": config_path,
            "ledger": ledger_path,
            "snapshot": snapshot_path,
        });
        println!("{}", serde_json::to_string_pretty(&json)?);
        return Ok(());
    }

    println!("Paths:");
    println!();
    let describe = |label: &str, path: Option<std::path::PathBuf>| match path {
        Some(p) if p.exists() => println!("{:<10} (active): {}", label, p.display()),
        Some(p) => println!("{:<10} (would be): {}", label, p.display()),
        None => println!("{:<10} unavailable", label),
    };
    describe("Config", config_path);
    describe("Ledger", ledger_path);
    describe("Snapshot", snapshot_path);

    if let Ok(cwd) = std::env::current_dir() {
        describe(".env", Some(cwd.join(".env")));
    }
    Ok(())
}

fn handle_edit(formatter: &dyn Formatter) -> Result<()> {
    let path =
        Config::config_path().ok_or_else(|| anyhow::anyhow!("could not determine config directory"))?;

    if !path.exists() {
        Config::default().save().context("failed to write config")?;
        println!(
            "{}",
            formatter.format_message(&format!("Created config at: {}", path.display()))
        );
    }

    let editor = std::env::var("EDITOR")
        .unwrap_or_else(|_| std::env::var("VISUAL").unwrap_or_else(|_| "vim".into()));

    Command::new(&editor)
        .arg(&path)
        .status()
        .context(format!("failed to open editor: {}", editor))?;

    Ok(())
}
