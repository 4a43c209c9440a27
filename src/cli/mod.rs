mod drain;
mod serve;

use anyhow::{Result, bail};
use console::style;
use std::path::PathBuf;

use crate::core::config::AnalysisConfig;
use crate::core::terminal::{self, GuideSection};

const DEFAULT_CONFIG_FILE: &str = "data/analysisd.toml";

fn print_help() {
    terminal::print_banner();

    GuideSection::new("Commands")
        .command("serve", "Run the HTTP API and the background analysis runner")
        .command("drain", "Process the queue once in the foreground and exit")
        .command("help", "Show this help")
        .print();

    GuideSection::new("Flags")
        .command("--host <HOST>", "Address to bind the API to (serve)")
        .command("--port <PORT>", "Port to bind the API to (serve)")
        .command("--db <PATH>", "SQLite database file")
        .command("--config <FILE>", "TOML config file (default data/analysisd.toml)")
        .print();

    println!(
        "\n {} {} <command> [flags]\n",
        style("Usage:").bold(),
        style("analysisd").green()
    );
}

/// Flags shared by the commands. Unset flags leave the config untouched.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct CommandFlags {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub db: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

pub(crate) fn parse_command_flags(args: &[String], start: usize) -> Result<CommandFlags> {
    let mut flags = CommandFlags::default();
    let mut i = start;
    while i < args.len() {
        let flag = args[i].as_str();
        let Some(value) = args.get(i + 1) else {
            bail!("missing value for {}", flag);
        };
        match flag {
            "--host" => flags.host = Some(value.clone()),
            "--port" => match value.parse() {
                Ok(port) => flags.port = Some(port),
                Err(_) => bail!("invalid port '{}'", value),
            },
            "--db" => flags.db = Some(PathBuf::from(value)),
            "--config" => flags.config = Some(PathBuf::from(value)),
            other => bail!("unknown flag '{}'", other),
        }
        i += 2;
    }
    Ok(flags)
}

/// File, then environment, then flags.
pub(crate) async fn load_config(flags: &CommandFlags) -> Result<AnalysisConfig> {
    let path = flags
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    let mut config = AnalysisConfig::load(Some(&path)).await?;
    if let Some(host) = &flags.host {
        config.host = host.clone();
    }
    if let Some(port) = flags.port {
        config.port = port;
    }
    if let Some(db) = &flags.db {
        config.db_path = db.clone();
    }
    Ok(config)
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let cmd = args.get(1).map(String::as_str).unwrap_or("help");

    match cmd {
        "serve" => {
            let flags = parse_command_flags(&args, 2)?;
            serve::run_serve(load_config(&flags).await?).await
        }
        "drain" => {
            let flags = parse_command_flags(&args, 2)?;
            drain::run_drain(load_config(&flags).await?).await
        }
        "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        other => {
            terminal::print_error(&format!("Unknown command '{}'", other));
            print_help();
            Ok(())
        }
    }
}
