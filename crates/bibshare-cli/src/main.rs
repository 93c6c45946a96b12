//! bibshare CLI
//!
//! Command-line interface for inspecting and following shared
//! bibliographic databases.

use std::fs::File;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use bibshare_core::Config;

mod commands;
mod output;

use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "bibshare")]
#[command(about = "bibshare - Shared bibliographic databases on relational backends")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Use this config file instead of the default one
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check the connection and the shared schema
    Status,
    /// Load the shared database and list its entries
    Pull,
    /// Write a JSON snapshot of the shared library
    Export {
        /// Target file (defaults to <data_dir>/library.json)
        path: Option<PathBuf>,
    },
    /// Follow changes made by other sessions until interrupted
    Watch,
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (connection.host, sync.poll_interval_ms, ...)
        key: String,
        /// Configuration value
        value: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));
    let config_path = cli.config.unwrap_or_else(Config::config_file_path);

    // Config commands never touch the shared database
    let command = match cli.command {
        Commands::Config { command } => {
            return handle_config_command(command, &config_path, &output);
        }
        command => command,
    };

    let config = Config::load_from_path(&config_path).context("Failed to load configuration")?;
    init_logging(&config);
    debug!(config = ?config_path, "Configuration loaded");

    match command {
        Commands::Status => commands::status::show(&config, &output).await,
        Commands::Pull => commands::pull::pull(&config, &output).await,
        Commands::Export { path } => commands::export::export(&config, path, &output).await,
        Commands::Watch => commands::watch::watch(&config, &output).await,
        Commands::Config { .. } => unreachable!(), // Handled above
    }
}

fn handle_config_command(
    command: Option<ConfigCommands>,
    config_path: &PathBuf,
    output: &Output,
) -> Result<()> {
    match command {
        Some(ConfigCommands::Show) | None => commands::config::show(config_path, output),
        Some(ConfigCommands::Set { key, value }) => {
            commands::config::set(config_path, key, value, output)
        }
    }
}

/// Initialize logging
///
/// Level comes from BIBSHARE_LOG (default `warn`). Logs go to
/// `config.log_file` when set, stderr otherwise.
fn init_logging(config: &Config) {
    let level = std::env::var("BIBSHARE_LOG").unwrap_or_else(|_| "warn".to_string());
    let env_filter = EnvFilter::new(format!("bibshare_core={},bibshare_cli={}", level, level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false);

    let Some(log_path) = &config.log_file else {
        let _ = builder.with_writer(std::io::stderr).try_init();
        return;
    };

    match File::create(log_path) {
        Ok(file) => {
            let _ = builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init();
        }
        Err(e) => {
            eprintln!("Warning: Could not create log file {:?}: {}", log_path, e);
            let _ = builder.with_writer(std::io::stderr).try_init();
        }
    }
}
