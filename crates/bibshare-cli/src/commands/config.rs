//! Config command handlers

use std::path::PathBuf;

use anyhow::{Context, Result};

use bibshare_core::Config;

use crate::output::{Output, OutputFormat};

/// Show current configuration
pub fn show(config_path: &PathBuf, output: &Output) -> Result<()> {
    let config = Config::load_from_path(config_path).context("Failed to load configuration")?;
    let conn = &config.connection;

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "data_dir": config.data_dir,
                    "log_file": config.log_file,
                    "connection": {
                        "backend": conn.backend.name(),
                        "host": conn.host,
                        "port": conn.port,
                        "database": conn.database,
                        "user": conn.user,
                        "password_set": !conn.password.is_empty(),
                        "remember_password": conn.remember_password
                    },
                    "sync": config.sync
                })
            );
        }
        OutputFormat::Quiet => {
            println!("{}", config_path.display());
        }
        OutputFormat::Human => {
            let not_set = || "(not set)".to_string();
            let sync = &config.sync;

            println!("Configuration:");
            println!("  data_dir:  {}", config.data_dir.display());
            println!(
                "  log_file:  {}",
                config
                    .log_file
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(not_set)
            );
            println!();
            println!("[connection]");
            println!("  backend:           {}", conn.backend.name());
            println!("  host:              {}", conn.host);
            println!(
                "  port:              {}",
                conn.port.map(|p| p.to_string()).unwrap_or_else(not_set)
            );
            println!("  database:          {}", conn.database);
            println!("  user:              {}", conn.user);
            println!(
                "  password:          {}",
                if conn.password.is_empty() { "(not set)" } else { "********" }
            );
            println!("  remember_password: {}", conn.remember_password);
            println!();
            println!("[sync]");
            println!("  connect_timeout_secs:       {}", sync.connect_timeout_secs);
            println!("  read_timeout_secs:          {}", sync.read_timeout_secs);
            println!("  poll_interval_ms:           {}", sync.poll_interval_ms);
            println!("  max_retries:                {}", sync.max_retries);
            println!("  initial_reconnect_delay_ms: {}", sync.initial_reconnect_delay_ms);
            println!("  max_reconnect_delay_ms:     {}", sync.max_reconnect_delay_ms);
            println!("  listen_for_changes:         {}", sync.listen_for_changes);
            println!("  push_local_changes:         {}", sync.push_local_changes);
            println!(
                "  autosave_path:              {}",
                sync.autosave_path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(not_set)
            );
            println!();
            println!("Config file: {}", config_path.display());
        }
    }

    Ok(())
}

/// Set a configuration value
pub fn set(config_path: &PathBuf, key: String, value: String, output: &Output) -> Result<()> {
    let mut config = Config::load_from_path(config_path).context("Failed to load configuration")?;
    config.set_value(&key, &value)?;
    config
        .save_to_path(config_path)
        .context("Failed to save configuration")?;

    if key == "connection.password" {
        output.success("Set connection.password");
        if !config.connection.remember_password {
            output.message(
                "Note: the password is only stored once connection.remember_password is true",
            );
        }
    } else {
        output.success(&format!("Set {} = {}", key, value));
    }

    Ok(())
}
