//! Command handlers

pub mod config;
pub mod export;
pub mod pull;
pub mod status;
pub mod watch;

use anyhow::{anyhow, Context, Result};

use bibshare_core::{Config, DatabaseConnection, Library, SyncSettings, Synchronizer};

/// Connect to the configured shared database
pub async fn connect(config: &Config) -> Result<DatabaseConnection> {
    let properties = config.connection_properties();
    properties
        .validate()
        .context("Connection settings are incomplete (see `bibshare config show`)")?;

    let target = properties.display_target();
    DatabaseConnection::connect(properties, config.timeouts())
        .await
        .with_context(|| format!("Failed to connect to {}", target))
}

/// Connect and open a synchronized session on an empty library
pub async fn open(config: &Config, settings: SyncSettings) -> Result<Synchronizer> {
    let conn = connect(config).await?;
    let sync = Synchronizer::new(Library::new(), settings);

    if let Err(e) = sync.open_shared_database(conn).await {
        return Err(match e.recovery_suggestion() {
            Some(hint) => anyhow!("{}\n{}", e, hint),
            None => e.into(),
        });
    }
    Ok(sync)
}

/// Settings for one-shot commands: no listener, no automatic pushes
pub fn one_shot(config: &Config) -> SyncSettings {
    SyncSettings {
        listen_for_changes: false,
        push_local_changes: false,
        autosave_path: None,
        ..config.sync_settings()
    }
}
