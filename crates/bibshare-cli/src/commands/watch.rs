//! Watch command handler

use anyhow::{Context, Result};
use tracing::debug;

use bibshare_core::{Config, SyncSettings};

use crate::output::Output;

/// Follow the shared database until Ctrl-C
///
/// Prints every synchronizer event as it arrives.
pub async fn watch(config: &Config, output: &Output) -> Result<()> {
    let settings = SyncSettings {
        listen_for_changes: true,
        ..config.sync_settings()
    };
    let sync = super::open(config, settings).await?;
    let mut events = sync
        .take_events()
        .context("Event stream already taken")?;

    output.message(&format!(
        "Watching {} ({} entries). Press Ctrl-C to stop.",
        config.connection_properties().display_target(),
        sync.library().len()
    ));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                debug!("Interrupted");
                break;
            }
            event = events.recv() => match event {
                Some(event) => output.print_event(&event),
                None => break,
            },
        }
    }

    sync.close_shared_database().await;
    output.success("Closed shared database");
    Ok(())
}
