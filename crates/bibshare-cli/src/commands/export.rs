//! Export command handler

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::info;

use bibshare_core::Config;

use crate::output::Output;

/// Write a JSON snapshot of the shared library
pub async fn export(config: &Config, path: Option<PathBuf>, output: &Output) -> Result<()> {
    let path = path.unwrap_or_else(|| config.snapshot_path());

    let sync = super::open(config, super::one_shot(config)).await?;
    let library = sync.library().clone();
    sync.close_shared_database().await;

    library
        .save_snapshot(&path)
        .with_context(|| format!("Failed to write snapshot to {:?}", path))?;
    info!(path = %path.display(), entries = library.len(), "Exported snapshot");

    output.success(&format!(
        "Exported {} entries to {}",
        library.len(),
        path.display()
    ));
    Ok(())
}
