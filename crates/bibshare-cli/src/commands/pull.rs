//! Pull command handler

use anyhow::Result;

use bibshare_core::Config;

use crate::output::Output;

/// Load every entry from the shared database and list it
pub async fn pull(config: &Config, output: &Output) -> Result<()> {
    let sync = super::open(config, super::one_shot(config)).await?;
    let entries = sync.library().entries();
    sync.close_shared_database().await;

    output.print_entries(&entries);
    Ok(())
}
