//! Forget a paired device.

use anyhow::{Context, Result};
use classsync_types::DeviceId;

use crate::config::DataDir;

/// Run the unpair command.
pub async fn run(data: &DataDir, id: DeviceId) -> Result<()> {
    let engine = data.open_engine().await?;
    engine
        .unpair(id)
        .await
        .with_context(|| format!("Could not unpair {id}"))?;

    println!("Unpaired {id}. Pair again to resume syncing.");
    Ok(())
}
