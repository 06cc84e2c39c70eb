//! Settle a conflict left open by the manual strategy.

use anyhow::{Context, Result};
use classsync_core::Resolution;
use classsync_types::ConflictId;

use crate::config::DataDir;

/// Run the resolve command.
pub async fn run(data: &DataDir, id: ConflictId, resolution: Resolution) -> Result<()> {
    let engine = data.open_engine().await?;
    let conflict = engine
        .resolve_conflict(id, resolution)
        .await
        .context("Failed to resolve conflict")?;

    println!("Resolved {}", conflict.field);
    println!("It will reach {} on the next sync.", conflict.peer);
    Ok(())
}
