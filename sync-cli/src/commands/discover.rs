//! Listen for device broadcasts on the LAN.

use anyhow::{Context, Result};
use std::time::Duration;

use crate::config::DataDir;

/// Run the discover command.
pub async fn run(data: &DataDir, secs: u64) -> Result<()> {
    let engine = data.open_engine().await?;
    engine
        .start_discovery()
        .await
        .context("Failed to start discovery")?;

    println!("Listening for {secs}s...");
    tokio::time::sleep(Duration::from_secs(secs)).await;

    let state = engine.state().await;
    let directory = state.directory();
    let mut count = 0;
    for device in directory.discovered_devices() {
        count += 1;
        let marker = if directory.is_paired(&device.id) { "paired" } else { "new" };
        let online = if device.is_online { "" } else { ", offline" };
        println!(
            "  {} ({}) at {} [{marker}{online}] v{}",
            device.name,
            device.id,
            device.address(),
            device.app_version
        );
    }
    if count == 0 {
        println!("No devices found.");
    }

    engine.shutdown().await.context("Failed to save sync state")?;
    Ok(())
}
