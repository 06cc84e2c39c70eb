//! Initialize device identity.

use anyhow::{Context, Result};
use classsync_client::CryptoIdentity;

use crate::config::DataDir;

/// Run the init command.
pub async fn run(data: &DataDir, name: &str) -> Result<()> {
    if data.is_initialized() {
        anyhow::bail!(
            "Device already initialized. Delete {} to reinitialize.",
            data.identity_path().display()
        );
    }

    let identity = CryptoIdentity::load_or_generate(data.identity_path(), name)
        .await
        .context("Failed to create device identity")?;
    if !data.settings_path().exists() {
        data.save_settings(&data.settings()?).await?;
    }

    println!("Device initialized successfully!");
    println!();
    println!("  Device ID: {}", identity.device_id());
    println!("  Name:      {}", identity.identity().name);
    println!("  Data dir:  {}", data.root().display());
    println!();
    println!("Next steps:");
    println!("  1. On the device that already has data: classsync serve --qr");
    println!("  2. Here: classsync pair '<payload>'");

    Ok(())
}
