//! List paired devices.

use anyhow::Result;

use super::format_timestamp;
use crate::config::DataDir;

/// Run the devices command.
pub async fn run(data: &DataDir) -> Result<()> {
    let state = data.load_state().await?;

    if state.paired.is_empty() {
        println!("No paired devices.");
        return Ok(());
    }

    println!("Paired devices:");
    for device in &state.paired {
        let last_sync = device
            .last_sync_at
            .map(format_timestamp)
            .unwrap_or_else(|| "never".to_string());
        println!("  {} ({})", device.name, device.id);
        println!("    Paired:    {}", format_timestamp(device.paired_at));
        println!("    Last sync: {last_sync}");
    }

    Ok(())
}
