//! Run sync rounds with paired devices.

use anyhow::{Context, Result};
use classsync_core::SyncEvent;
use classsync_types::DeviceId;
use std::collections::BTreeSet;
use std::time::Duration;

use super::print_report;
use crate::config::{CliEngine, DataDir};

/// Run the sync command.
///
/// With `address`, connects straight to `peer`. Otherwise listens for
/// broadcasts for up to `wait_secs` and syncs with every target found.
pub async fn run(
    data: &DataDir,
    peer: Option<DeviceId>,
    address: Option<String>,
    wait_secs: u64,
) -> Result<()> {
    let engine = data.open_engine().await?;

    let result = match (peer, address) {
        (Some(peer), Some(address)) => sync_direct(&engine, peer, &address).await,
        (peer, _) => sync_discovered(&engine, peer, Duration::from_secs(wait_secs)).await,
    };
    engine.shutdown().await.context("Failed to save sync state")?;
    result
}

async fn sync_direct(engine: &CliEngine, peer: DeviceId, address: &str) -> Result<()> {
    let report = engine
        .sync_with(peer, address)
        .await
        .with_context(|| format!("Sync with {peer} failed"))?;
    print_report(&report);
    Ok(())
}

async fn sync_discovered(engine: &CliEngine, peer: Option<DeviceId>, wait: Duration) -> Result<()> {
    let paired: BTreeSet<DeviceId> = engine
        .state()
        .await
        .directory()
        .paired_devices()
        .map(|device| device.id)
        .collect();
    let targets = match peer {
        Some(peer) if !paired.contains(&peer) => anyhow::bail!("{peer} is not paired"),
        Some(peer) => BTreeSet::from([peer]),
        None if paired.is_empty() => {
            anyhow::bail!("No paired devices. Pair first with 'classsync pair <payload>'.")
        }
        None => paired,
    };

    let mut events = engine.subscribe();
    engine
        .start_discovery()
        .await
        .context("Failed to start discovery")?;

    println!("Looking for {} device(s)...", targets.len());
    let mut found = BTreeSet::new();
    let _ = tokio::time::timeout(wait, async {
        while found.len() < targets.len() {
            match events.recv().await {
                Ok(SyncEvent::DeviceDiscovered { id, .. }) if targets.contains(&id) => {
                    found.insert(id);
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    })
    .await;

    if found.is_empty() {
        anyhow::bail!("No paired device answered within {}s", wait.as_secs());
    }

    let mut failures = 0;
    for peer in &found {
        match engine.start_sync(*peer).await {
            Ok(report) => print_report(&report),
            Err(e) => {
                failures += 1;
                println!("Sync with {peer} failed: {e}");
            }
        }
        engine.dismiss_error().await;
    }
    for peer in targets.difference(&found) {
        println!("{peer} not found on the network");
    }

    if failures > 0 {
        anyhow::bail!("{failures} sync round(s) failed");
    }
    Ok(())
}
