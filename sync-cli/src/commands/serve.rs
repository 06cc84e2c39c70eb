//! Serve command: announce this device and accept pairing and sync sessions.

use anyhow::{Context, Result};
use classsync_client::TransportListener;
use tokio::sync::broadcast::error::RecvError;

use super::{print_event, print_report};
use crate::config::{CliEngine, DataDir};

/// Run the serve command until Ctrl+C.
pub async fn run(data: &DataDir, show_qr: bool, ip: Option<String>) -> Result<()> {
    let engine = data.open_engine().await?;
    let settings = engine.settings().clone();

    println!("Starting classsync...");
    println!();

    let listener = TransportListener::bind(&format!("0.0.0.0:{}", settings.sync_port))
        .await
        .context("Failed to bind sync port")?;
    engine
        .start_discovery()
        .await
        .context("Failed to start discovery")?;

    let local = engine.local_identity();
    println!("Ready!");
    println!();
    println!("  Device:    {} ({})", local.name, local.id);
    println!("  Sync port: {}", settings.sync_port);
    println!("  Discovery: UDP {}", settings.discovery_port);
    println!();

    if show_qr {
        let ip = match ip {
            Some(ip) => ip,
            None => lan_address()?,
        };
        let qr = engine
            .create_pairing_qr(&ip)
            .await
            .context("Failed to create pairing QR code")?;
        println!("Pairing payload (valid for {}s):", settings.pairing_ttl_secs);
        println!();
        println!("  {}", qr.payload);
        println!();
        println!("On the other device:");
        println!("  classsync pair '{}'", qr.payload);
        println!();
    }

    println!("Press Ctrl+C to stop.");
    println!();
    println!("--- Activity ---");

    let mut events = engine.subscribe();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(transport) => {
                    tracing::debug!(peer = %transport.peer_addr(), "Accepted connection");
                    spawn_session(&engine, transport);
                }
                Err(e) => tracing::warn!(error = %e, "Accept failed"),
            },
            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Event listener lagged");
                }
                Err(RecvError::Closed) => break,
            },
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl+C")?;
                break;
            }
        }
    }

    println!();
    println!("Shutting down...");
    engine.cancel().await;
    engine.shutdown().await.context("Failed to save sync state")?;
    println!("Done.");

    Ok(())
}

fn spawn_session(engine: &CliEngine, transport: classsync_client::TcpTransport) {
    let engine = engine.clone();
    tokio::spawn(async move {
        match engine.handle_incoming(Box::new(transport)).await {
            Ok(Some(report)) => print_report(&report),
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "Incoming session failed"),
        }
    });
}

/// First non-loopback IPv4 address of this machine.
fn lan_address() -> Result<String> {
    let ip = local_ip_address::local_ip().context("Could not detect LAN address; pass --ip")?;
    Ok(ip.to_string())
}
