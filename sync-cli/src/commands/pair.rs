//! Pair with a device from its QR payload and run the first sync.

use anyhow::{Context, Result};
use classsync_core::{FirstSyncChoice, FirstSyncRequest, SyncEvent};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;

use super::{describe_stats, print_report};
use crate::config::{CliEngine, DataDir};

/// Run the pair command.
///
/// With `preset` set, a first-sync prompt is answered without asking.
pub async fn run(data: &DataDir, payload: &str, preset: Option<FirstSyncChoice>) -> Result<()> {
    let engine = data.open_engine().await?;

    println!("Pairing...");
    let prompt = spawn_first_sync_prompt(&engine, preset);
    let result = engine.pair_with_qr(payload.trim()).await;
    prompt.abort();
    engine.shutdown().await.context("Failed to save sync state")?;

    let report = result.context("Pairing failed")?;
    println!();
    println!("Paired!");
    print_report(&report);

    Ok(())
}

/// Answer the first `FirstSyncRequested` event, from `preset` or stdin.
fn spawn_first_sync_prompt(engine: &CliEngine, preset: Option<FirstSyncChoice>) -> JoinHandle<()> {
    let engine = engine.clone();
    let mut events = engine.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            let SyncEvent::FirstSyncRequested(request) = event else {
                continue;
            };
            let choice = match preset {
                Some(choice) => choice,
                None => ask(&request).await,
            };
            if let Err(e) = engine.respond_first_sync(choice).await {
                tracing::warn!(error = %e, "Could not answer first sync prompt");
            }
        }
    })
}

async fn ask(request: &FirstSyncRequest) -> FirstSyncChoice {
    println!();
    println!("Both devices already hold data. Whose data should be kept?");
    println!("  This device:       {}", describe_stats(&request.local_stats));
    println!("  {:<18} {}", format!("{}:", request.peer_name), describe_stats(&request.remote_stats));
    println!();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        println!("Keep [l]ocal, take [r]emote, or [c]ancel?");
        match lines.next_line().await {
            Ok(Some(line)) => {
                if let Some(choice) = parse_choice(&line) {
                    return choice;
                }
            }
            _ => return FirstSyncChoice::Cancel,
        }
    }
}

fn parse_choice(input: &str) -> Option<FirstSyncChoice> {
    match input.trim().to_ascii_lowercase().as_str() {
        "l" | "local" => Some(FirstSyncChoice::Local),
        "r" | "remote" => Some(FirstSyncChoice::Remote),
        "c" | "cancel" => Some(FirstSyncChoice::Cancel),
        _ => None,
    }
}
