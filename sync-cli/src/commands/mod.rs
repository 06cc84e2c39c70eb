//! CLI command implementations.

pub mod devices;
pub mod discover;
pub mod edit;
pub mod init;
pub mod pair;
pub mod resolve;
pub mod serve;
pub mod status;
pub mod sync;
pub mod unpair;

use classsync_client::SyncReport;
use classsync_core::{FirstSyncChoice, SyncEvent};
use classsync_types::{now_millis, DataStats};

/// Print one engine event as an activity line.
pub fn print_event(event: &SyncEvent) {
    match event {
        SyncEvent::StatusChanged { status } => println!("  status: {status:?}"),
        SyncEvent::DeviceDiscovered { id, name } => println!("  found {name} ({id})"),
        SyncEvent::DeviceOffline { id } => println!("  offline {id}"),
        SyncEvent::Paired { peer, name } => println!("  paired with {name} ({peer})"),
        SyncEvent::Unpaired { peer } => println!("  unpaired {peer}"),
        SyncEvent::FirstSyncRequested(request) => {
            println!("  first sync with {} requested", request.peer_name)
        }
        SyncEvent::ConflictsDetected { peer, unresolved } => {
            println!("  {unresolved} conflict(s) with {peer} need a choice")
        }
        SyncEvent::SyncCompleted {
            peer,
            applied,
            conflicts,
        } => println!("  synced with {peer}: {applied} applied, {conflicts} conflict(s)"),
        SyncEvent::Failed { error } => println!("  failed: {error}"),
    }
}

/// Print the outcome of a pairing or sync session.
pub fn print_report(report: &SyncReport) {
    println!("Synced with {}", report.peer);
    match report.first_sync {
        Some(FirstSyncChoice::Local) => println!("  First sync: kept this device's data"),
        Some(FirstSyncChoice::Remote) => {
            println!("  First sync: adopted {} record(s) from the peer", report.applied)
        }
        Some(FirstSyncChoice::Cancel) => println!("  First sync: cancelled"),
        None => {
            println!("  Applied:   {} field write(s)", report.applied);
            println!("  Conflicts: {}", report.conflicts);
        }
    }
}

/// One-line summary of a dataset.
pub fn describe_stats(stats: &DataStats) -> String {
    if stats.is_empty() {
        return "no records".to_string();
    }
    let counts = stats
        .record_counts
        .iter()
        .map(|(collection, count)| format!("{count} {collection}"))
        .collect::<Vec<_>>()
        .join(", ");
    match stats.latest_modification {
        Some(at) => format!("{counts} (last change {})", format_timestamp(at)),
        None => counts,
    }
}

/// Format a Unix millisecond timestamp relative to now.
pub fn format_timestamp(ts_millis: u64) -> String {
    let diff = now_millis().saturating_sub(ts_millis) / 1000;

    if diff < 60 {
        "just now".to_string()
    } else if diff < 3600 {
        format!("{} minutes ago", diff / 60)
    } else if diff < 86400 {
        format!("{} hours ago", diff / 3600)
    } else {
        format!("{} days ago", diff / 86400)
    }
}
