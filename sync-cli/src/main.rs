//! # classsync
//!
//! Command-line front end for classsync LAN peer-to-peer sync.
//!
//! ## Commands
//!
//! - `init`: Create the device identity and default settings
//! - `serve`: Announce this device, accept pairing and sync connections
//! - `pair`: Pair with a device from its QR payload, then run the first sync
//! - `sync`: Run a sync round with a paired device
//! - `edit`: Write one field of a local record
//! - `resolve`: Settle a conflict left open by the manual strategy
//! - `devices`, `discover`, `unpair`, `status`
//!
//! ## Example
//!
//! ```bash
//! # Teacher laptop: initialize and wait for a tablet, printing a QR payload
//! classsync init --name "Room 12 laptop"
//! classsync serve --qr
//!
//! # Tablet: pair using the payload shown by the laptop
//! classsync pair eyJzZXNzaW9uX2lkIjoi...
//!
//! # Later, sync again
//! classsync sync
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use classsync_core::{FirstSyncChoice, Resolution};
use classsync_types::{Collection, ConflictId, DeviceId};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;

use commands::{devices, discover, edit, init, pair, resolve, serve, status, sync, unpair};
use config::DataDir;

/// Pair and sync classroom data between devices on the same network.
#[derive(Parser, Debug)]
#[command(name = "classsync")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Data directory for the device identity, settings and sync state
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Verbose logging (RUST_LOG takes precedence)
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the device identity
    Init {
        /// Device name shown to other devices
        #[arg(long, short)]
        name: String,
    },

    /// Announce this device and accept incoming sessions until Ctrl-C
    Serve {
        /// Print a pairing QR payload on startup
        #[arg(long)]
        qr: bool,

        /// LAN address to put in the QR payload (detected if omitted)
        #[arg(long)]
        ip: Option<String>,
    },

    /// Pair with the device that displayed `payload`
    Pair {
        /// QR payload text
        payload: String,

        /// Answer the first-sync prompt without asking
        #[arg(long, value_enum)]
        first_sync: Option<ChoiceArg>,
    },

    /// Sync with a paired device
    Sync {
        /// Peer to sync with (defaults to every paired device found)
        #[arg(long)]
        peer: Option<DeviceId>,

        /// Connect to this address instead of waiting for discovery
        #[arg(long, requires = "peer")]
        address: Option<String>,

        /// Seconds to wait for discovery broadcasts
        #[arg(long, default_value = "5")]
        wait: u64,
    },

    /// Write a field of a local record
    Edit {
        /// Collection holding the record
        #[arg(value_enum)]
        collection: CollectionArg,

        /// Record id
        id: String,

        /// Field name
        field: String,

        /// New value as JSON (plain text is stored as a string)
        value: String,
    },

    /// Settle an open conflict
    Resolve {
        /// Conflict id as shown by `status`
        id: ConflictId,

        /// Which value to keep
        #[arg(long, value_enum, conflicts_with = "value")]
        keep: Option<KeepArg>,

        /// Custom value as JSON
        #[arg(long)]
        value: Option<String>,
    },

    /// List paired devices
    Devices,

    /// Listen for device broadcasts
    Discover {
        /// Seconds to listen
        #[arg(long, default_value = "5")]
        secs: u64,
    },

    /// Forget a paired device
    Unpair {
        /// Device id
        id: DeviceId,
    },

    /// Show identity, settings and sync state
    Status,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum ChoiceArg {
    /// Keep this device's data
    Local,
    /// Take the peer's data
    Remote,
    /// Abort without changes
    Cancel,
}

impl From<ChoiceArg> for FirstSyncChoice {
    fn from(arg: ChoiceArg) -> Self {
        match arg {
            ChoiceArg::Local => FirstSyncChoice::Local,
            ChoiceArg::Remote => FirstSyncChoice::Remote,
            ChoiceArg::Cancel => FirstSyncChoice::Cancel,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum CollectionArg {
    Classes,
    Students,
    Participations,
    Homework,
}

impl From<CollectionArg> for Collection {
    fn from(arg: CollectionArg) -> Self {
        match arg {
            CollectionArg::Classes => Collection::Classes,
            CollectionArg::Students => Collection::Students,
            CollectionArg::Participations => Collection::Participations,
            CollectionArg::Homework => Collection::Homework,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum KeepArg {
    Local,
    Remote,
    Merged,
}

fn resolution(keep: Option<KeepArg>, value: Option<String>) -> Result<Resolution> {
    match (keep, value) {
        (Some(KeepArg::Local), None) => Ok(Resolution::KeepLocal),
        (Some(KeepArg::Remote), None) => Ok(Resolution::TakeRemote),
        (Some(KeepArg::Merged), None) => Ok(Resolution::Merged),
        (None, Some(value)) => Ok(Resolution::Custom(edit::parse_value(&value))),
        _ => anyhow::bail!("Specify either --keep or --value"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => default_data_dir()?,
    };
    let data = DataDir::new(data_dir);
    data.ensure().await?;

    match cli.command {
        Commands::Init { name } => init::run(&data, &name).await?,
        Commands::Serve { qr, ip } => serve::run(&data, qr, ip).await?,
        Commands::Pair {
            payload,
            first_sync,
        } => pair::run(&data, &payload, first_sync.map(Into::into)).await?,
        Commands::Sync {
            peer,
            address,
            wait,
        } => sync::run(&data, peer, address, wait).await?,
        Commands::Edit {
            collection,
            id,
            field,
            value,
        } => edit::run(&data, collection.into(), &id, &field, &value).await?,
        Commands::Resolve { id, keep, value } => {
            resolve::run(&data, id, resolution(keep, value)?).await?
        }
        Commands::Devices => devices::run(&data).await?,
        Commands::Discover { secs } => discover::run(&data, secs).await?,
        Commands::Unpair { id } => unpair::run(&data, id).await?,
        Commands::Status => status::run(&data).await?,
    }

    Ok(())
}

/// Get the default data directory for classsync.
fn default_data_dir() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("io", "classsync", "classsync")
        .context("Could not determine home directory")?;
    Ok(dirs.data_dir().to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_pair_with_first_sync_answer() {
        let cli = Cli::parse_from(["classsync", "pair", "{}", "--first-sync", "remote"]);
        match cli.command {
            Commands::Pair { first_sync, .. } => assert_eq!(first_sync, Some(ChoiceArg::Remote)),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn address_requires_peer() {
        assert!(Cli::try_parse_from(["classsync", "sync", "--address", "10.0.0.2:47801"]).is_err());
    }

    #[test]
    fn resolution_from_flags() {
        assert_eq!(resolution(Some(KeepArg::Local), None).unwrap(), Resolution::KeepLocal);
        assert_eq!(
            resolution(None, Some("\"Math B\"".into())).unwrap(),
            Resolution::Custom(serde_json::json!("Math B"))
        );
        assert!(resolution(None, None).is_err());
    }
}
