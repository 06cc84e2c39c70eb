//! # sync-core
//!
//! Pure logic for classsync (no I/O, instant tests).
//!
//! This crate implements the state machines and algorithms for LAN sync
//! without any network or disk I/O, enabling fast unit tests.
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input and produce output
//! without side effects:
//! - [`pairing`] validates QR payloads and drives a pairing session's status
//! - [`directory`] tracks paired and discovered devices
//! - [`state`] holds the engine's status machine and aggregate state
//! - [`reconcile`] classifies remote fields and resolves conflicts
//! - [`first_sync`] decides and tracks the "whose data wins" prompt
//!
//! The actual I/O (sockets, crypto, disk) is performed by `sync-client`,
//! which interprets the actions produced here.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod directory;
pub mod first_sync;
pub mod pairing;
pub mod reconcile;
pub mod state;

pub use directory::{DeviceDirectory, DiscoveredDevice, HeartbeatLossPolicy, PairedDevice};
pub use first_sync::{needs_first_sync, FirstSyncChoice, FirstSyncError, FirstSyncRequest, FirstSyncState};
pub use pairing::{
    app_versions_compatible, pairing_context, PairingError, PairingSession, PairingSessions,
    PairingStatus, QrCodeData, SecretBytes, SharedSecret, DEFAULT_PAIRING_TTL,
};
pub use reconcile::{
    classify, delta_for, reconcile, Conflict, ConflictStrategy, FieldOutcome, FieldRef,
    FieldTypeMergePolicy, FieldUpdate, MergePlan, MergePolicy, MergedDelta, ReconcileInput,
    Resolution,
};
pub use state::{calculate_backoff, Action, Event, P2PSyncState, Role, SyncEvent, SyncStatus};
