//! # sync-types
//!
//! Wire format and dataset types for the classsync LAN sync protocol.
//!
//! This crate provides the foundational types used across all classsync crates:
//! - [`DeviceId`], [`SessionId`], [`MessageId`], [`ConflictId`] - Identity types
//! - [`VectorClock`], [`Dot`] - Causal ordering
//! - [`Dataset`], [`Record`], [`FieldValue`] - The synced classroom records
//! - [`Envelope`] - Signed, encrypted message wrapper
//! - [`Message`] - Protocol messages (pairing, sync, first sync, discovery)
//! - [`SyncError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod clock;
mod dataset;
mod envelope;
mod error;
mod ids;
mod messages;

pub use clock::{ClockOrdering, Dot, VectorClock};
pub use dataset::{Collection, DataStats, Dataset, FieldValue, Record, RecordKey};
pub use envelope::{Envelope, MessageType, MAX_MESSAGE_SIZE, PROTOCOL_VERSION};
pub use error::SyncError;
pub use ids::{now_millis, ConflictId, DeviceId, MessageId, SessionId};
pub use messages::{
    AckResult, DeviceIdentity, DiscoveryAnnouncement, Disconnect, FirstSyncAck,
    FirstSyncDecision, FirstSyncStats, Heartbeat, Message, PairAccept, PairConfirm, PairReject,
    PairRequest, RejectReason, SyncAck, SyncData, SyncPacket, SyncRequest,
};
