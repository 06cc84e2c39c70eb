//! Protocol messages for classsync.
//!
//! These are the inner payloads that get encrypted before being wrapped
//! in an [`Envelope`](crate::Envelope). Only [`Message::Discovery`] travels
//! in the clear.

use serde::{Deserialize, Serialize};

use crate::dataset::content_hash;
use crate::{now_millis, DataStats, DeviceId, SessionId, SyncError, VectorClock, PROTOCOL_VERSION};

pub use crate::envelope::MessageType;

/// All possible protocol messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Presence broadcast
    Discovery(DiscoveryAnnouncement),
    /// Liveness ping
    Heartbeat(Heartbeat),
    /// Client pairing request
    PairRequest(PairRequest),
    /// Host accepts the pairing
    PairAccept(PairAccept),
    /// Host rejects the pairing
    PairReject(PairReject),
    /// Client acknowledges the accept
    PairConfirm(PairConfirm),
    /// Opens a sync round
    SyncRequest(SyncRequest),
    /// Delta transfer
    SyncData(SyncData),
    /// Delta committed (or needs retransmit)
    SyncAck(SyncAck),
    /// Graceful end of session
    Disconnect(Disconnect),
    /// Responder detected a first sync and reports its side
    FirstSyncRequest(FirstSyncStats),
    /// Initiator's decision
    FirstSyncChoice(FirstSyncDecision),
    /// Winning side's full dataset
    FirstSyncData(SyncData),
    /// Replacement committed
    FirstSyncAck(FirstSyncAck),
}

impl Message {
    /// Envelope discriminator for this message.
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Discovery(_) => MessageType::Discovery,
            Message::Heartbeat(_) => MessageType::Heartbeat,
            Message::PairRequest(_) => MessageType::PairRequest,
            Message::PairAccept(_) => MessageType::PairAccept,
            Message::PairReject(_) => MessageType::PairReject,
            Message::PairConfirm(_) => MessageType::PairConfirm,
            Message::SyncRequest(_) => MessageType::SyncRequest,
            Message::SyncData(_) => MessageType::SyncData,
            Message::SyncAck(_) => MessageType::SyncAck,
            Message::Disconnect(_) => MessageType::Disconnect,
            Message::FirstSyncRequest(_) => MessageType::FirstSyncRequest,
            Message::FirstSyncChoice(_) => MessageType::FirstSyncChoice,
            Message::FirstSyncData(_) => MessageType::FirstSyncData,
            Message::FirstSyncAck(_) => MessageType::FirstSyncAck,
        }
    }

    /// Short name used in logs and protocol errors.
    pub fn name(&self) -> &'static str {
        match self {
            Message::Discovery(_) => "discovery",
            Message::Heartbeat(_) => "heartbeat",
            Message::PairRequest(_) => "pair_request",
            Message::PairAccept(_) => "pair_accept",
            Message::PairReject(_) => "pair_reject",
            Message::PairConfirm(_) => "pair_confirm",
            Message::SyncRequest(_) => "sync_request",
            Message::SyncData(_) => "sync_data",
            Message::SyncAck(_) => "sync_ack",
            Message::Disconnect(_) => "disconnect",
            Message::FirstSyncRequest(_) => "first_sync_request",
            Message::FirstSyncChoice(_) => "first_sync_choice",
            Message::FirstSyncData(_) => "first_sync_data",
            Message::FirstSyncAck(_) => "first_sync_ack",
        }
    }

    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SyncError> {
        rmp_serde::to_vec_named(self).map_err(SyncError::Serialization)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SyncError> {
        rmp_serde::from_slice(bytes).map_err(SyncError::Deserialization)
    }
}

/// Public identity of a device: id, display name and Ed25519 verifying key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Stable device id
    pub id: DeviceId,
    /// Human-readable device name
    pub name: String,
    /// Ed25519 verifying key
    pub public_key: [u8; 32],
}

/// Periodic presence broadcast. Carries only public identity fields;
/// the sender's address is taken from the datagram source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryAnnouncement {
    /// Announcing device
    pub identity: DeviceIdentity,
    /// TCP port the device accepts sessions on
    pub port: u16,
    /// Application version string
    pub app_version: String,
}

/// Liveness ping, also sent while a user decision is pending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Sender's wall clock (Unix millis)
    pub timestamp: u64,
}

impl Heartbeat {
    /// Heartbeat stamped with the current time.
    pub fn now() -> Self {
        Self {
            timestamp: now_millis(),
        }
    }
}

/// Sent by the scanning device after validating a QR payload.
///
/// The ephemeral public key travels in the envelope header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairRequest {
    /// Requesting device's long-term identity
    pub identity: DeviceIdentity,
    /// Session id copied from the QR payload
    pub session_id: SessionId,
    /// Requesting device's application version
    pub app_version: String,
    /// Checksum copied from the QR payload
    pub checksum: String,
}

/// Host's positive answer to a [`PairRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairAccept {
    /// Host's long-term identity
    pub identity: DeviceIdentity,
}

/// Why a pairing request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// The pairing session passed its expiry
    Expired,
    /// QR checksum did not match the session
    ChecksumMismatch,
    /// Incompatible application version
    VersionMismatch,
    /// No pending session with that id
    UnknownSession,
    /// Host is busy with another session
    Busy,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            RejectReason::Expired => "pairing session expired",
            RejectReason::ChecksumMismatch => "checksum mismatch",
            RejectReason::VersionMismatch => "incompatible app version",
            RejectReason::UnknownSession => "unknown pairing session",
            RejectReason::Busy => "host busy",
        };
        f.write_str(text)
    }
}

/// Host's negative answer to a [`PairRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairReject {
    /// Host's long-term identity, used to verify the envelope signature
    pub identity: DeviceIdentity,
    /// Rejection cause
    pub reason: RejectReason,
}

/// Client acknowledgement of [`PairAccept`], encrypted under the newly
/// derived shared secret so the host knows both sides agree on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairConfirm {
    /// Session being confirmed
    pub session_id: SessionId,
}

/// First message of a sync round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    /// Initiator's current clock
    pub vector_clock: VectorClock,
    /// Initiator's dataset summary
    pub stats: DataStats,
    /// Whether the initiator has a recorded baseline with the responder
    pub baseline_known: bool,
}

/// Encrypted dataset delta plus integrity data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPacket {
    /// Protocol version
    pub version: u8,
    /// Author of the packet
    pub device_id: DeviceId,
    /// Creation time (Unix millis)
    pub timestamp: u64,
    /// BLAKE3 hex digest of the plaintext dataset bytes
    pub data_hash: String,
    /// nonce ‖ ciphertext of the dataset
    pub encrypted_data: Vec<u8>,
    /// Author's clock at the time of sending
    pub vector_clock: VectorClock,
}

impl SyncPacket {
    /// Build a packet for `plaintext` that has already been sealed into
    /// `encrypted_data`.
    pub fn new(
        device_id: DeviceId,
        vector_clock: VectorClock,
        plaintext: &[u8],
        encrypted_data: Vec<u8>,
    ) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            device_id,
            timestamp: now_millis(),
            data_hash: Self::digest(plaintext),
            encrypted_data,
            vector_clock,
        }
    }

    /// Content digest used for `data_hash`.
    pub fn digest(plaintext: &[u8]) -> String {
        content_hash(plaintext)
    }

    /// Whether decrypted bytes match the advertised hash.
    pub fn hash_matches(&self, plaintext: &[u8]) -> bool {
        Self::digest(plaintext) == self.data_hash
    }
}

/// Carries one [`SyncPacket`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncData {
    /// The packet
    pub packet: SyncPacket,
}

/// Outcome reported in a [`SyncAck`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckResult {
    /// Responder committed; carries its merged clock
    Committed {
        /// Responder's clock after commit
        vector_clock: VectorClock,
    },
    /// The packet failed its hash check; send it again
    Retransmit,
}

/// Acknowledges the initiator's delta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncAck {
    /// Result
    pub result: AckResult,
}

/// Graceful end of session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disconnect {
    /// Optional human-readable reason
    pub reason: Option<String>,
}

impl Disconnect {
    /// Disconnect with a reason.
    pub fn because(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
        }
    }
}

/// Responder's side of a first-sync prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirstSyncStats {
    /// Responder's dataset summary
    pub stats: DataStats,
    /// Responder's clock
    pub vector_clock: VectorClock,
}

/// Which device's dataset becomes authoritative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirstSyncDecision {
    /// Winning device
    pub winner: DeviceId,
}

/// Replacement committed on the losing side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirstSyncAck {
    /// Loser's clock after the replacement
    pub vector_clock: VectorClock,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Collection;
    use std::collections::BTreeMap;

    fn identity() -> DeviceIdentity {
        DeviceIdentity {
            id: DeviceId::random(),
            name: "Classroom iPad".into(),
            public_key: [3u8; 32],
        }
    }

    fn roundtrip(msg: &Message) -> Message {
        let bytes = msg.to_bytes().unwrap();
        Message::from_bytes(&bytes).unwrap()
    }

    #[test]
    fn pair_request_roundtrip() {
        let msg = Message::PairRequest(PairRequest {
            identity: identity(),
            session_id: SessionId::random(),
            app_version: "2.1.0".into(),
            checksum: "0123456789abcdef".into(),
        });
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn sync_request_roundtrip() {
        let dev = DeviceId::random();
        let mut counts = BTreeMap::new();
        counts.insert(Collection::Classes, 3);
        let msg = Message::SyncRequest(SyncRequest {
            vector_clock: VectorClock::from_entries([(dev, 4)]),
            stats: DataStats {
                record_counts: counts,
                total_records: 3,
                latest_modification: Some(1_700_000_000_000),
            },
            baseline_known: true,
        });
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn sync_ack_variants_roundtrip() {
        let committed = Message::SyncAck(SyncAck {
            result: AckResult::Committed {
                vector_clock: VectorClock::from_entries([(DeviceId::random(), 1)]),
            },
        });
        let retransmit = Message::SyncAck(SyncAck {
            result: AckResult::Retransmit,
        });
        assert_eq!(roundtrip(&committed), committed);
        assert_eq!(roundtrip(&retransmit), retransmit);
    }

    #[test]
    fn first_sync_messages_roundtrip() {
        let dev = DeviceId::random();
        let packet = SyncPacket::new(dev, VectorClock::new(), b"plain", vec![1, 2, 3]);
        let msgs = [
            Message::FirstSyncRequest(FirstSyncStats {
                stats: DataStats::default(),
                vector_clock: VectorClock::from_entries([(dev, 2)]),
            }),
            Message::FirstSyncChoice(FirstSyncDecision { winner: dev }),
            Message::FirstSyncData(SyncData { packet }),
            Message::FirstSyncAck(FirstSyncAck {
                vector_clock: VectorClock::new(),
            }),
        ];
        for msg in &msgs {
            assert_eq!(&roundtrip(msg), msg);
        }
    }

    #[test]
    fn message_type_matches_variant() {
        assert_eq!(
            Message::Heartbeat(Heartbeat::now()).message_type(),
            MessageType::Heartbeat
        );
        assert_eq!(
            Message::Disconnect(Disconnect::default()).message_type(),
            MessageType::Disconnect
        );
        assert_eq!(
            Message::PairReject(PairReject {
                identity: DeviceIdentity {
                    id: DeviceId::random(),
                    name: "Host".into(),
                    public_key: [7; 32],
                },
                reason: RejectReason::Expired
            })
            .message_type(),
            MessageType::PairReject
        );
        assert_eq!(
            Message::PairConfirm(PairConfirm {
                session_id: SessionId::random()
            })
            .name(),
            "pair_confirm"
        );
    }

    #[test]
    fn packet_hash_detects_tampering() {
        let packet = SyncPacket::new(DeviceId::random(), VectorClock::new(), b"dataset", vec![]);
        assert!(packet.hash_matches(b"dataset"));
        assert!(!packet.hash_matches(b"datasex"));
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        assert!(Message::from_bytes(&[0xFF, 0x00, 0x13]).is_err());
    }

    #[test]
    fn reject_reason_display() {
        assert_eq!(RejectReason::Expired.to_string(), "pairing session expired");
    }
}
