//! Envelope - the wire format wrapper for all classsync messages.

use serde::{Deserialize, Serialize};

use crate::{now_millis, DeviceId, MessageId, SyncError};

/// Protocol version carried in every envelope.
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum encoded envelope size accepted from the network (16 MiB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Message type discriminator for envelope routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Presence broadcast (unauthenticated)
    Discovery = 1,
    /// Liveness ping
    Heartbeat = 2,
    /// Client asks to pair using a scanned QR payload
    PairRequest = 3,
    /// Host accepts a pairing
    PairAccept = 4,
    /// Host rejects a pairing
    PairReject = 5,
    /// Client confirms it derived the shared secret
    PairConfirm = 6,
    /// Opens a sync round with the sender's clock
    SyncRequest = 7,
    /// Carries a delta packet
    SyncData = 8,
    /// Acknowledges a committed delta
    SyncAck = 9,
    /// Graceful end of session
    Disconnect = 10,
    /// Responder asks for a first-sync decision
    FirstSyncRequest = 11,
    /// Initiator announces whose data wins
    FirstSyncChoice = 12,
    /// Full dataset of the winning side
    FirstSyncData = 13,
    /// First sync committed
    FirstSyncAck = 14,
}

impl MessageType {
    /// Whether this message type is signed and encrypted.
    pub fn is_authenticated(&self) -> bool {
        !matches!(self, MessageType::Discovery)
    }

    /// Whether this message belongs to the pairing handshake, which is
    /// encrypted under the ephemeral pairing key instead of the shared secret.
    pub fn is_pairing(&self) -> bool {
        matches!(
            self,
            MessageType::PairRequest | MessageType::PairAccept | MessageType::PairReject
        )
    }
}

impl TryFrom<u8> for MessageType {
    type Error = SyncError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageType::Discovery),
            2 => Ok(MessageType::Heartbeat),
            3 => Ok(MessageType::PairRequest),
            4 => Ok(MessageType::PairAccept),
            5 => Ok(MessageType::PairReject),
            6 => Ok(MessageType::PairConfirm),
            7 => Ok(MessageType::SyncRequest),
            8 => Ok(MessageType::SyncData),
            9 => Ok(MessageType::SyncAck),
            10 => Ok(MessageType::Disconnect),
            11 => Ok(MessageType::FirstSyncRequest),
            12 => Ok(MessageType::FirstSyncChoice),
            13 => Ok(MessageType::FirstSyncData),
            14 => Ok(MessageType::FirstSyncAck),
            _ => Err(SyncError::InvalidMessageType(value)),
        }
    }
}

/// The envelope wraps all protocol messages with routing metadata.
///
/// `payload` is the MessagePack-encoded inner message, encrypted for every
/// type except [`MessageType::Discovery`]. `signature` is an Ed25519
/// signature over [`Envelope::signing_bytes`] by the sender's long-term key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol version (currently 1)
    pub version: u8,
    /// Unique message id
    pub id: MessageId,
    /// Message type discriminator
    pub msg_type: u8,
    /// Sender's device ID
    pub sender_id: DeviceId,
    /// Unix millis when the envelope was sealed
    pub timestamp: u64,
    /// Sender's ephemeral X25519 public key (pairing requests only)
    pub ephemeral_key: Option<[u8; 32]>,
    /// Encryption nonce (24 bytes for XChaCha20, zero when unencrypted)
    pub nonce: [u8; 24],
    /// Inner message bytes
    pub payload: Vec<u8>,
    /// Ed25519 signature (empty when unsigned)
    pub signature: Vec<u8>,
}

impl Envelope {
    /// Create a new unsigned envelope for sending.
    pub fn new(
        msg_type: MessageType,
        sender_id: DeviceId,
        nonce: [u8; 24],
        payload: Vec<u8>,
    ) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            id: MessageId::new(),
            msg_type: msg_type as u8,
            sender_id,
            timestamp: now_millis(),
            ephemeral_key: None,
            nonce,
            payload,
            signature: Vec::new(),
        }
    }

    /// Attach an ephemeral public key.
    pub fn with_ephemeral_key(mut self, key: [u8; 32]) -> Self {
        self.ephemeral_key = Some(key);
        self
    }

    /// Header bytes bound into the AEAD as associated data:
    /// `id ‖ type ‖ sender ‖ timestamp`.
    pub fn associated_data(&self) -> Vec<u8> {
        let mut aad = Vec::with_capacity(16 + 1 + 16 + 8);
        aad.extend_from_slice(self.id.as_bytes());
        aad.push(self.msg_type);
        aad.extend_from_slice(self.sender_id.as_bytes());
        aad.extend_from_slice(&self.timestamp.to_be_bytes());
        aad
    }

    /// Bytes covered by the signature: the associated data plus the
    /// ephemeral key, nonce and length-prefixed payload.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut bytes = self.associated_data();
        bytes.push(self.version);
        match &self.ephemeral_key {
            Some(key) => {
                bytes.push(1);
                bytes.extend_from_slice(key);
            }
            None => bytes.push(0),
        }
        bytes.extend_from_slice(&self.nonce);
        bytes.extend_from_slice(&(self.payload.len() as u64).to_be_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SyncError> {
        let bytes = rmp_serde::to_vec(self).map_err(SyncError::Serialization)?;
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(SyncError::MessageTooLarge {
                size: bytes.len(),
                limit: MAX_MESSAGE_SIZE,
            });
        }
        Ok(bytes)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SyncError> {
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(SyncError::MessageTooLarge {
                size: bytes.len(),
                limit: MAX_MESSAGE_SIZE,
            });
        }
        let envelope: Self = rmp_serde::from_slice(bytes).map_err(SyncError::Deserialization)?;
        if envelope.version != PROTOCOL_VERSION {
            return Err(SyncError::UnsupportedVersion(envelope.version));
        }
        Ok(envelope)
    }

    /// Get the message type as an enum.
    pub fn message_type(&self) -> Result<MessageType, SyncError> {
        MessageType::try_from(self.msg_type)
    }
}
