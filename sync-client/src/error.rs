//! Error types for sync-client.

use classsync_core::{FirstSyncError, PairingError};
use classsync_types::{ConflictId, DeviceId, RejectReason, SyncError};
use std::path::PathBuf;

use crate::channel::ChannelError;
use crate::config::ConfigError;
use crate::crypto::{CryptoError, ScanError};
use crate::transport::TransportError;

/// Record store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Could not read or write the backing file.
    #[error("store I/O error at {path}: {source}")]
    Io {
        /// The file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The backing file is not a valid dataset.
    #[error("store format error at {path}: {source}")]
    Format {
        /// The file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },

    /// The store refused the write.
    #[error("store rejected write: {0}")]
    Rejected(String),
}

/// Engine state persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    /// Could not read or write the state file.
    #[error("state I/O error at {path}: {source}")]
    Io {
        /// The file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The state file is not valid JSON.
    #[error("state format error at {path}: {source}")]
    Format {
        /// The file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },
}

/// Errors surfaced by the sync engine.
///
/// Every failed operation maps onto one of these. The display text is what
/// ends up in `last_error`.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Local key material or randomness failure.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// The scanned QR payload is malformed or its checksum is wrong.
    #[error("invalid QR code: {0}")]
    QrInvalid(String),

    /// The scanned QR payload has expired.
    #[error("QR code has expired")]
    QrExpired,

    /// Unknown sender or bad signature.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// A message did not decrypt under the shared secret.
    #[error("decryption failed")]
    Decryption,

    /// The peer did not answer in time.
    #[error("network timeout")]
    NetworkTimeout,

    /// A packet failed its content hash check too many times.
    #[error("packet checksum mismatch")]
    ChecksumMismatch,

    /// The merged result could not be committed.
    #[error("commit failed: {0}")]
    CommitFailure(#[from] StoreError),

    /// The record store could not be read.
    #[error("store error: {0}")]
    Storage(StoreError),

    /// The host refused the pairing request.
    #[error("pairing rejected: {0}")]
    PairingRejected(RejectReason),

    /// The device is not paired.
    #[error("unknown peer: {0}")]
    UnknownPeer(DeviceId),

    /// No unresolved conflict has this id.
    #[error("unknown conflict: {0}")]
    UnknownConflict(ConflictId),

    /// No address is known for the peer, or it refused the connection.
    #[error("peer unreachable: {0}")]
    PeerUnreachable(String),

    /// The peer sent something out of sequence or malformed.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The user cancelled.
    #[error("cancelled")]
    Cancelled,

    /// Transport failure other than a timeout.
    #[error("transport error: {0}")]
    Transport(TransportError),

    /// Engine state could not be saved or loaded.
    #[error("persistence error: {0}")]
    Persist(#[from] PersistError),

    /// Settings could not be loaded or saved.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl EngineError {
    /// Whether retrying the connect or round may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::NetworkTimeout | EngineError::PeerUnreachable(_) => true,
            EngineError::Transport(e) => !matches!(e, TransportError::FrameTooLarge { .. }),
            _ => false,
        }
    }

    /// Whether the user should pair the devices again.
    pub fn recommends_repairing(&self) -> bool {
        matches!(
            self,
            EngineError::Authentication(_) | EngineError::Decryption | EngineError::UnknownPeer(_)
        )
    }
}

impl From<TransportError> for EngineError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Timeout => EngineError::NetworkTimeout,
            TransportError::ConnectionFailed(reason) => EngineError::PeerUnreachable(reason),
            other => EngineError::Transport(other),
        }
    }
}

impl From<ChannelError> for EngineError {
    fn from(e: ChannelError) -> Self {
        match e {
            ChannelError::Authentication(reason) => EngineError::Authentication(reason),
            ChannelError::Decryption => EngineError::Decryption,
            ChannelError::ChecksumMismatch => EngineError::ChecksumMismatch,
            ChannelError::Crypto(e) => EngineError::Crypto(e),
            ChannelError::Wire(e) => EngineError::Protocol(e.to_string()),
            ChannelError::Protocol(reason) => EngineError::Protocol(reason),
        }
    }
}

impl From<PairingError> for EngineError {
    fn from(e: PairingError) -> Self {
        match e {
            PairingError::QrInvalid(reason) => EngineError::QrInvalid(reason),
            PairingError::QrExpired => EngineError::QrExpired,
            PairingError::SessionExpired => EngineError::PairingRejected(RejectReason::Expired),
            PairingError::InvalidStatus(status) => {
                EngineError::Protocol(format!("pairing session is {status:?}"))
            }
        }
    }
}

impl From<ScanError> for EngineError {
    fn from(e: ScanError) -> Self {
        match e {
            ScanError::Cancelled => EngineError::Cancelled,
            ScanError::Failed(reason) => EngineError::QrInvalid(reason),
        }
    }
}

impl From<SyncError> for EngineError {
    fn from(e: SyncError) -> Self {
        EngineError::Protocol(e.to_string())
    }
}

impl From<FirstSyncError> for EngineError {
    fn from(e: FirstSyncError) -> Self {
        EngineError::Protocol(e.to_string())
    }
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
