//! Device pairing sessions and QR payloads for classsync.
//!
//! This module provides:
//! - [`QrCodeData`] creation, checksumming and base64url-JSON encoding
//! - Client-side QR consumption with expiry checks ([`QrCodeData::consume`])
//! - The host-side [`PairingSession`] status machine
//!   (`pending → connected → completed | failed | expired`)
//!
//! The pairing flow:
//! 1. Host creates a session with a fresh ephemeral X25519 key pair
//! 2. The QR payload is displayed; the client scans and validates it
//! 3. Client sends `pair_request`; host checks session, checksum and version
//! 4. Both sides derive the shared secret; client confirms; host completes
//!
//! Key agreement itself happens in `sync-client`. This module only holds
//! the raw key bytes and decides what is allowed.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use classsync_types::{DeviceId, DeviceIdentity, PairRequest, RejectReason, SessionId};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::time::Duration;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Default pairing session TTL (5 minutes).
pub const DEFAULT_PAIRING_TTL: Duration = Duration::from_secs(300);

/// Length of the QR checksum in hex characters.
const CHECKSUM_LEN: usize = 16;

/// Errors for pairing operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PairingError {
    /// The QR payload could not be decoded or its checksum is wrong.
    #[error("invalid QR payload: {0}")]
    QrInvalid(String),

    /// The QR payload is past its expiry.
    #[error("QR code has expired")]
    QrExpired,

    /// The pairing session is past its expiry.
    #[error("pairing session expired")]
    SessionExpired,

    /// The session is not in the status the operation requires.
    #[error("pairing session is {0:?}")]
    InvalidStatus(PairingStatus),
}

/// 32 bytes of secret key material.
///
/// Zeroized on drop, redacted in `Debug`, hex-encoded when serialized.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SecretBytes([u8; 32]);

/// Symmetric secret derived once per pairing and reused for every sync.
pub type SharedSecret = SecretBytes;

impl SecretBytes {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

// Intentionally opaque debug to avoid logging secrets
impl std::fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretBytes([REDACTED])")
    }
}

impl Serialize for SecretBytes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for SecretBytes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(text.as_bytes(), &mut bytes).map_err(serde::de::Error::custom)?;
        Ok(Self(bytes))
    }
}

/// Whether two app versions can pair: the major components must match.
pub fn app_versions_compatible(ours: &str, theirs: &str) -> bool {
    fn major(version: &str) -> Option<&str> {
        version.trim().split('.').next().filter(|m| !m.is_empty())
    }
    match (major(ours), major(theirs)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// HKDF info string binding a shared secret to one pairing.
///
/// Device ids are sorted so both sides produce identical bytes.
pub fn pairing_context(session_id: &SessionId, a: &DeviceId, b: &DeviceId) -> Vec<u8> {
    let (first, second) = if a <= b { (a, b) } else { (b, a) };
    let mut info = Vec::with_capacity(17 + 48);
    info.extend_from_slice(b"classsync-pair-v1");
    info.extend_from_slice(session_id.as_bytes());
    info.extend_from_slice(first.as_bytes());
    info.extend_from_slice(second.as_bytes());
    info
}

/// Contents of a pairing QR code.
///
/// A point-in-time capability token: possessing it is the proof of
/// physical proximity that authorizes pairing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QrCodeData {
    /// Pairing session id.
    pub session_id: SessionId,
    /// Host address reachable from the scanning device.
    pub ip_address: String,
    /// Host TCP port.
    pub port: u16,
    /// Expiry (Unix millis).
    pub expires_at: u64,
    /// Host's ephemeral X25519 public key.
    pub public_key: [u8; 32],
    /// Host application version.
    pub app_version: String,
    /// Host device id.
    pub device_id: DeviceId,
    /// Host device name.
    pub device_name: String,
    /// First 16 hex chars of SHA-256 over the other fields.
    pub checksum: String,
}

impl QrCodeData {
    /// Compute the checksum over the canonical field concatenation.
    pub fn compute_checksum(&self) -> String {
        let canonical = format!(
            "{}|{}|{}|{}|{}|{}|{}|{}",
            self.session_id,
            self.ip_address,
            self.port,
            self.expires_at,
            hex::encode(self.public_key),
            self.app_version,
            self.device_id,
            self.device_name,
        );
        let digest = Sha256::digest(canonical.as_bytes());
        let mut hex = hex::encode(digest);
        hex.truncate(CHECKSUM_LEN);
        hex
    }

    /// Whether the stored checksum matches the fields.
    pub fn checksum_valid(&self) -> bool {
        self.checksum == self.compute_checksum()
    }

    /// Whether the payload is expired at `now` (Unix millis).
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    /// `ip:port` to connect to.
    pub fn address(&self) -> String {
        if self.ip_address.contains(':') {
            format!("[{}]:{}", self.ip_address, self.port)
        } else {
            format!("{}:{}", self.ip_address, self.port)
        }
    }

    /// Encode as base64url (no padding) of the JSON representation.
    pub fn to_qr_payload(&self) -> Result<String, PairingError> {
        let json = serde_json::to_vec(self)
            .map_err(|e| PairingError::QrInvalid(format!("json encode: {}", e)))?;
        Ok(URL_SAFE_NO_PAD.encode(json))
    }

    /// Decode and checksum-verify a scanned payload. Expiry is not checked.
    pub fn from_qr_payload(payload: &str) -> Result<Self, PairingError> {
        let json_bytes = URL_SAFE_NO_PAD
            .decode(payload.trim())
            .map_err(|e| PairingError::QrInvalid(format!("base64 decode: {}", e)))?;

        let data: Self = serde_json::from_slice(&json_bytes)
            .map_err(|e| PairingError::QrInvalid(format!("json parse: {}", e)))?;

        if !data.checksum_valid() {
            return Err(PairingError::QrInvalid("checksum mismatch".into()));
        }

        Ok(data)
    }

    /// Client-side consumption: decode, verify the checksum, and reject
    /// payloads whose `expires_at` is not after `now`.
    pub fn consume(payload: &str, now: u64) -> Result<Self, PairingError> {
        let data = Self::from_qr_payload(payload)?;
        if data.is_expired(now) {
            return Err(PairingError::QrExpired);
        }
        Ok(data)
    }
}

/// Status of a pairing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingStatus {
    /// Waiting for a `pair_request`.
    Pending,
    /// Request accepted, waiting for the client's confirmation.
    Connected,
    /// Pairing finished successfully.
    Completed,
    /// Rejected or aborted.
    Failed,
    /// Passed `expires_at` before completing.
    Expired,
}

impl PairingStatus {
    /// Whether no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PairingStatus::Completed | PairingStatus::Failed | PairingStatus::Expired
        )
    }
}

/// One in-progress pairing attempt on the host.
#[derive(Debug, Clone)]
pub struct PairingSession {
    /// Session id (also in the QR payload).
    pub session_id: SessionId,
    /// Ephemeral X25519 public key shown in the QR code.
    pub ephemeral_public: [u8; 32],
    ephemeral_secret: SecretBytes,
    /// The QR contents.
    pub qr: QrCodeData,
    /// Encoded QR payload.
    pub qr_payload: String,
    /// Creation time (Unix millis).
    pub created_at: u64,
    /// Expiry (Unix millis).
    pub expires_at: u64,
    status: PairingStatus,
    /// Client's long-term public key once a request was accepted.
    pub peer_public_key: Option<[u8; 32]>,
    /// Client's device id once a request was accepted.
    pub peer_device_id: Option<DeviceId>,
    /// Client's device name once a request was accepted.
    pub peer_device_name: Option<String>,
    /// Client's ephemeral public key once a request was accepted.
    pub peer_ephemeral_key: Option<[u8; 32]>,
}

impl PairingSession {
    /// Create a new session in `pending`.
    ///
    /// `ephemeral_public`/`ephemeral_secret` must be a freshly generated
    /// X25519 key pair, distinct from the long-term identity.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        host: &DeviceIdentity,
        ip_address: impl Into<String>,
        port: u16,
        app_version: impl Into<String>,
        ephemeral_public: [u8; 32],
        ephemeral_secret: SecretBytes,
        now: u64,
        ttl: Duration,
    ) -> Result<Self, PairingError> {
        let session_id = SessionId::random();
        let expires_at = now.saturating_add(ttl.as_millis() as u64);
        let mut qr = QrCodeData {
            session_id,
            ip_address: ip_address.into(),
            port,
            expires_at,
            public_key: ephemeral_public,
            app_version: app_version.into(),
            device_id: host.id,
            device_name: host.name.clone(),
            checksum: String::new(),
        };
        qr.checksum = qr.compute_checksum();
        let qr_payload = qr.to_qr_payload()?;

        Ok(Self {
            session_id,
            ephemeral_public,
            ephemeral_secret,
            qr,
            qr_payload,
            created_at: now,
            expires_at,
            status: PairingStatus::Pending,
            peer_public_key: None,
            peer_device_id: None,
            peer_device_name: None,
            peer_ephemeral_key: None,
        })
    }

    /// Current status. Does not apply expiry; see [`Self::refresh`].
    pub fn status(&self) -> PairingStatus {
        self.status
    }

    /// The ephemeral private key bytes.
    pub fn ephemeral_secret(&self) -> &SecretBytes {
        &self.ephemeral_secret
    }

    /// Whether the session is past its expiry.
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    /// Apply wall-clock expiry to a non-terminal session.
    pub fn refresh(&mut self, now: u64) -> PairingStatus {
        if !self.status.is_terminal() && self.is_expired(now) {
            self.status = PairingStatus::Expired;
        }
        self.status
    }

    /// Host handling of a `pair_request`.
    ///
    /// On success the session moves to `connected` and records the peer.
    /// On rejection it moves to `expired` or `failed` (except for a
    /// request naming a different session, which leaves it untouched).
    pub fn accept_request(
        &mut self,
        request: &PairRequest,
        ephemeral_key: [u8; 32],
        now: u64,
    ) -> Result<(), RejectReason> {
        if request.session_id != self.session_id {
            return Err(RejectReason::UnknownSession);
        }
        match self.refresh(now) {
            PairingStatus::Pending => {}
            PairingStatus::Expired => return Err(RejectReason::Expired),
            _ => return Err(RejectReason::Busy),
        }
        if request.checksum != self.qr.checksum {
            self.status = PairingStatus::Failed;
            return Err(RejectReason::ChecksumMismatch);
        }
        if !app_versions_compatible(&self.qr.app_version, &request.app_version) {
            self.status = PairingStatus::Failed;
            return Err(RejectReason::VersionMismatch);
        }

        self.status = PairingStatus::Connected;
        self.peer_public_key = Some(request.identity.public_key);
        self.peer_device_id = Some(request.identity.id);
        self.peer_device_name = Some(request.identity.name.clone());
        self.peer_ephemeral_key = Some(ephemeral_key);
        Ok(())
    }

    /// Mark the session completed after the client's confirmation.
    ///
    /// An expired session never completes.
    pub fn complete(&mut self, now: u64) -> Result<(), PairingError> {
        match self.refresh(now) {
            PairingStatus::Connected => {
                self.status = PairingStatus::Completed;
                Ok(())
            }
            PairingStatus::Expired => Err(PairingError::SessionExpired),
            other => Err(PairingError::InvalidStatus(other)),
        }
    }

    /// Mark the session failed (protocol error, reject, disconnect).
    pub fn fail(&mut self) {
        if !self.status.is_terminal() {
            self.status = PairingStatus::Failed;
        }
    }
}

/// Host-side set of live pairing sessions.
#[derive(Debug, Default)]
pub struct PairingSessions {
    sessions: Vec<PairingSession>,
}

impl PairingSessions {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session.
    pub fn insert(&mut self, session: PairingSession) {
        self.sessions.push(session);
    }

    /// Look up a session by id.
    pub fn get_mut(&mut self, id: &SessionId) -> Option<&mut PairingSession> {
        self.sessions.iter_mut().find(|s| s.session_id == *id)
    }

    /// Every live session.
    pub fn iter(&self) -> impl Iterator<Item = &PairingSession> {
        self.sessions.iter()
    }

    /// Remove a session by id.
    pub fn remove(&mut self, id: &SessionId) -> Option<PairingSession> {
        let index = self.sessions.iter().position(|s| s.session_id == *id)?;
        Some(self.sessions.remove(index))
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// True when no session is live.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Expire and drop every session that is terminal or past its expiry.
    /// Returns the ids of dropped sessions.
    pub fn purge_expired(&mut self, now: u64) -> Vec<SessionId> {
        let mut purged = Vec::new();
        self.sessions.retain_mut(|session| {
            if session.refresh(now).is_terminal() {
                purged.push(session.session_id);
                false
            } else {
                true
            }
        });
        purged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_700_000_000_000;

    fn host() -> DeviceIdentity {
        DeviceIdentity {
            id: DeviceId::random(),
            name: "Teacher laptop".into(),
            public_key: [0x11; 32],
        }
    }

    fn session() -> PairingSession {
        PairingSession::new(
            &host(),
            "192.168.1.20",
            47801,
            "1.4.0",
            [0x22; 32],
            SecretBytes::from_bytes([0x33; 32]),
            NOW,
            DEFAULT_PAIRING_TTL,
        )
        .unwrap()
    }

    fn request_for(session: &PairingSession) -> PairRequest {
        PairRequest {
            identity: DeviceIdentity {
                id: DeviceId::random(),
                name: "Classroom tablet".into(),
                public_key: [0x44; 32],
            },
            session_id: session.session_id,
            app_version: "1.2.9".into(),
            checksum: session.qr.checksum.clone(),
        }
    }

    // ===========================================
    // QR payload
    // ===========================================

    #[test]
    fn qr_payload_roundtrip() {
        let session = session();
        let decoded = QrCodeData::from_qr_payload(&session.qr_payload).unwrap();
        assert_eq!(decoded, session.qr);
        assert_eq!(decoded.checksum.len(), 16);
        assert_eq!(decoded.public_key, [0x22; 32]);
    }

    #[test]
    fn qr_json_uses_camel_case() {
        let session = session();
        let json = serde_json::to_string(&session.qr).unwrap();
        assert!(json.contains("\"sessionId\""));
        assert!(json.contains("\"expiresAt\""));
        assert!(json.contains("\"deviceName\""));
    }

    #[test]
    fn tampered_qr_fails_checksum() {
        let mut qr = session().qr;
        qr.port = 1;
        let payload = qr.to_qr_payload().unwrap();
        assert!(matches!(
            QrCodeData::from_qr_payload(&payload),
            Err(PairingError::QrInvalid(_))
        ));
    }

    #[test]
    fn truncated_qr_is_invalid() {
        let payload = session().qr_payload;
        let truncated = &payload[..payload.len() / 2];
        assert!(matches!(
            QrCodeData::from_qr_payload(truncated),
            Err(PairingError::QrInvalid(_))
        ));
    }

    #[test]
    fn invalid_qr_payload_base64() {
        let result = QrCodeData::from_qr_payload("not-valid-base64!!!");
        assert!(matches!(result, Err(PairingError::QrInvalid(_))));
    }

    #[test]
    fn consume_rejects_expired_payload() {
        let session = session();
        assert!(QrCodeData::consume(&session.qr_payload, NOW + 1).is_ok());
        assert_eq!(
            QrCodeData::consume(&session.qr_payload, session.expires_at),
            Err(PairingError::QrExpired)
        );
    }

    #[test]
    fn address_formats_ipv6() {
        let mut qr = session().qr;
        assert_eq!(qr.address(), "192.168.1.20:47801");
        qr.ip_address = "fe80::1".into();
        assert_eq!(qr.address(), "[fe80::1]:47801");
    }

    // ===========================================
    // Session status machine
    // ===========================================

    #[test]
    fn valid_request_connects_then_completes() {
        let mut session = session();
        let request = request_for(&session);

        session.accept_request(&request, [0x55; 32], NOW + 10).unwrap();
        assert_eq!(session.status(), PairingStatus::Connected);
        assert_eq!(session.peer_device_id, Some(request.identity.id));
        assert_eq!(session.peer_ephemeral_key, Some([0x55; 32]));

        session.complete(NOW + 20).unwrap();
        assert_eq!(session.status(), PairingStatus::Completed);
    }

    #[test]
    fn expired_session_rejects_valid_request() {
        let mut session = session();
        let request = request_for(&session);

        let result = session.accept_request(&request, [0x55; 32], session.expires_at + 1);
        assert_eq!(result, Err(RejectReason::Expired));
        assert_eq!(session.status(), PairingStatus::Expired);
    }

    #[test]
    fn expired_session_never_completes() {
        let mut session = session();
        let request = request_for(&session);
        session.accept_request(&request, [0x55; 32], NOW).unwrap();

        let result = session.complete(session.expires_at);
        assert_eq!(result, Err(PairingError::SessionExpired));
        assert_eq!(session.status(), PairingStatus::Expired);
    }

    #[test]
    fn checksum_mismatch_fails_session() {
        let mut session = session();
        let mut request = request_for(&session);
        request.checksum = "0000000000000000".into();

        let result = session.accept_request(&request, [0x55; 32], NOW);
        assert_eq!(result, Err(RejectReason::ChecksumMismatch));
        assert_eq!(session.status(), PairingStatus::Failed);
    }

    #[test]
    fn major_version_mismatch_fails_session() {
        let mut session = session();
        let mut request = request_for(&session);
        request.app_version = "2.0.0".into();

        let result = session.accept_request(&request, [0x55; 32], NOW);
        assert_eq!(result, Err(RejectReason::VersionMismatch));
        assert_eq!(session.status(), PairingStatus::Failed);
    }

    #[test]
    fn wrong_session_id_leaves_session_pending() {
        let mut session = session();
        let mut request = request_for(&session);
        request.session_id = SessionId::random();

        let result = session.accept_request(&request, [0x55; 32], NOW);
        assert_eq!(result, Err(RejectReason::UnknownSession));
        assert_eq!(session.status(), PairingStatus::Pending);
    }

    #[test]
    fn second_request_is_refused_while_connected() {
        let mut session = session();
        let request = request_for(&session);
        session.accept_request(&request, [0x55; 32], NOW).unwrap();

        let again = session.accept_request(&request, [0x66; 32], NOW + 1);
        assert_eq!(again, Err(RejectReason::Busy));
        assert_eq!(session.peer_ephemeral_key, Some([0x55; 32]));
    }

    #[test]
    fn complete_requires_connected() {
        let mut session = session();
        assert_eq!(
            session.complete(NOW),
            Err(PairingError::InvalidStatus(PairingStatus::Pending))
        );
    }

    #[test]
    fn purge_drops_expired_and_terminal_sessions() {
        let mut sessions = PairingSessions::new();
        let live = session();
        let live_id = live.session_id;
        let mut failed = session();
        failed.fail();
        let failed_id = failed.session_id;

        sessions.insert(live);
        sessions.insert(failed);

        let purged = sessions.purge_expired(NOW + 1);
        assert_eq!(purged, vec![failed_id]);
        assert!(sessions.get_mut(&live_id).is_some());

        let purged = sessions.purge_expired(NOW + DEFAULT_PAIRING_TTL.as_millis() as u64);
        assert_eq!(purged, vec![live_id]);
        assert!(sessions.is_empty());
    }

    // ===========================================
    // Helpers
    // ===========================================

    #[test]
    fn version_compatibility_uses_major() {
        assert!(app_versions_compatible("1.0.0", "1.9.3"));
        assert!(!app_versions_compatible("1.0.0", "2.0.0"));
        assert!(!app_versions_compatible("", "1.0.0"));
    }

    #[test]
    fn pairing_context_is_order_independent() {
        let session = SessionId::random();
        let a = DeviceId::random();
        let b = DeviceId::random();
        assert_eq!(
            pairing_context(&session, &a, &b),
            pairing_context(&session, &b, &a)
        );
        assert_ne!(
            pairing_context(&session, &a, &b),
            pairing_context(&SessionId::random(), &a, &b)
        );
    }

    #[test]
    fn secret_debug_is_redacted() {
        let secret = SecretBytes::from_bytes([0x42; 32]);
        let debug = format!("{:?}", secret);
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains("42"));
    }

    #[test]
    fn secret_serializes_as_hex() {
        let secret = SecretBytes::from_bytes([0xAB; 32]);
        let json = serde_json::to_string(&secret).unwrap();
        assert_eq!(json, format!("\"{}\"", "ab".repeat(32)));
        let restored: SecretBytes = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, secret);
    }
}
