//! Message channel: envelope encoding, encryption and authentication.
//!
//! Every message except discovery travels as an [`Envelope`] whose payload
//! is sealed with XChaCha20-Poly1305 (header bound as associated data) and
//! whose [`Envelope::signing_bytes`] are signed with the sender's long-term
//! Ed25519 key.
//!
//! Keys come from two places:
//! - paired peers: [`ChannelKeys`] derived from the stored shared secret,
//!   signature checked against the stored public key
//! - pairing handshake: keys from the ephemeral agreement, signature checked
//!   against the identity carried in the decrypted body

use classsync_core::DeviceDirectory;
use classsync_types::{
    Dataset, DeviceId, DiscoveryAnnouncement, Envelope, Message, MessageType, SyncError,
    SyncPacket, VectorClock,
};
use std::sync::Arc;
use thiserror::Error;

use crate::crypto::{AeadCipher, ChannelKeys, CryptoError, CryptoIdentity, NONCE_SIZE};

/// Errors decoding or encoding channel traffic.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Unknown sender or bad signature.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The payload did not decrypt under the expected key.
    #[error("decryption failed")]
    Decryption,

    /// A sync packet's content hash does not match its payload.
    #[error("packet hash mismatch")]
    ChecksumMismatch,

    /// Local crypto failure while sealing.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Wire encoding failure.
    #[error("wire error: {0}")]
    Wire(#[from] SyncError),

    /// The envelope does not match the message it carries.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

/// Encodes and decodes envelopes for one local identity.
#[derive(Clone)]
pub struct MessageChannel {
    identity: Arc<CryptoIdentity>,
    cipher: Arc<dyn AeadCipher>,
}

impl MessageChannel {
    /// Create a channel for `identity` using `cipher`.
    pub fn new(identity: Arc<CryptoIdentity>, cipher: Arc<dyn AeadCipher>) -> Self {
        Self { identity, cipher }
    }

    /// The local identity.
    pub fn identity(&self) -> &CryptoIdentity {
        &self.identity
    }

    /// Local device id.
    pub fn local_id(&self) -> DeviceId {
        self.identity.device_id()
    }

    // ===========================================
    // Authenticated envelopes
    // ===========================================

    /// Seal and sign `message` under `keys`.
    pub fn seal(&self, message: &Message, keys: &ChannelKeys) -> Result<Envelope, ChannelError> {
        self.seal_inner(message, keys, None)
    }

    /// Seal a pairing message, attaching our ephemeral public key.
    pub fn seal_with_ephemeral(
        &self,
        message: &Message,
        keys: &ChannelKeys,
        ephemeral_key: [u8; 32],
    ) -> Result<Envelope, ChannelError> {
        self.seal_inner(message, keys, Some(ephemeral_key))
    }

    fn seal_inner(
        &self,
        message: &Message,
        keys: &ChannelKeys,
        ephemeral_key: Option<[u8; 32]>,
    ) -> Result<Envelope, ChannelError> {
        let plaintext = message.to_bytes()?;
        let nonce = crate::crypto::random_nonce()?;
        let mut envelope = Envelope::new(message.message_type(), self.local_id(), nonce, Vec::new());
        envelope.ephemeral_key = ephemeral_key;
        envelope.payload = self.cipher.seal(
            keys.message_key(),
            &nonce,
            &plaintext,
            &envelope.associated_data(),
        )?;
        envelope.signature = self.identity.sign(&envelope.signing_bytes());
        Ok(envelope)
    }

    /// Verify and decrypt an envelope from a known peer.
    ///
    /// The signature is checked first so forged traffic never reaches the
    /// cipher.
    pub fn open(
        &self,
        envelope: &Envelope,
        keys: &ChannelKeys,
        sender_public: &[u8; 32],
    ) -> Result<Message, ChannelError> {
        CryptoIdentity::verify(&envelope.signing_bytes(), &envelope.signature, sender_public)
            .map_err(|e| ChannelError::Authentication(e.to_string()))?;
        self.decrypt(envelope, keys)
    }

    /// Open an envelope from a paired device, looking up its keys in
    /// `directory`. Unknown senders fail authentication.
    pub fn open_from(
        &self,
        envelope: &Envelope,
        directory: &DeviceDirectory,
    ) -> Result<(DeviceId, Message), ChannelError> {
        let peer = directory.paired(&envelope.sender_id).ok_or_else(|| {
            ChannelError::Authentication(format!("unknown sender {}", envelope.sender_id))
        })?;
        let keys = ChannelKeys::derive(&peer.shared_secret)?;
        let message = self.open(envelope, &keys, &peer.public_key)?;
        Ok((peer.id, message))
    }

    /// Decrypt a pairing-phase envelope under the ephemeral `keys`, then
    /// verify its signature against the identity in the body.
    pub fn open_pairing(
        &self,
        envelope: &Envelope,
        keys: &ChannelKeys,
    ) -> Result<Message, ChannelError> {
        let message = self.decrypt(envelope, keys)?;
        let identity = match &message {
            Message::PairRequest(m) => &m.identity,
            Message::PairAccept(m) => &m.identity,
            Message::PairReject(m) => &m.identity,
            other => {
                return Err(ChannelError::Protocol(format!(
                    "{} is not a pairing message",
                    other.name()
                )))
            }
        };
        if identity.id != envelope.sender_id {
            return Err(ChannelError::Authentication(
                "sender does not match pairing identity".into(),
            ));
        }
        CryptoIdentity::verify(&envelope.signing_bytes(), &envelope.signature, &identity.public_key)
            .map_err(|e| ChannelError::Authentication(e.to_string()))?;
        Ok(message)
    }

    fn decrypt(&self, envelope: &Envelope, keys: &ChannelKeys) -> Result<Message, ChannelError> {
        let declared = envelope.message_type()?;
        if !declared.is_authenticated() {
            return Err(ChannelError::Protocol("discovery envelopes are not sealed".into()));
        }
        let plaintext = self
            .cipher
            .open(
                keys.message_key(),
                &envelope.nonce,
                &envelope.payload,
                &envelope.associated_data(),
            )
            .map_err(|_| ChannelError::Decryption)?;
        let message = Message::from_bytes(&plaintext)?;
        if message.message_type() != declared {
            return Err(ChannelError::Protocol(format!(
                "envelope type {:?} carries {}",
                declared,
                message.name()
            )));
        }
        Ok(message)
    }

    // ===========================================
    // Discovery
    // ===========================================

    /// Plain envelope for a discovery broadcast.
    pub fn encode_discovery(
        &self,
        announcement: &DiscoveryAnnouncement,
    ) -> Result<Vec<u8>, ChannelError> {
        let payload = Message::Discovery(announcement.clone()).to_bytes()?;
        let envelope = Envelope::new(MessageType::Discovery, self.local_id(), [0; NONCE_SIZE], payload);
        Ok(envelope.to_bytes()?)
    }

    /// Decode a discovery datagram. Anything else is rejected.
    pub fn decode_discovery(bytes: &[u8]) -> Result<DiscoveryAnnouncement, ChannelError> {
        let envelope = Envelope::from_bytes(bytes)?;
        if envelope.message_type()? != MessageType::Discovery {
            return Err(ChannelError::Protocol("expected discovery".into()));
        }
        match Message::from_bytes(&envelope.payload)? {
            Message::Discovery(announcement) if announcement.identity.id == envelope.sender_id => {
                Ok(announcement)
            }
            Message::Discovery(_) => Err(ChannelError::Protocol(
                "announcement does not match sender".into(),
            )),
            other => Err(ChannelError::Protocol(format!(
                "discovery envelope carries {}",
                other.name()
            ))),
        }
    }

    // ===========================================
    // Sync packets
    // ===========================================

    /// Seal `dataset` into a [`SyncPacket`] under the packet key.
    ///
    /// `encrypted_data` is nonce ‖ ciphertext.
    pub fn seal_packet(
        &self,
        keys: &ChannelKeys,
        vector_clock: VectorClock,
        dataset: &Dataset,
    ) -> Result<SyncPacket, ChannelError> {
        let plaintext = dataset.to_bytes()?;
        let nonce = crate::crypto::random_nonce()?;
        let local = self.local_id();
        let ciphertext = self
            .cipher
            .seal(keys.packet_key(), &nonce, &plaintext, local.as_bytes())?;

        let mut encrypted = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        encrypted.extend_from_slice(&nonce);
        encrypted.extend_from_slice(&ciphertext);
        Ok(SyncPacket::new(local, vector_clock, &plaintext, encrypted))
    }

    /// Decrypt a packet and check its content hash before decoding.
    pub fn open_packet(
        &self,
        keys: &ChannelKeys,
        packet: &SyncPacket,
    ) -> Result<Dataset, ChannelError> {
        if packet.encrypted_data.len() < NONCE_SIZE {
            return Err(ChannelError::Decryption);
        }
        let (nonce, ciphertext) = packet.encrypted_data.split_at(NONCE_SIZE);
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        nonce_bytes.copy_from_slice(nonce);

        let plaintext = self
            .cipher
            .open(
                keys.packet_key(),
                &nonce_bytes,
                ciphertext,
                packet.device_id.as_bytes(),
            )
            .map_err(|_| ChannelError::Decryption)?;
        if !packet.hash_matches(&plaintext) {
            return Err(ChannelError::ChecksumMismatch);
        }
        Ok(Dataset::from_bytes(&plaintext)?)
    }
}

impl std::fmt::Debug for MessageChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageChannel")
            .field("local", &self.local_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{KeyAgreement, X25519KeyAgreement, XChaChaCipher};
    use classsync_core::{PairedDevice, SecretBytes};
    use classsync_types::{
        Collection, Dot, FieldValue, Heartbeat, PairAccept, Record, SyncData, MAX_MESSAGE_SIZE,
    };
    use serde_json::json;

    fn channel(name: &str) -> MessageChannel {
        MessageChannel::new(
            Arc::new(CryptoIdentity::generate(name).unwrap()),
            Arc::new(XChaChaCipher),
        )
    }

    fn keys(byte: u8) -> ChannelKeys {
        ChannelKeys::derive(&SecretBytes::from_bytes([byte; 32])).unwrap()
    }

    fn dataset() -> Dataset {
        let dot = Dot::new(DeviceId::random(), 1);
        Dataset::from_records([Record::new(Collection::Classes, "c1")
            .with_field("name", FieldValue::new(json!("Math 7B"), 1_000, dot))])
    }

    // ===========================================
    // Envelope Tests
    // ===========================================

    #[test]
    fn seal_open_roundtrip() {
        let alice = channel("Alice");
        let bob = channel("Bob");
        let message = Message::Heartbeat(Heartbeat { timestamp: 42 });

        let envelope = alice.seal(&message, &keys(1)).unwrap();
        let wire = envelope.to_bytes().unwrap();
        let decoded = Envelope::from_bytes(&wire).unwrap();

        let opened = bob
            .open(&decoded, &keys(1), &alice.identity().public_key())
            .unwrap();
        assert_eq!(opened, message);
    }

    #[test]
    fn wrong_signer_is_authentication_error() {
        let alice = channel("Alice");
        let mallory = channel("Mallory");
        let envelope = mallory
            .seal(&Message::Heartbeat(Heartbeat::now()), &keys(1))
            .unwrap();

        let result = alice.open(&envelope, &keys(1), &alice.identity().public_key());
        assert!(matches!(result, Err(ChannelError::Authentication(_))));
    }

    #[test]
    fn tampered_header_is_authentication_error() {
        let alice = channel("Alice");
        let mut envelope = alice
            .seal(&Message::Heartbeat(Heartbeat::now()), &keys(1))
            .unwrap();
        envelope.timestamp += 1;

        let result = alice.open(&envelope, &keys(1), &alice.identity().public_key());
        assert!(matches!(result, Err(ChannelError::Authentication(_))));
    }

    #[test]
    fn wrong_key_is_decryption_error() {
        let alice = channel("Alice");
        let envelope = alice
            .seal(&Message::Heartbeat(Heartbeat::now()), &keys(1))
            .unwrap();

        let result = alice.open(&envelope, &keys(2), &alice.identity().public_key());
        assert!(matches!(result, Err(ChannelError::Decryption)));
    }

    #[test]
    fn unknown_sender_fails_lookup() {
        let alice = channel("Alice");
        let bob = channel("Bob");
        let envelope = alice
            .seal(&Message::Heartbeat(Heartbeat::now()), &keys(1))
            .unwrap();

        let mut directory = DeviceDirectory::new(6_000);
        assert!(matches!(
            bob.open_from(&envelope, &directory),
            Err(ChannelError::Authentication(_))
        ));

        directory.upsert_paired(PairedDevice {
            id: alice.local_id(),
            name: "Alice".into(),
            public_key: alice.identity().public_key(),
            shared_secret: SecretBytes::from_bytes([1; 32]),
            paired_at: 0,
            last_sync_at: None,
        });
        let (peer, _) = bob.open_from(&envelope, &directory).unwrap();
        assert_eq!(peer, alice.local_id());
    }

    #[test]
    fn pairing_envelope_verifies_against_body_identity() {
        let kx = X25519KeyAgreement;
        let (a_pub, a_secret) = kx.generate_ephemeral().unwrap();
        let (b_pub, b_secret) = kx.generate_ephemeral().unwrap();
        let host = channel("Host");
        let client = channel("Client");

        let accept = Message::PairAccept(PairAccept {
            identity: host.identity().identity().clone(),
        });
        let sealed = host
            .seal_with_ephemeral(
                &accept,
                &ChannelKeys::for_pairing(&kx, &a_secret, &b_pub).unwrap(),
                a_pub,
            )
            .unwrap();
        let client_keys = ChannelKeys::for_pairing(&kx, &b_secret, &a_pub).unwrap();
        assert_eq!(client.open_pairing(&sealed, &client_keys).unwrap(), accept);

        // Body claims the host identity but the envelope is signed by someone else
        let forged = client
            .seal(
                &accept,
                &ChannelKeys::for_pairing(&kx, &a_secret, &b_pub).unwrap(),
            )
            .unwrap();
        assert!(matches!(
            client.open_pairing(&forged, &client_keys),
            Err(ChannelError::Authentication(_))
        ));
    }

    #[test]
    fn discovery_is_plain_and_self_consistent() {
        let alice = channel("Alice");
        let announcement = DiscoveryAnnouncement {
            identity: alice.identity().identity().clone(),
            port: 47801,
            app_version: "1.2.0".into(),
        };
        let bytes = alice.encode_discovery(&announcement).unwrap();
        assert_eq!(MessageChannel::decode_discovery(&bytes).unwrap(), announcement);

        let sealed = alice
            .seal(&Message::Heartbeat(Heartbeat::now()), &keys(1))
            .unwrap()
            .to_bytes()
            .unwrap();
        assert!(MessageChannel::decode_discovery(&sealed).is_err());
    }

    // ===========================================
    // Packet Tests
    // ===========================================

    #[test]
    fn packet_roundtrip() {
        let alice = channel("Alice");
        let data = dataset();
        let packet = alice
            .seal_packet(&keys(3), VectorClock::new(), &data)
            .unwrap();
        assert_eq!(alice.open_packet(&keys(3), &packet).unwrap(), data);
    }

    #[test]
    fn packet_hash_mismatch_rejected() {
        let alice = channel("Alice");
        let mut packet = alice
            .seal_packet(&keys(3), VectorClock::new(), &dataset())
            .unwrap();
        packet.data_hash = SyncPacket::digest(b"something else");

        assert!(matches!(
            alice.open_packet(&keys(3), &packet),
            Err(ChannelError::ChecksumMismatch)
        ));
    }

    #[test]
    fn packet_from_other_key_or_truncated_fails() {
        let alice = channel("Alice");
        let mut packet = alice
            .seal_packet(&keys(3), VectorClock::new(), &dataset())
            .unwrap();
        assert!(matches!(
            alice.open_packet(&keys(4), &packet),
            Err(ChannelError::Decryption)
        ));
        packet.encrypted_data.truncate(10);
        assert!(matches!(
            alice.open_packet(&keys(3), &packet),
            Err(ChannelError::Decryption)
        ));
    }

    #[test]
    fn large_sync_data_roundtrips() {
        let alice = channel("Alice");
        let bob = channel("Bob");
        let dot = Dot::new(alice.local_id(), 1);
        let records = (0..2_000).map(|i| {
            Record::new(Collection::Students, format!("s{i}"))
                .with_field("notes", FieldValue::new(json!("x".repeat(200)), i, dot))
        });
        let data = Dataset::from_records(records);
        let packet = alice.seal_packet(&keys(5), VectorClock::new(), &data).unwrap();
        let envelope = alice
            .seal(&Message::SyncData(SyncData { packet }), &keys(5))
            .unwrap();
        let wire = envelope.to_bytes().unwrap();
        assert!(wire.len() < MAX_MESSAGE_SIZE);

        let opened = bob
            .open(
                &Envelope::from_bytes(&wire).unwrap(),
                &keys(5),
                &alice.identity().public_key(),
            )
            .unwrap();
        match opened {
            Message::SyncData(SyncData { packet }) => {
                assert_eq!(bob.open_packet(&keys(5), &packet).unwrap(), data);
            }
            other => panic!("expected sync data, got {:?}", other),
        }
    }
}
