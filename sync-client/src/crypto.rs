//! Cryptographic primitives for classsync.
//!
//! This module provides:
//! - [`CryptoIdentity`]: the long-term Ed25519 device identity, persisted once
//! - [`KeyAgreement`] with the X25519 implementation used for pairing
//! - [`AeadCipher`] with the XChaCha20-Poly1305 implementation
//! - [`ChannelKeys`]: message and packet subkeys derived from a shared secret
//! - [`QrScanner`]: the camera capability injected by the UI
//!
//! # Security Notes
//!
//! - XChaCha20 uses 192-bit nonces (24 bytes), safe for random generation
//! - Pairing uses fresh ephemeral X25519 keys, never the long-term identity
//! - All symmetric keys are derived via HKDF-SHA256 for cryptographic separation

use async_trait::async_trait;
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use classsync_core::{pairing_context, SecretBytes, SharedSecret};
use classsync_types::{DeviceId, DeviceIdentity, SessionId};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::path::{Path, PathBuf};
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Nonce size for XChaCha20-Poly1305 (192 bits = 24 bytes).
pub const NONCE_SIZE: usize = 24;

/// Key size for XChaCha20-Poly1305 (256 bits = 32 bytes).
pub const KEY_SIZE: usize = 32;

/// Crypto errors.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Encryption failed.
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// Decryption failed (authentication error).
    #[error("decryption failed: authentication error")]
    DecryptionFailed,

    /// A public key could not be parsed.
    #[error("malformed key: {0}")]
    InvalidKey(String),

    /// A signature is malformed or does not verify.
    #[error("invalid signature")]
    InvalidSignature,

    /// The peer's key agreement contribution was a low-order point.
    #[error("key agreement produced a non-contributory secret")]
    NonContributory,

    /// Key derivation failed.
    #[error("key derivation failed: {0}")]
    KeyDerivationFailed(String),

    /// The OS random source failed.
    #[error("random generation failed: {0}")]
    Random(String),

    /// Identity file could not be read or written.
    #[error("identity file {path}: {source}")]
    Io {
        /// Identity file path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Identity file is not valid JSON.
    #[error("identity file {path} is malformed: {source}")]
    Format {
        /// Identity file path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },
}

/// Fill a fixed-size buffer from the OS random source.
pub(crate) fn random_bytes<const N: usize>() -> Result<[u8; N], CryptoError> {
    let mut bytes = [0u8; N];
    getrandom::getrandom(&mut bytes).map_err(|e| CryptoError::Random(e.to_string()))?;
    Ok(bytes)
}

/// A fresh random XChaCha20 nonce.
pub fn random_nonce() -> Result<[u8; NONCE_SIZE], CryptoError> {
    random_bytes()
}

// ===========================================
// Long-term identity
// ===========================================

/// On-disk form of a [`CryptoIdentity`].
#[derive(Serialize, Deserialize)]
struct StoredIdentity {
    id: DeviceId,
    name: String,
    secret_key: SecretBytes,
}

/// This device's long-term identity: a stable id plus an Ed25519 key pair.
pub struct CryptoIdentity {
    identity: DeviceIdentity,
    signing_key: SigningKey,
}

impl CryptoIdentity {
    /// Generate a new identity with a random device id.
    pub fn generate(name: impl Into<String>) -> Result<Self, CryptoError> {
        let mut seed: [u8; 32] = random_bytes()?;
        let identity = Self::from_parts(DeviceId::random(), name, &seed);
        seed.zeroize();
        Ok(identity)
    }

    fn from_parts(id: DeviceId, name: impl Into<String>, secret: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(secret);
        Self {
            identity: DeviceIdentity {
                id,
                name: name.into(),
                public_key: signing_key.verifying_key().to_bytes(),
            },
            signing_key,
        }
    }

    /// Load the identity stored at `path`, generating and persisting a new
    /// one (mode 0600) on first use.
    pub async fn load_or_generate(
        path: impl AsRef<Path>,
        name: impl Into<String>,
    ) -> Result<Self, CryptoError> {
        let path = path.as_ref();
        let io_err = |source| CryptoError::Io {
            path: path.to_path_buf(),
            source,
        };

        if tokio::fs::try_exists(path).await.map_err(io_err)? {
            let text = tokio::fs::read_to_string(path).await.map_err(io_err)?;
            let stored: StoredIdentity =
                serde_json::from_str(&text).map_err(|source| CryptoError::Format {
                    path: path.to_path_buf(),
                    source,
                })?;
            tracing::debug!(device = %stored.id, "Loaded device identity");
            return Ok(Self::from_parts(
                stored.id,
                stored.name,
                stored.secret_key.as_bytes(),
            ));
        }

        let identity = Self::generate(name)?;
        let stored = StoredIdentity {
            id: identity.identity.id,
            name: identity.identity.name.clone(),
            secret_key: SecretBytes::from_bytes(identity.signing_key.to_bytes()),
        };
        let json = serde_json::to_string_pretty(&stored).map_err(|source| CryptoError::Format {
            path: path.to_path_buf(),
            source,
        })?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        tokio::fs::write(path, json).await.map_err(io_err)?;
        set_owner_only(path).await.map_err(io_err)?;

        tracing::info!(device = %identity.identity.id, "Generated new device identity");
        Ok(identity)
    }

    /// Public identity fields.
    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Device id.
    pub fn device_id(&self) -> DeviceId {
        self.identity.id
    }

    /// Ed25519 verifying key bytes.
    pub fn public_key(&self) -> [u8; 32] {
        self.identity.public_key
    }

    /// Sign `payload` with the long-term key.
    pub fn sign(&self, payload: &[u8]) -> Vec<u8> {
        self.signing_key.sign(payload).to_bytes().to_vec()
    }

    /// Verify `signature` over `payload` against `public_key`.
    pub fn verify(payload: &[u8], signature: &[u8], public_key: &[u8; 32]) -> Result<(), CryptoError> {
        let key = VerifyingKey::from_bytes(public_key)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let signature = Signature::from_slice(signature).map_err(|_| CryptoError::InvalidSignature)?;
        key.verify_strict(payload, &signature)
            .map_err(|_| CryptoError::InvalidSignature)
    }
}

impl std::fmt::Debug for CryptoIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoIdentity")
            .field("identity", &self.identity)
            .field("signing_key", &"[REDACTED]")
            .finish()
    }
}

#[cfg(unix)]
async fn set_owner_only(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await
}

#[cfg(not(unix))]
async fn set_owner_only(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

// ===========================================
// Key agreement
// ===========================================

/// Ephemeral Diffie-Hellman capability used during pairing.
pub trait KeyAgreement: Send + Sync {
    /// Fresh ephemeral key pair as (public, secret).
    fn generate_ephemeral(&self) -> Result<([u8; 32], SecretBytes), CryptoError>;

    /// Raw agreement between our `secret` and the peer's public key.
    fn agree(&self, secret: &SecretBytes, peer_public: &[u8; 32]) -> Result<SecretBytes, CryptoError>;
}

/// X25519 key agreement.
#[derive(Debug, Clone, Copy, Default)]
pub struct X25519KeyAgreement;

impl KeyAgreement for X25519KeyAgreement {
    fn generate_ephemeral(&self) -> Result<([u8; 32], SecretBytes), CryptoError> {
        let mut seed: [u8; 32] = random_bytes()?;
        let secret = StaticSecret::from(seed);
        seed.zeroize();
        let public = PublicKey::from(&secret);
        Ok((public.to_bytes(), SecretBytes::from_bytes(secret.to_bytes())))
    }

    fn agree(&self, secret: &SecretBytes, peer_public: &[u8; 32]) -> Result<SecretBytes, CryptoError> {
        let secret = StaticSecret::from(*secret.as_bytes());
        let shared = secret.diffie_hellman(&PublicKey::from(*peer_public));
        if !shared.was_contributory() {
            return Err(CryptoError::NonContributory);
        }
        Ok(SecretBytes::from_bytes(*shared.as_bytes()))
    }
}

fn hkdf_expand(salt: &[u8], ikm: &[u8], info: &[u8]) -> Result<[u8; KEY_SIZE], CryptoError> {
    let hkdf = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut out = [0u8; KEY_SIZE];
    hkdf.expand(info, &mut out)
        .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
    Ok(out)
}

/// Derive the long-lived shared secret for one pairing.
///
/// Both sides call this with their own ephemeral secret and the other's
/// ephemeral public key; the HKDF context binds the session and both device
/// ids so the result is identical on each side.
pub fn derive_shared_secret(
    agreement: &dyn KeyAgreement,
    local_secret: &SecretBytes,
    remote_public: &[u8; 32],
    session_id: &SessionId,
    local_id: &DeviceId,
    remote_id: &DeviceId,
) -> Result<SharedSecret, CryptoError> {
    let raw = agreement.agree(local_secret, remote_public)?;
    let info = pairing_context(session_id, local_id, remote_id);
    hkdf_expand(session_id.as_bytes(), raw.as_bytes(), &info).map(SecretBytes::from_bytes)
}

// ===========================================
// Channel keys
// ===========================================

/// Symmetric subkeys for one peer relationship.
///
/// `message` encrypts envelope payloads; `packet` encrypts dataset packets.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ChannelKeys {
    message_key: [u8; KEY_SIZE],
    packet_key: [u8; KEY_SIZE],
}

impl ChannelKeys {
    /// Derive subkeys from a paired device's shared secret.
    pub fn derive(secret: &SharedSecret) -> Result<Self, CryptoError> {
        Self::derive_with_salt(b"classsync-channel-v1", secret)
    }

    /// Keys for the pairing handshake, derived from the raw ephemeral
    /// agreement before any device ids are known.
    pub fn for_pairing(
        agreement: &dyn KeyAgreement,
        local_secret: &SecretBytes,
        remote_public: &[u8; 32],
    ) -> Result<Self, CryptoError> {
        let raw = agreement.agree(local_secret, remote_public)?;
        Self::derive_with_salt(b"classsync-pairing-v1", &raw)
    }

    fn derive_with_salt(salt: &[u8], secret: &SecretBytes) -> Result<Self, CryptoError> {
        Ok(Self {
            message_key: hkdf_expand(salt, secret.as_bytes(), b"message")?,
            packet_key: hkdf_expand(salt, secret.as_bytes(), b"packet")?,
        })
    }

    /// Envelope payload key.
    pub fn message_key(&self) -> &[u8; KEY_SIZE] {
        &self.message_key
    }

    /// Sync packet key.
    pub fn packet_key(&self) -> &[u8; KEY_SIZE] {
        &self.packet_key
    }
}

// Don't leak keys in debug output
impl std::fmt::Debug for ChannelKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ChannelKeys {{ message_key: [REDACTED], packet_key: [REDACTED] }}"
        )
    }
}

// ===========================================
// AEAD
// ===========================================

/// Authenticated encryption capability.
pub trait AeadCipher: Send + Sync {
    /// Encrypt `plaintext`, binding `aad`.
    fn seal(
        &self,
        key: &[u8; KEY_SIZE],
        nonce: &[u8; NONCE_SIZE],
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    /// Decrypt `ciphertext`, checking `aad`.
    fn open(
        &self,
        key: &[u8; KEY_SIZE],
        nonce: &[u8; NONCE_SIZE],
        ciphertext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;
}

/// XChaCha20-Poly1305 with 192-bit nonces.
#[derive(Debug, Clone, Copy, Default)]
pub struct XChaChaCipher;

impl AeadCipher for XChaChaCipher {
    fn seal(
        &self,
        key: &[u8; KEY_SIZE],
        nonce: &[u8; NONCE_SIZE],
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let cipher = XChaCha20Poly1305::new_from_slice(key)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
        cipher
            .encrypt(
                XNonce::from_slice(nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::EncryptionFailed("aead encrypt failed".into()))
    }

    fn open(
        &self,
        key: &[u8; KEY_SIZE],
        nonce: &[u8; NONCE_SIZE],
        ciphertext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let cipher = XChaCha20Poly1305::new_from_slice(key)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
        cipher
            .decrypt(
                XNonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

// ===========================================
// QR scanning
// ===========================================

/// Errors from a [`QrScanner`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScanError {
    /// The user closed the scanner.
    #[error("scan cancelled")]
    Cancelled,
    /// The camera or decoder failed.
    #[error("scan failed: {0}")]
    Failed(String),
}

/// Camera capability supplied by the UI shell.
#[async_trait]
pub trait QrScanner: Send + Sync {
    /// Wait for a QR code and return its raw text.
    async fn scan(&self) -> Result<String, ScanError>;
}
