//! # sync-client
//!
//! Engine library for classsync LAN peer-to-peer sync.
//!
//! Devices on the same network find each other by UDP broadcast, pair once
//! by scanning a QR code, and from then on exchange field-level deltas
//! directly, with no server in between.
//!
//! ## Features
//!
//! - **Pairing**: QR code carrying a one-time X25519 key; the derived secret
//!   is kept per paired device
//! - **Authenticated channel**: Ed25519-signed, XChaCha20-Poly1305 sealed
//!   envelopes
//! - **Vector clock sync**: per-field dots, concurrent-write detection and
//!   configurable conflict strategies
//! - **First sync arbitration**: the user picks whose data wins when two
//!   unrelated datasets meet
//! - **Pure State Machine**: Uses sync-core for side-effect-free logic
//!
//! ## Example
//!
//! ```ignore
//! use classsync_client::{CryptoIdentity, JsonFileStore, SyncEngine, TcpConnector};
//!
//! let identity = CryptoIdentity::load_or_generate("identity.json", "Room 12 tablet").await?;
//! let engine = SyncEngine::builder(identity, JsonFileStore::new("records.json"), TcpConnector::default())
//!     .build()
//!     .await?;
//!
//! engine.start_discovery().await?;
//! let qr = engine.create_pairing_qr("192.168.1.20").await?;
//! // show qr.payload, then serve incoming connections with handle_incoming()
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod config;
pub mod crypto;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod persist;
pub mod store;
pub mod transport;

pub use channel::{ChannelError, MessageChannel};
pub use config::{ConfigError, SyncSettings};
pub use crypto::{
    derive_shared_secret, AeadCipher, ChannelKeys, CryptoError, CryptoIdentity, KeyAgreement,
    QrScanner, ScanError, X25519KeyAgreement, XChaChaCipher, KEY_SIZE, NONCE_SIZE,
};
pub use discovery::{spawn_discovery, DiscoveryConfig, DiscoveryEvent, DiscoveryHandle};
pub use engine::{EngineBuilder, PairingQr, SyncEngine, SyncReport, APP_VERSION};
pub use error::{EngineError, PersistError, Result, StoreError};
pub use persist::{FileStateStore, MemoryStateStore, PersistedState, StateStore};
pub use store::{DataStore, JsonFileStore, MemoryStore};
pub use transport::{
    Connector, MockNetwork, MockTransport, TcpConnector, TcpTransport, Transport, TransportError,
    TransportListener,
};
