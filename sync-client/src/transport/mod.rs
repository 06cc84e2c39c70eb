//! Transport abstraction for classsync.
//!
//! This module provides a pluggable transport layer that abstracts
//! the underlying connection mechanism (LAN TCP, mock for testing).
//!
//! # Design
//!
//! A [`Transport`] is one established, connection-oriented link to a peer:
//! - `send()` transmits one encoded envelope
//! - `recv()` yields the next envelope from the inbound queue
//! - `close()` gracefully terminates
//!
//! A [`Connector`] opens outbound transports by address. The responder side
//! receives transports from a listener instead.
//!
//! # Example
//!
//! ```ignore
//! let transport = TcpConnector::default().connect("192.168.1.20:47801").await?;
//! transport.send(&envelope_bytes).await?;
//! let response = transport.recv().await?;
//! ```

mod mock;
mod tcp;

pub use mock::{MockNetwork, MockTransport};
pub use tcp::{TcpConnector, TcpTransport, TransportListener};

use async_trait::async_trait;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Not connected.
    #[error("not connected")]
    NotConnected,

    /// Connection closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Send failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Receive failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// A frame exceeds the protocol limit.
    #[error("frame too large: {size} bytes (limit: {limit} bytes)")]
    FrameTooLarge {
        /// Frame size.
        size: usize,
        /// Maximum allowed size.
        limit: usize,
    },

    /// Connection timeout.
    #[error("connection timeout")]
    Timeout,
}

/// An established link to one peer carrying encoded envelopes.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one encoded envelope.
    async fn send(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Receive the next envelope.
    ///
    /// Blocks until data is available or the connection closes.
    async fn recv(&self) -> Result<Vec<u8>, TransportError>;

    /// Check if currently connected.
    fn is_connected(&self) -> bool;

    /// Remote address, when known.
    fn peer_address(&self) -> Option<String>;

    /// Close the connection gracefully.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Opens outbound transports.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to `address` (`ip:port`).
    async fn connect(&self, address: &str) -> Result<Box<dyn Transport>, TransportError>;
}
