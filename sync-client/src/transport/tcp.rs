//! LAN TCP transport.
//!
//! Frames are a 4-byte big-endian length followed by one encoded envelope.
//! A reader task per connection pushes complete frames into a bounded
//! inbound queue that `recv()` drains, preserving per-peer ordering.

use super::{Connector, Transport, TransportError};
use async_trait::async_trait;
use classsync_types::MAX_MESSAGE_SIZE;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// Inbound frames buffered per connection.
const INBOUND_QUEUE: usize = 32;

/// Up-front allocation for one frame; larger frames grow as data arrives.
const READ_CHUNK: usize = 64 * 1024;

/// Read one length-prefixed frame. `Ok(None)` on clean EOF.
pub(crate) async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(TransportError::ReceiveFailed(e.to_string())),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(TransportError::FrameTooLarge {
            size: len,
            limit: MAX_MESSAGE_SIZE,
        });
    }

    // Grow with the bytes that arrive, not with the claimed length.
    let mut buf = Vec::with_capacity(len.min(READ_CHUNK));
    reader
        .take(len as u64)
        .read_to_end(&mut buf)
        .await
        .map_err(|e| TransportError::ReceiveFailed(e.to_string()))?;
    if buf.len() != len {
        return Err(TransportError::ReceiveFailed(format!(
            "connection closed after {} of {len} frame bytes",
            buf.len()
        )));
    }
    Ok(Some(buf))
}

/// Write one length-prefixed frame.
pub(crate) async fn write_frame<W>(writer: &mut W, data: &[u8]) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    if data.len() > MAX_MESSAGE_SIZE {
        return Err(TransportError::FrameTooLarge {
            size: data.len(),
            limit: MAX_MESSAGE_SIZE,
        });
    }
    let len = (data.len() as u32).to_be_bytes();
    writer
        .write_all(&len)
        .await
        .map_err(|e| TransportError::SendFailed(e.to_string()))?;
    writer
        .write_all(data)
        .await
        .map_err(|e| TransportError::SendFailed(e.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|e| TransportError::SendFailed(e.to_string()))
}

/// One TCP connection to a peer.
pub struct TcpTransport {
    writer: Mutex<OwnedWriteHalf>,
    inbound: Mutex<mpsc::Receiver<Result<Vec<u8>, TransportError>>>,
    connected: Arc<AtomicBool>,
    peer: SocketAddr,
    reader: JoinHandle<()>,
}

impl TcpTransport {
    /// Wrap a connected stream and start its reader task.
    pub fn from_stream(stream: TcpStream) -> Result<Self, TransportError> {
        let peer = stream
            .peer_addr()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        let _ = stream.set_nodelay(true);
        let (mut read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
        let connected = Arc::new(AtomicBool::new(true));

        let flag = Arc::clone(&connected);
        let reader = tokio::spawn(async move {
            loop {
                match read_frame(&mut read_half).await {
                    Ok(Some(frame)) => {
                        if tx.send(Ok(frame)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        tracing::debug!(%peer, "Peer closed connection");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(%peer, error = %e, "Frame read failed");
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                }
            }
            flag.store(false, Ordering::SeqCst);
        });

        Ok(Self {
            writer: Mutex::new(write_half),
            inbound: Mutex::new(rx),
            connected,
            peer,
            reader,
        })
    }

    /// Remote socket address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("peer", &self.peer)
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, data).await
    }

    async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        let mut inbound = self.inbound.lock().await;
        match inbound.recv().await {
            Some(frame) => frame,
            None => Err(TransportError::ConnectionClosed),
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn peer_address(&self) -> Option<String> {
        Some(self.peer.to_string())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        let mut writer = self.writer.lock().await;
        writer
            .shutdown()
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }
}

/// Opens TCP connections with a bounded connect timeout.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    /// Create a connector.
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, address: &str) -> Result<Box<dyn Transport>, TransportError> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::ConnectionFailed(format!("{address}: {e}")))?;
        tracing::debug!(%address, "TCP connection established");
        Ok(Box::new(TcpTransport::from_stream(stream)?))
    }
}

/// Accepts inbound sync connections.
#[derive(Debug)]
pub struct TransportListener {
    listener: TcpListener,
}

impl TransportListener {
    /// Bind to `address` (`ip:port`; port 0 picks a free one).
    pub async fn bind(address: &str) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("bind {address}: {e}")))?;
        Ok(Self { listener })
    }

    /// Bound address.
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.listener
            .local_addr()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))
    }

    /// Wait for the next connection.
    pub async fn accept(&self) -> Result<TcpTransport, TransportError> {
        let (stream, peer) = self
            .listener
            .accept()
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        tracing::debug!(%peer, "Accepted connection");
        TcpTransport::from_stream(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn linked() -> (Box<dyn Transport>, TcpTransport) {
        let listener = TransportListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let connector = TcpConnector::default();
        let (client, server) = tokio::join!(connector.connect(&address), listener.accept());
        (client.unwrap(), server.unwrap())
    }

    // ===========================================
    // Framing Tests
    // ===========================================

    #[tokio::test]
    async fn frame_roundtrip_in_memory() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"hello").await.unwrap();
        write_frame(&mut a, b"").await.unwrap();
        drop(a);

        assert_eq!(read_frame(&mut b).await.unwrap(), Some(b"hello".to_vec()));
        assert_eq!(read_frame(&mut b).await.unwrap(), Some(Vec::new()));
        assert_eq!(read_frame(&mut b).await.unwrap(), None);
    }

    #[tokio::test]
    async fn oversized_length_prefix_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&((MAX_MESSAGE_SIZE as u32) + 1).to_be_bytes())
            .await
            .unwrap();

        assert!(matches!(
            read_frame(&mut b).await,
            Err(TransportError::FrameTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn large_frame_arrives_in_pieces() {
        let payload = vec![0xAB; 3 * READ_CHUNK + 17];
        let (mut a, mut b) = tokio::io::duplex(4096);
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            write_frame(&mut a, &payload).await.unwrap();
        });

        assert_eq!(read_frame(&mut b).await.unwrap(), Some(expected));
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn claimed_length_without_data_is_receive_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&(MAX_MESSAGE_SIZE as u32).to_be_bytes()).await.unwrap();
        a.write_all(b"tiny").await.unwrap();
        drop(a);

        match read_frame(&mut b).await {
            Err(TransportError::ReceiveFailed(message)) => {
                assert!(message.contains(&format!("4 of {MAX_MESSAGE_SIZE}")))
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn truncated_frame_is_receive_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&10u32.to_be_bytes()).await.unwrap();
        a.write_all(b"abc").await.unwrap();
        drop(a);

        assert!(matches!(
            read_frame(&mut b).await,
            Err(TransportError::ReceiveFailed(_))
        ));
    }

    // ===========================================
    // Socket Tests
    // ===========================================

    #[tokio::test]
    async fn tcp_exchange_both_directions() {
        let (client, server) = linked().await;

        client.send(b"ping").await.unwrap();
        assert_eq!(server.recv().await.unwrap(), b"ping");

        server.send(b"pong").await.unwrap();
        assert_eq!(client.recv().await.unwrap(), b"pong");
        assert!(client.peer_address().is_some());
    }

    #[tokio::test]
    async fn close_is_seen_by_peer() {
        let (client, server) = linked().await;
        client.close().await.unwrap();

        assert!(matches!(
            server.recv().await,
            Err(TransportError::ConnectionClosed)
        ));
        assert!(matches!(
            client.send(b"x").await,
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails() {
        let listener = TransportListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        assert!(TcpConnector::new(Duration::from_secs(2))
            .connect(&address)
            .await
            .is_err());
    }
}
