//! Mock transport for testing.
//!
//! [`MockTransport::pair`] links two in-memory endpoints through queues, so
//! two engines can talk to each other without sockets. [`MockNetwork`]
//! routes connects to listening endpoints by address and records every
//! attempt.

use super::{Connector, Transport, TransportError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// One end of an in-memory link.
///
/// Captures sent messages for verification and supports forced failures.
#[derive(Clone)]
pub struct MockTransport {
    inner: Arc<Mutex<MockTransportInner>>,
    inbound: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>,
}

struct MockTransportInner {
    connected: bool,
    peer_address: Option<String>,
    outbound: Option<mpsc::UnboundedSender<Vec<u8>>>,
    sent_messages: Vec<Vec<u8>>,
    fail_next_send: Option<String>,
    fail_next_recv: Option<String>,
    close_after_sends: Option<usize>,
}

impl MockTransport {
    /// Create two linked, connected endpoints.
    pub fn pair(a_address: &str, b_address: &str) -> (Self, Self) {
        let (to_b, from_a) = mpsc::unbounded_channel();
        let (to_a, from_b) = mpsc::unbounded_channel();
        (
            Self::endpoint(to_b, from_b, b_address),
            Self::endpoint(to_a, from_a, a_address),
        )
    }

    fn endpoint(
        outbound: mpsc::UnboundedSender<Vec<u8>>,
        inbound: mpsc::UnboundedReceiver<Vec<u8>>,
        peer_address: &str,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockTransportInner {
                connected: true,
                peer_address: Some(peer_address.to_string()),
                outbound: Some(outbound),
                sent_messages: Vec::new(),
                fail_next_send: None,
                fail_next_recv: None,
                close_after_sends: None,
            })),
            inbound: Arc::new(tokio::sync::Mutex::new(inbound)),
        }
    }

    /// Get all messages that were sent.
    pub fn sent_messages(&self) -> Vec<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        inner.sent_messages.clone()
    }

    /// Get the last message that was sent.
    pub fn last_sent(&self) -> Option<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        inner.sent_messages.last().cloned()
    }

    /// Cause the next send() to fail with the given error.
    pub fn fail_next_send(&self, error: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_next_send = Some(error.to_string());
    }

    /// Cause the next recv() to fail with the given error.
    pub fn fail_next_recv(&self, error: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_next_recv = Some(error.to_string());
    }

    /// Drop the link after `count` more successful sends.
    pub fn close_after_sends(&self, count: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.close_after_sends = Some(count);
    }

    fn shut(inner: &mut MockTransportInner) {
        inner.connected = false;
        inner.outbound = None;
    }
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("MockTransport")
            .field("connected", &inner.connected)
            .field("peer_address", &inner.peer_address)
            .field("sent", &inner.sent_messages.len())
            .finish()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();

        if !inner.connected {
            return Err(TransportError::NotConnected);
        }

        // Check for forced failure
        if let Some(error) = inner.fail_next_send.take() {
            return Err(TransportError::SendFailed(error));
        }

        let outbound = inner.outbound.as_ref().ok_or(TransportError::NotConnected)?;
        outbound
            .send(data.to_vec())
            .map_err(|_| TransportError::ConnectionClosed)?;
        inner.sent_messages.push(data.to_vec());

        if let Some(remaining) = inner.close_after_sends.as_mut() {
            if *remaining <= 1 {
                Self::shut(&mut inner);
            } else {
                *remaining -= 1;
            }
        }
        Ok(())
    }

    async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        {
            let mut inner = self.inner.lock().unwrap();

            if !inner.connected {
                return Err(TransportError::NotConnected);
            }

            // Check for forced failure
            if let Some(error) = inner.fail_next_recv.take() {
                return Err(TransportError::ReceiveFailed(error));
            }
        }

        let mut inbound = self.inbound.lock().await;
        inbound.recv().await.ok_or(TransportError::ConnectionClosed)
    }

    fn is_connected(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.connected
    }

    fn peer_address(&self) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner.peer_address.clone()
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        Self::shut(&mut inner);
        Ok(())
    }
}

/// In-memory network routing connects to listeners by address.
#[derive(Clone, Default)]
pub struct MockNetwork {
    inner: Arc<Mutex<MockNetworkInner>>,
}

#[derive(Default)]
struct MockNetworkInner {
    listeners: HashMap<String, mpsc::UnboundedSender<MockTransport>>,
    connect_attempts: Vec<String>,
    fail_next_connect: Option<String>,
    close_next_after_sends: Option<usize>,
    client_ends: Vec<MockTransport>,
}

impl MockNetwork {
    /// Create an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept connections to `address`. Each connect yields the server end
    /// on the returned queue.
    pub fn listen(&self, address: &str) -> mpsc::UnboundedReceiver<MockTransport> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap();
        inner.listeners.insert(address.to_string(), tx);
        rx
    }

    /// Every address a connect was attempted to, in order.
    pub fn connect_attempts(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner.connect_attempts.clone()
    }

    /// Client ends of every successful connect, in order.
    pub fn client_ends(&self) -> Vec<MockTransport> {
        let inner = self.inner.lock().unwrap();
        inner.client_ends.clone()
    }

    /// Cause the next connect() to fail with the given error.
    pub fn fail_next_connect(&self, error: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_next_connect = Some(error.to_string());
    }

    /// Drop the next connection after its client end has sent `count` times.
    pub fn close_next_after_sends(&self, count: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.close_next_after_sends = Some(count);
    }
}

#[async_trait]
impl Connector for MockNetwork {
    async fn connect(&self, address: &str) -> Result<Box<dyn Transport>, TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.connect_attempts.push(address.to_string());

        // Check for forced failure
        if let Some(error) = inner.fail_next_connect.take() {
            return Err(TransportError::ConnectionFailed(error));
        }

        let listener = inner
            .listeners
            .get(address)
            .cloned()
            .ok_or_else(|| TransportError::ConnectionFailed(format!("no listener at {address}")))?;
        let (client, server) = MockTransport::pair("mock-client", address);
        if let Some(count) = inner.close_next_after_sends.take() {
            client.close_after_sends(count);
        }
        listener
            .send(server)
            .map_err(|_| TransportError::ConnectionFailed(format!("{address} stopped listening")))?;
        inner.client_ends.push(client.clone());
        Ok(Box::new(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ===========================================
    // MockTransport Basic Tests
    // ===========================================

    #[tokio::test]
    async fn pair_delivers_in_order() {
        let (a, b) = MockTransport::pair("a", "b");
        a.send(b"message 1").await.unwrap();
        a.send(b"message 2").await.unwrap();

        assert_eq!(b.recv().await.unwrap(), b"message 1");
        assert_eq!(b.recv().await.unwrap(), b"message 2");
        assert_eq!(a.sent_messages().len(), 2);
        assert_eq!(a.last_sent(), Some(b"message 2".to_vec()));
        assert_eq!(a.peer_address().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn close_ends_peer_recv() {
        let (a, b) = MockTransport::pair("a", "b");
        a.close().await.unwrap();

        assert!(!a.is_connected());
        assert!(matches!(b.recv().await, Err(TransportError::ConnectionClosed)));
        assert!(matches!(a.send(b"x").await, Err(TransportError::NotConnected)));
        assert!(matches!(a.recv().await, Err(TransportError::NotConnected)));
    }

    #[tokio::test]
    async fn queued_messages_survive_close() {
        let (a, b) = MockTransport::pair("a", "b");
        a.send(b"last words").await.unwrap();
        a.close().await.unwrap();

        assert_eq!(b.recv().await.unwrap(), b"last words");
        assert!(matches!(b.recv().await, Err(TransportError::ConnectionClosed)));
    }

    // ===========================================
    // Error Condition Tests
    // ===========================================

    #[tokio::test]
    async fn forced_send_failure() {
        let (a, _b) = MockTransport::pair("a", "b");
        a.fail_next_send("buffer full");

        let result = a.send(b"data").await;
        assert!(matches!(result, Err(TransportError::SendFailed(_))));

        // Next send should work
        a.send(b"data").await.unwrap();
    }

    #[tokio::test]
    async fn forced_recv_failure() {
        let (a, b) = MockTransport::pair("a", "b");
        a.send(b"data").await.unwrap();
        b.fail_next_recv("timeout");

        let result = b.recv().await;
        assert!(matches!(result, Err(TransportError::ReceiveFailed(_))));

        // Next recv should work (and get the queued data)
        assert_eq!(b.recv().await.unwrap(), b"data");
    }

    #[tokio::test]
    async fn close_after_sends_drops_link() {
        let (a, b) = MockTransport::pair("a", "b");
        a.close_after_sends(2);
        a.send(b"1").await.unwrap();
        a.send(b"2").await.unwrap();
        assert!(!a.is_connected());

        assert_eq!(b.recv().await.unwrap(), b"1");
        assert_eq!(b.recv().await.unwrap(), b"2");
        assert!(matches!(b.recv().await, Err(TransportError::ConnectionClosed)));
    }

    // ===========================================
    // MockNetwork Tests
    // ===========================================

    #[tokio::test]
    async fn network_routes_to_listener() {
        let network = MockNetwork::new();
        let mut incoming = network.listen("10.0.0.2:47801");

        let client = network.connect("10.0.0.2:47801").await.unwrap();
        let server = incoming.recv().await.unwrap();

        client.send(b"hello").await.unwrap();
        assert_eq!(server.recv().await.unwrap(), b"hello");
        assert_eq!(network.connect_attempts(), vec!["10.0.0.2:47801".to_string()]);
        assert_eq!(network.client_ends().len(), 1);
    }

    #[tokio::test]
    async fn network_connect_failures() {
        let network = MockNetwork::new();
        assert!(matches!(
            network.connect("10.0.0.9:1").await,
            Err(TransportError::ConnectionFailed(_))
        ));

        let _incoming = network.listen("10.0.0.2:47801");
        network.fail_next_connect("network unreachable");
        assert!(network.connect("10.0.0.2:47801").await.is_err());
        assert!(network.connect("10.0.0.2:47801").await.is_ok());
        assert_eq!(network.connect_attempts().len(), 3);
    }

    #[tokio::test]
    async fn network_drops_next_connection_after_sends() {
        let network = MockNetwork::new();
        let mut incoming = network.listen("10.0.0.2:47801");
        network.close_next_after_sends(1);

        let first = network.connect("10.0.0.2:47801").await.unwrap();
        let _server = incoming.recv().await.unwrap();
        first.send(b"only").await.unwrap();
        assert!(!first.is_connected());

        let second = network.connect("10.0.0.2:47801").await.unwrap();
        second.send(b"a").await.unwrap();
        second.send(b"b").await.unwrap();
        assert!(second.is_connected());
    }

    #[tokio::test]
    async fn connect_to_missing_listener_keeps_pending_drop() {
        let network = MockNetwork::new();
        let mut incoming = network.listen("10.0.0.2:47801");
        network.close_next_after_sends(1);

        assert!(network.connect("10.0.0.9:47801").await.is_err());

        let client = network.connect("10.0.0.2:47801").await.unwrap();
        let _server = incoming.recv().await.unwrap();
        client.send(b"only").await.unwrap();
        assert!(!client.is_connected());
        assert_eq!(network.connect_attempts().len(), 2);
    }
}
