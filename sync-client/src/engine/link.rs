//! One authenticated link to a peer for the length of a session.

use classsync_types::{
    Dataset, DeviceId, DeviceIdentity, Disconnect, Envelope, Message, SyncPacket, VectorClock,
};
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;

use crate::channel::MessageChannel;
use crate::crypto::ChannelKeys;
use crate::error::{EngineError, Result};
use crate::transport::{Transport, TransportError};

/// Race `fut` against the session's cancel signal.
pub(crate) async fn cancellable<T>(
    cancel: &mut watch::Receiver<u64>,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.changed() => Err(EngineError::Cancelled),
        result = fut => result,
    }
}

/// Apply the network timeout to a transport operation.
pub(crate) async fn timed<T>(
    limit: Duration,
    fut: impl Future<Output = std::result::Result<T, TransportError>>,
) -> Result<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(EngineError::from),
        Err(_) => Err(EngineError::NetworkTimeout),
    }
}

pub(crate) async fn send_envelope(
    transport: &dyn Transport,
    envelope: &Envelope,
    limit: Duration,
) -> Result<()> {
    let bytes = envelope.to_bytes()?;
    timed(limit, transport.send(&bytes)).await
}

pub(crate) async fn recv_envelope(transport: &dyn Transport, limit: Duration) -> Result<Envelope> {
    let bytes = timed(limit, transport.recv()).await?;
    Ok(Envelope::from_bytes(&bytes)?)
}

/// Error for a message that arrived out of sequence.
pub(crate) fn unexpected(expected: &str, message: Message) -> EngineError {
    match message {
        Message::Disconnect(Disconnect { reason }) => EngineError::Protocol(format!(
            "peer disconnected: {}",
            reason.as_deref().unwrap_or("no reason given")
        )),
        other => EngineError::Protocol(format!("expected {expected}, got {}", other.name())),
    }
}

/// Transport plus the keys and identity of the peer on the other end.
///
/// Every send and receive is bounded by the network timeout and aborted by
/// the session's cancel signal.
pub(crate) struct PeerLink {
    transport: Box<dyn Transport>,
    channel: MessageChannel,
    keys: ChannelKeys,
    peer: DeviceIdentity,
    timeout: Duration,
    cancel: watch::Receiver<u64>,
}

impl PeerLink {
    pub(crate) fn new(
        transport: Box<dyn Transport>,
        channel: MessageChannel,
        keys: ChannelKeys,
        peer: DeviceIdentity,
        timeout: Duration,
        cancel: watch::Receiver<u64>,
    ) -> Self {
        Self {
            transport,
            channel,
            keys,
            peer,
            timeout,
            cancel,
        }
    }

    pub(crate) fn peer_id(&self) -> DeviceId {
        self.peer.id
    }

    pub(crate) fn peer_name(&self) -> &str {
        &self.peer.name
    }

    pub(crate) async fn send(&mut self, message: &Message) -> Result<()> {
        let envelope = self.channel.seal(message, &self.keys)?;
        tracing::debug!(peer = %self.peer.id, message = message.name(), "Sending");
        cancellable(
            &mut self.cancel,
            send_envelope(self.transport.as_ref(), &envelope, self.timeout),
        )
        .await
    }

    pub(crate) async fn recv(&mut self) -> Result<Message> {
        self.recv_within(self.timeout).await
    }

    /// Receive with a custom timeout.
    pub(crate) async fn recv_within(&mut self, limit: Duration) -> Result<Message> {
        let envelope =
            cancellable(&mut self.cancel, recv_envelope(self.transport.as_ref(), limit)).await?;
        if envelope.sender_id != self.peer.id {
            return Err(EngineError::Authentication(format!(
                "unexpected sender {}",
                envelope.sender_id
            )));
        }
        let message = self.channel.open(&envelope, &self.keys, &self.peer.public_key)?;
        tracing::debug!(peer = %self.peer.id, message = message.name(), "Received");
        Ok(message)
    }

    pub(crate) fn seal_packet(&self, clock: VectorClock, dataset: &Dataset) -> Result<SyncPacket> {
        Ok(self.channel.seal_packet(&self.keys, clock, dataset)?)
    }

    /// Decrypt a packet, checking that the peer authored it.
    pub(crate) fn open_packet(&self, packet: &SyncPacket) -> Result<Dataset> {
        if packet.device_id != self.peer.id {
            return Err(EngineError::Authentication(
                "packet author does not match sender".into(),
            ));
        }
        Ok(self.channel.open_packet(&self.keys, packet)?)
    }

    /// Fail if the session was cancelled since the link was opened.
    pub(crate) fn ensure_live(&self) -> Result<()> {
        match self.cancel.has_changed() {
            Ok(false) => Ok(()),
            _ => Err(EngineError::Cancelled),
        }
    }

    /// Send a best-effort `disconnect`.
    pub(crate) async fn disconnect(&mut self, reason: &str) {
        let message = Message::Disconnect(Disconnect::because(reason));
        let sent = match self.channel.seal(&message, &self.keys) {
            Ok(envelope) => send_envelope(self.transport.as_ref(), &envelope, self.timeout).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = sent {
            tracing::debug!(peer = %self.peer.id, error = %e, "Disconnect not delivered");
        }
    }

    /// Wait briefly for the peer's `disconnect`; anything else is ignored.
    pub(crate) async fn await_disconnect(&mut self) {
        match recv_envelope(self.transport.as_ref(), self.timeout).await {
            Ok(envelope) => tracing::debug!(peer = %self.peer.id, sender = %envelope.sender_id, "Peer closed session"),
            Err(e) => tracing::debug!(peer = %self.peer.id, error = %e, "Link ended"),
        }
    }

    pub(crate) async fn close(self) {
        if let Err(e) = self.transport.close().await {
            tracing::debug!(peer = %self.peer.id, error = %e, "Close failed");
        }
    }
}
