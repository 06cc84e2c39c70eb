//! LAN presence discovery over UDP broadcast.
//!
//! Two background tasks per engine:
//! - the broadcaster sends our [`DiscoveryAnnouncement`] every interval
//! - the listener decodes peer announcements and forwards them into an
//!   `mpsc` queue owned by the engine
//!
//! Announcements are unauthenticated and carry only public identity fields.
//! Each one doubles as a heartbeat for the directory's offline detection.

use classsync_types::{now_millis, DeviceId, DiscoveryAnnouncement, MAX_MESSAGE_SIZE};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::interval;

use crate::channel::MessageChannel;
use crate::transport::TransportError;

/// Largest datagram we accept.
const MAX_DATAGRAM: usize = 64 * 1024;

/// A peer announcement heard on the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryEvent {
    /// The decoded announcement.
    pub announcement: DiscoveryAnnouncement,
    /// Source IP of the datagram.
    pub ip_address: String,
    /// Receive time (Unix millis).
    pub received_at: u64,
}

/// Where to listen and where to broadcast.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Local address for the listener socket.
    pub listen: SocketAddr,
    /// Destination of our announcements.
    pub target: SocketAddr,
    /// Time between announcements.
    pub interval: Duration,
}

impl DiscoveryConfig {
    /// Broadcast on the local network using `port`.
    pub fn lan(port: u16, interval: Duration) -> Self {
        Self {
            listen: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)),
            target: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, port)),
            interval,
        }
    }
}

/// Running discovery tasks. Dropping the handle stops them.
#[derive(Debug)]
pub struct DiscoveryHandle {
    broadcaster: JoinHandle<()>,
    listener: JoinHandle<()>,
    listen_addr: SocketAddr,
}

impl DiscoveryHandle {
    /// Address the listener is bound to.
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// Stop both tasks.
    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for DiscoveryHandle {
    fn drop(&mut self) {
        self.broadcaster.abort();
        self.listener.abort();
    }
}

/// Bind the sockets and spawn the broadcaster and listener tasks.
pub async fn spawn_discovery(
    channel: MessageChannel,
    announcement: DiscoveryAnnouncement,
    config: DiscoveryConfig,
    events: mpsc::Sender<DiscoveryEvent>,
) -> Result<DiscoveryHandle, TransportError> {
    let listen_socket = UdpSocket::bind(config.listen)
        .await
        .map_err(|e| TransportError::ConnectionFailed(format!("bind {}: {e}", config.listen)))?;
    let listen_addr = listen_socket
        .local_addr()
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

    let unspecified = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
    let send_socket = UdpSocket::bind(unspecified)
        .await
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
    send_socket
        .set_broadcast(true)
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

    let datagram = channel
        .encode_discovery(&announcement)
        .map_err(|e| TransportError::SendFailed(e.to_string()))?;
    let local_id = announcement.identity.id;

    tracing::info!(
        listen = %listen_addr,
        target = %config.target,
        "Discovery started (interval: {:?})",
        config.interval
    );

    let broadcaster = spawn_broadcaster(send_socket, datagram, config.target, config.interval);
    let listener = spawn_listener(listen_socket, local_id, events);

    Ok(DiscoveryHandle {
        broadcaster,
        listener,
        listen_addr,
    })
}

fn spawn_broadcaster(
    socket: UdpSocket,
    datagram: Vec<u8>,
    target: SocketAddr,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = interval(every);
        loop {
            timer.tick().await;
            if let Err(e) = socket.send_to(&datagram, target).await {
                tracing::debug!(%target, error = %e, "Discovery broadcast failed");
            }
        }
    })
}

fn spawn_listener(
    socket: UdpSocket,
    local_id: DeviceId,
    events: mpsc::Sender<DiscoveryEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_DATAGRAM.min(MAX_MESSAGE_SIZE)];
        loop {
            let (len, from) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    tracing::warn!(error = %e, "Discovery receive failed");
                    continue;
                }
            };
            let announcement = match MessageChannel::decode_discovery(&buf[..len]) {
                Ok(announcement) => announcement,
                Err(e) => {
                    tracing::debug!(%from, error = %e, "Ignoring malformed discovery datagram");
                    continue;
                }
            };
            if announcement.identity.id == local_id {
                continue;
            }
            let event = DiscoveryEvent {
                announcement,
                ip_address: from.ip().to_string(),
                received_at: now_millis(),
            };
            if events.send(event).await.is_err() {
                tracing::debug!("Discovery queue closed, stopping listener");
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CryptoIdentity, XChaChaCipher};
    use std::sync::Arc;

    fn channel(name: &str) -> MessageChannel {
        MessageChannel::new(
            Arc::new(CryptoIdentity::generate(name).unwrap()),
            Arc::new(XChaChaCipher),
        )
    }

    fn announcement(channel: &MessageChannel) -> DiscoveryAnnouncement {
        DiscoveryAnnouncement {
            identity: channel.identity().identity().clone(),
            port: 47801,
            app_version: "1.0.0".into(),
        }
    }

    fn loopback(port: u16) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
    }

    #[tokio::test]
    async fn peers_hear_each_other() {
        let alice = channel("Alice");
        let bob = channel("Bob");

        let (tx, mut rx) = mpsc::channel(8);
        let listening = spawn_discovery(
            alice.clone(),
            announcement(&alice),
            DiscoveryConfig {
                listen: loopback(0),
                target: loopback(9),
                interval: Duration::from_secs(60),
            },
            tx,
        )
        .await
        .unwrap();

        let (bob_tx, _bob_rx) = mpsc::channel(8);
        let _speaking = spawn_discovery(
            bob.clone(),
            announcement(&bob),
            DiscoveryConfig {
                listen: loopback(0),
                target: listening.listen_addr(),
                interval: Duration::from_millis(20),
            },
            bob_tx,
        )
        .await
        .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.announcement.identity.id, bob.local_id());
        assert_eq!(event.ip_address, "127.0.0.1");
    }

    #[tokio::test]
    async fn own_announcements_and_junk_are_ignored() {
        let alice = channel("Alice");
        let (tx, mut rx) = mpsc::channel(8);
        let handle = spawn_discovery(
            alice.clone(),
            announcement(&alice),
            DiscoveryConfig {
                listen: loopback(0),
                target: loopback(9),
                interval: Duration::from_secs(60),
            },
            tx,
        )
        .await
        .unwrap();

        let probe = UdpSocket::bind(loopback(0)).await.unwrap();
        let own = alice.encode_discovery(&announcement(&alice)).unwrap();
        probe.send_to(&own, handle.listen_addr()).await.unwrap();
        probe.send_to(b"garbage", handle.listen_addr()).await.unwrap();

        let waited = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(waited.is_err());
    }

    #[test]
    fn lan_config_targets_broadcast() {
        let config = DiscoveryConfig::lan(47800, Duration::from_secs(2));
        assert_eq!(config.target.to_string(), "255.255.255.255:47800");
        assert_eq!(config.listen.port(), 47800);
    }
}
