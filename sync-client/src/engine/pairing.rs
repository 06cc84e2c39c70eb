//! Pairing over a QR code, and the responder's entry point.
//!
//! The host displays a QR code holding a one-time X25519 public key. The
//! client answers with its own ephemeral key in a `pair_request` sealed under
//! keys from the raw agreement; both sides then derive the long-lived shared
//! secret, and the client's `pair_confirm` proves it under that secret.

use classsync_core::{
    Event, PairedDevice, PairingError, PairingSession, QrCodeData, Role, SecretBytes,
};
use classsync_types::{
    now_millis, DeviceId, Envelope, Message, MessageType, PairAccept, PairConfirm, PairReject,
    PairRequest, RejectReason, SessionId, SyncRequest,
};
use tokio::sync::{watch, MutexGuard};

use super::link::{cancellable, recv_envelope, send_envelope, unexpected, PeerLink};
use super::{PairingQr, SyncEngine, SyncReport};
use crate::crypto::{derive_shared_secret, ChannelKeys, QrScanner};
use crate::error::{EngineError, Result};
use crate::store::DataStore;
use crate::transport::{Connector, Transport};

impl<S, C> SyncEngine<S, C>
where
    S: DataStore + 'static,
    C: Connector + 'static,
{
    // ===========================================
    // Host: QR codes
    // ===========================================

    /// Open a pairing session and return its QR code.
    ///
    /// `ip_address` is the LAN address peers should connect to; the port is
    /// the configured sync port.
    pub async fn create_pairing_qr(&self, ip_address: &str) -> Result<PairingQr> {
        let (public, secret) = self.inner.agreement.generate_ephemeral()?;
        let now = now_millis();
        let session = PairingSession::new(
            self.local_identity(),
            ip_address,
            self.inner.settings.sync_port,
            self.inner.app_version.clone(),
            public,
            secret,
            now,
            self.inner.settings.pairing_ttl(),
        )?;
        let qr = PairingQr {
            data: session.qr.clone(),
            payload: session.qr_payload.clone(),
        };

        let mut sessions = self.inner.pairing.lock().await;
        for expired in sessions.purge_expired(now) {
            tracing::debug!(session = %expired, "Dropped finished pairing session");
        }
        sessions.insert(session);
        tracing::info!(
            session = %qr.data.session_id,
            address = %qr.data.address(),
            "Pairing QR code created"
        );
        Ok(qr)
    }

    // ===========================================
    // Client: scan and pair
    // ===========================================

    /// Pair using the text of a scanned QR code, then run the first round.
    ///
    /// An invalid or expired payload fails before any connection is made
    /// and leaves the engine state unchanged.
    pub async fn pair_with_qr(&self, payload: &str) -> Result<SyncReport> {
        let qr = QrCodeData::consume(payload, now_millis())?;
        if qr.device_id == self.local_id() {
            return Err(EngineError::QrInvalid("QR code belongs to this device".into()));
        }

        let _session = self.inner.session.lock().await;
        let cancel = self
            .begin_session(Event::PeerSelected {
                peer: Some(qr.device_id),
            })
            .await?;
        let result = self.pair_and_sync(&qr, cancel).await;
        self.finish(result).await
    }

    /// Scan a QR code with `scanner`, then pair with it.
    pub async fn pair_with_scanner(&self, scanner: &dyn QrScanner) -> Result<SyncReport> {
        let payload = scanner.scan().await?;
        self.pair_with_qr(&payload).await
    }

    async fn pair_and_sync(
        &self,
        qr: &QrCodeData,
        mut cancel: watch::Receiver<u64>,
    ) -> Result<SyncReport> {
        let timeout = self.inner.settings.network_timeout();
        let transport = self.connect(&qr.address(), &mut cancel).await?;
        self.transition(Event::TransportOpened { paired: false }).await;

        let agreement = self.inner.agreement.as_ref();
        let (ephemeral_public, ephemeral_secret) = agreement.generate_ephemeral()?;
        let pairing_keys = ChannelKeys::for_pairing(agreement, &ephemeral_secret, &qr.public_key)?;

        let request = Message::PairRequest(PairRequest {
            identity: self.local_identity().clone(),
            session_id: qr.session_id,
            app_version: self.inner.app_version.clone(),
            checksum: qr.checksum.clone(),
        });
        let envelope = self
            .inner
            .channel
            .seal_with_ephemeral(&request, &pairing_keys, ephemeral_public)?;
        cancellable(&mut cancel, send_envelope(transport.as_ref(), &envelope, timeout)).await?;
        tracing::debug!(session = %qr.session_id, host = %qr.device_id, "Sent pair request");

        let reply = cancellable(&mut cancel, recv_envelope(transport.as_ref(), timeout)).await?;
        let host = match self.inner.channel.open_pairing(&reply, &pairing_keys)? {
            Message::PairAccept(accept) => accept.identity,
            Message::PairReject(reject) => {
                tracing::warn!(host = %reject.identity.id, reason = %reject.reason, "Pairing rejected");
                close_quietly(transport.as_ref()).await;
                return Err(EngineError::PairingRejected(reject.reason));
            }
            other => return Err(unexpected("pair_accept", other)),
        };
        if host.id != qr.device_id {
            close_quietly(transport.as_ref()).await;
            return Err(EngineError::Authentication(
                "host identity does not match the QR code".into(),
            ));
        }

        let shared_secret = derive_shared_secret(
            agreement,
            &ephemeral_secret,
            &qr.public_key,
            &qr.session_id,
            &self.local_id(),
            &host.id,
        )?;
        let keys = ChannelKeys::derive(&shared_secret)?;
        let mut link = PeerLink::new(
            transport,
            self.inner.channel.clone(),
            keys,
            host.clone(),
            timeout,
            cancel,
        );

        let result = async {
            link.send(&Message::PairConfirm(PairConfirm {
                session_id: qr.session_id,
            }))
            .await?;
            self.complete_pairing(PairedDevice {
                id: host.id,
                name: host.name.clone(),
                public_key: host.public_key,
                shared_secret,
                paired_at: now_millis(),
                last_sync_at: None,
            })
            .await?;
            self.run_initiator_round(&mut link).await
        }
        .await;

        if let Err(e) = &result {
            link.disconnect(&e.to_string()).await;
        }
        link.close().await;
        result
    }

    async fn complete_pairing(&self, device: PairedDevice) -> Result<()> {
        let peer = device.id;
        let name = device.name.clone();
        let actions = self.inner.state.lock().await.add_paired(device);
        self.dispatch(actions);
        self.persist().await?;
        self.transition(Event::PairingCompleted { peer }).await;
        tracing::info!(%peer, %name, "Paired");
        Ok(())
    }

    // ===========================================
    // Host: incoming sessions
    // ===========================================

    /// Serve one inbound connection: a pairing request against one of our
    /// QR codes, or a sync round from a paired device.
    ///
    /// Returns `Ok(None)` when a pairing completed without a sync round.
    /// Connections that fail authentication are closed without touching
    /// the engine state.
    pub async fn handle_incoming(&self, transport: Box<dyn Transport>) -> Result<Option<SyncReport>> {
        let timeout = self.inner.settings.network_timeout();

        let envelope = match recv_envelope(transport.as_ref(), timeout).await {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(peer = ?transport.peer_address(), error = %e, "No opening message");
                close_quietly(transport.as_ref()).await;
                return Err(e);
            }
        };
        if envelope.message_type()? == MessageType::PairRequest {
            let _session = self.inner.session.lock().await;
            return self.host_pairing(transport, envelope).await;
        }

        let opened = {
            let state = self.inner.state.lock().await;
            self.inner.channel.open_from(&envelope, state.directory())
        };
        let (peer, request) = match opened {
            Ok((peer, Message::SyncRequest(request))) => (peer, request),
            Ok((peer, other)) => {
                tracing::warn!(%peer, message = other.name(), "Session did not open with sync_request");
                close_quietly(transport.as_ref()).await;
                return Err(unexpected("sync_request", other));
            }
            Err(e) => {
                tracing::warn!(sender = %envelope.sender_id, error = %e, "Rejected incoming session");
                close_quietly(transport.as_ref()).await;
                return Err(e.into());
            }
        };

        let _session = match self.session_for_incoming(peer).await {
            Ok(guard) => guard,
            Err(e) => {
                close_quietly(transport.as_ref()).await;
                return Err(e);
            }
        };
        let cancel = match self.begin_session(Event::SyncRequestReceived { peer }).await {
            Ok(cancel) => cancel,
            Err(e) => {
                close_quietly(transport.as_ref()).await;
                return Err(e);
            }
        };
        let result = self.serve_sync(transport, peer, request, cancel).await;
        self.finish(result).await.map(Some)
    }

    /// Session slot for a sync request from `peer`.
    ///
    /// When both devices dialed each other, the lower device id abandons
    /// its own round and serves the peer's; the higher one refuses.
    /// Otherwise the request waits for the running session to end.
    async fn session_for_incoming(&self, peer: DeviceId) -> Result<MutexGuard<'_, ()>> {
        if let Ok(guard) = self.inner.session.try_lock() {
            return Ok(guard);
        }
        let dialing_peer = {
            let state = self.inner.state.lock().await;
            state.status().is_busy()
                && state.role() == Some(Role::Initiator)
                && state.current_peer() == Some(peer)
        };
        if dialing_peer {
            if self.local_id() > peer {
                tracing::info!(%peer, "Peer dialed us during our round, refusing");
                return Err(EngineError::Protocol(format!(
                    "engine is busy (syncing with {peer})"
                )));
            }
            tracing::info!(%peer, "Peer dialed us during our round, serving theirs");
            self.cancel().await;
        }
        Ok(self.inner.session.lock().await)
    }

    async fn serve_sync(
        &self,
        transport: Box<dyn Transport>,
        peer: DeviceId,
        request: SyncRequest,
        cancel: watch::Receiver<u64>,
    ) -> Result<SyncReport> {
        let device = {
            let mut state = self.inner.state.lock().await;
            state.record_heartbeat(&peer, now_millis());
            state.directory().paired(&peer).cloned()
        }
        .ok_or(EngineError::UnknownPeer(peer))?;

        let mut link = PeerLink::new(
            transport,
            self.inner.channel.clone(),
            ChannelKeys::derive(&device.shared_secret)?,
            device.identity(),
            self.inner.settings.network_timeout(),
            cancel,
        );
        let result = self.responder_round(&mut link, request).await;
        if let Err(e) = &result {
            link.disconnect(&e.to_string()).await;
        }
        link.close().await;
        result
    }

    async fn host_pairing(
        &self,
        transport: Box<dyn Transport>,
        envelope: Envelope,
    ) -> Result<Option<SyncReport>> {
        let Some(ephemeral_key) = envelope.ephemeral_key else {
            tracing::warn!(sender = %envelope.sender_id, "Pair request without ephemeral key");
            close_quietly(transport.as_ref()).await;
            return Err(EngineError::Protocol("pair_request without ephemeral key".into()));
        };

        // The session whose key decrypts the request is the one it answers.
        let matched = {
            let agreement = self.inner.agreement.as_ref();
            let sessions = self.inner.pairing.lock().await;
            let found = sessions
                .iter()
                .filter(|session| !session.status().is_terminal())
                .find_map(|session| {
                    let keys =
                        ChannelKeys::for_pairing(agreement, session.ephemeral_secret(), &ephemeral_key)
                            .ok()?;
                    match self.inner.channel.open_pairing(&envelope, &keys) {
                        Ok(Message::PairRequest(request)) => Some((session.session_id, keys, request)),
                        _ => None,
                    }
                });
            found
        };
        let Some((session_id, pairing_keys, request)) = matched else {
            tracing::warn!(sender = %envelope.sender_id, "Pair request matches no pairing session");
            close_quietly(transport.as_ref()).await;
            return Err(EngineError::Authentication(
                "pair request matches no pairing session".into(),
            ));
        };

        let cancel = match self.begin_session(Event::PairRequestReceived).await {
            Ok(cancel) => cancel,
            Err(e) => {
                close_quietly(transport.as_ref()).await;
                return Err(e);
            }
        };
        let result = self
            .host_handshake(transport, session_id, pairing_keys, request, ephemeral_key, cancel)
            .await;
        self.finish(result).await
    }

    async fn host_handshake(
        &self,
        transport: Box<dyn Transport>,
        session_id: SessionId,
        pairing_keys: ChannelKeys,
        request: PairRequest,
        ephemeral_key: [u8; 32],
        mut cancel: watch::Receiver<u64>,
    ) -> Result<Option<SyncReport>> {
        let timeout = self.inner.settings.network_timeout();
        let peer = request.identity.clone();

        let accepted: std::result::Result<SecretBytes, RejectReason> = {
            let mut sessions = self.inner.pairing.lock().await;
            match sessions.get_mut(&session_id) {
                Some(session) => session
                    .accept_request(&request, ephemeral_key, now_millis())
                    .map(|()| session.ephemeral_secret().clone()),
                None => Err(RejectReason::UnknownSession),
            }
        };
        let ephemeral_secret = match accepted {
            Ok(secret) => secret,
            Err(reason) => {
                tracing::warn!(peer = %peer.id, %reason, "Rejecting pair request");
                let reject = Message::PairReject(PairReject {
                    identity: self.local_identity().clone(),
                    reason,
                });
                let envelope = self.inner.channel.seal(&reject, &pairing_keys)?;
                if let Err(e) = send_envelope(transport.as_ref(), &envelope, timeout).await {
                    tracing::debug!(peer = %peer.id, error = %e, "Reject not delivered");
                }
                close_quietly(transport.as_ref()).await;
                return Err(EngineError::PairingRejected(reason));
            }
        };

        let shared_secret = derive_shared_secret(
            self.inner.agreement.as_ref(),
            &ephemeral_secret,
            &ephemeral_key,
            &session_id,
            &self.local_id(),
            &peer.id,
        )?;
        let accept = Message::PairAccept(PairAccept {
            identity: self.local_identity().clone(),
        });
        let envelope = self.inner.channel.seal(&accept, &pairing_keys)?;
        cancellable(&mut cancel, send_envelope(transport.as_ref(), &envelope, timeout)).await?;
        tracing::debug!(peer = %peer.id, session = %session_id, "Accepted pair request");

        let mut link = PeerLink::new(
            transport,
            self.inner.channel.clone(),
            ChannelKeys::derive(&shared_secret)?,
            peer.clone(),
            timeout,
            cancel,
        );

        let result = async {
            match link.recv().await? {
                Message::PairConfirm(confirm) if confirm.session_id == session_id => {}
                Message::PairConfirm(_) => {
                    return Err(EngineError::Protocol("pair_confirm names another session".into()))
                }
                other => return Err(unexpected("pair_confirm", other)),
            }
            self.close_pairing_session(&session_id, true).await?;
            self.complete_pairing(PairedDevice {
                id: peer.id,
                name: peer.name.clone(),
                public_key: peer.public_key,
                shared_secret,
                paired_at: now_millis(),
                last_sync_at: None,
            })
            .await?;

            match self.next_message(&mut link).await? {
                Message::SyncRequest(request) => self.responder_round(&mut link, request).await.map(Some),
                Message::Disconnect(_) => {
                    tracing::info!(peer = %peer.id, "Peer left after pairing");
                    self.transition(Event::Cancelled).await;
                    Ok(None)
                }
                other => Err(unexpected("sync_request", other)),
            }
        }
        .await;

        if let Err(e) = &result {
            self.close_pairing_session(&session_id, false).await.ok();
            link.disconnect(&e.to_string()).await;
        }
        link.close().await;
        result
    }

    /// Complete (or fail) and drop a host pairing session.
    async fn close_pairing_session(&self, session_id: &SessionId, completed: bool) -> Result<()> {
        let mut sessions = self.inner.pairing.lock().await;
        let Some(session) = sessions.get_mut(session_id) else {
            return Ok(());
        };
        let outcome = if completed {
            session.complete(now_millis())
        } else {
            session.fail();
            Ok(())
        };
        sessions.remove(session_id);
        outcome.map_err(|e: PairingError| e.into())
    }
}

async fn close_quietly(transport: &dyn Transport) {
    if let Err(e) = transport.close().await {
        tracing::debug!(error = %e, "Close failed");
    }
}
