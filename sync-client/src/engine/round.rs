//! Sync rounds, initiator and responder side, including first sync.

use classsync_core::{
    calculate_backoff, delta_for, needs_first_sync, reconcile, Event, FirstSyncChoice,
    FirstSyncRequest, MergePlan, ReconcileInput, SyncEvent,
};
use classsync_types::{
    now_millis, AckResult, Dataset, DeviceId, FirstSyncAck, FirstSyncDecision, FirstSyncStats,
    Heartbeat, Message, SyncAck, SyncData, SyncPacket, SyncRequest, VectorClock,
};
use tokio::sync::{oneshot, watch};

use super::link::{cancellable, timed, unexpected, PeerLink};
use super::{SyncEngine, SyncReport};
use crate::crypto::ChannelKeys;
use crate::error::{EngineError, Result};
use crate::store::DataStore;
use crate::transport::{Connector, Transport};

/// Times a bad packet is re-requested before the round fails.
pub(crate) const MAX_RETRANSMITS: u32 = 2;

impl<S, C> SyncEngine<S, C>
where
    S: DataStore + 'static,
    C: Connector + 'static,
{
    // ===========================================
    // Initiator entry points
    // ===========================================

    /// Sync with a paired device at its discovered address.
    pub async fn start_sync(&self, peer: DeviceId) -> Result<SyncReport> {
        let address = {
            let state = self.inner.state.lock().await;
            if !state.directory().is_paired(&peer) {
                return Err(EngineError::UnknownPeer(peer));
            }
            state
                .directory()
                .discovered(&peer)
                .filter(|device| device.is_online)
                .map(|device| device.address())
        };
        let address = address
            .ok_or_else(|| EngineError::PeerUnreachable(format!("{peer} has not been discovered")))?;
        self.sync_with(peer, &address).await
    }

    /// Sync with a paired device at `address` (`ip:port`).
    ///
    /// Timeouts and refused connections are retried with backoff up to
    /// `max_retries` times.
    pub async fn sync_with(&self, peer: DeviceId, address: &str) -> Result<SyncReport> {
        if !self.inner.state.lock().await.directory().is_paired(&peer) {
            return Err(EngineError::UnknownPeer(peer));
        }
        let _session = self.inner.session.lock().await;
        let cancel = self
            .begin_session(Event::PeerSelected { peer: Some(peer) })
            .await?;
        let result = self.sync_attempts(peer, address, cancel).await;
        self.finish(result).await
    }

    async fn sync_attempts(
        &self,
        peer: DeviceId,
        address: &str,
        mut cancel: watch::Receiver<u64>,
    ) -> Result<SyncReport> {
        let mut attempt = 0;
        loop {
            match self.sync_once(peer, address, cancel.clone()).await {
                Err(e) if e.is_retryable() && attempt < self.inner.settings.max_retries => {
                    attempt += 1;
                    let delay = calculate_backoff(attempt);
                    tracing::warn!(
                        %peer,
                        attempt,
                        error = %e,
                        "Sync attempt failed, retrying in {:?}",
                        delay
                    );
                    cancellable(&mut cancel, async {
                        tokio::time::sleep(delay).await;
                        Ok(())
                    })
                    .await?;
                }
                other => return other,
            }
        }
    }

    async fn sync_once(
        &self,
        peer: DeviceId,
        address: &str,
        mut cancel: watch::Receiver<u64>,
    ) -> Result<SyncReport> {
        let device = self
            .inner
            .state
            .lock()
            .await
            .directory()
            .paired(&peer)
            .cloned()
            .ok_or(EngineError::UnknownPeer(peer))?;
        let transport = self.connect(address, &mut cancel).await?;
        self.transition(Event::TransportOpened { paired: true }).await;

        let keys = ChannelKeys::derive(&device.shared_secret)?;
        let mut link = PeerLink::new(
            transport,
            self.inner.channel.clone(),
            keys,
            device.identity(),
            self.inner.settings.network_timeout(),
            cancel,
        );
        let result = self.run_initiator_round(&mut link).await;
        if let Err(e) = &result {
            link.disconnect(&e.to_string()).await;
        }
        link.close().await;
        result
    }

    pub(super) async fn connect(
        &self,
        address: &str,
        cancel: &mut watch::Receiver<u64>,
    ) -> Result<Box<dyn Transport>> {
        tracing::debug!(%address, "Connecting");
        cancellable(
            cancel,
            timed(
                self.inner.settings.network_timeout(),
                self.inner.connector.connect(address),
            ),
        )
        .await
    }

    // ===========================================
    // Initiator round
    // ===========================================

    pub(super) async fn run_initiator_round(&self, link: &mut PeerLink) -> Result<SyncReport> {
        let peer = link.peer_id();
        let local = self.snapshot().await?;
        let (clock, baseline_known) = {
            let state = self.inner.state.lock().await;
            (state.vector_clock().clone(), state.baseline(&peer).is_some())
        };

        tracing::info!(%peer, baseline_known, "Starting sync round");
        link.send(&Message::SyncRequest(SyncRequest {
            vector_clock: clock.clone(),
            stats: local.stats(),
            baseline_known,
        }))
        .await?;

        let data = match self.next_message(link).await? {
            Message::FirstSyncRequest(theirs) => {
                return self.initiator_first_sync(link, local, clock, theirs).await;
            }
            Message::SyncData(data) => data,
            other => return Err(unexpected("sync_data", other)),
        };
        let (remote, remote_clock) = self.accept_packet(link, data).await?;
        let mut plan = self.plan_merge(&local, &clock, &remote, &remote_clock, peer);

        let outgoing = delta_for(&local, &remote_clock);
        let packet = link.seal_packet(clock, &outgoing)?;
        link.send(&Message::SyncData(SyncData {
            packet: packet.clone(),
        }))
        .await?;
        let committed = self.await_commit(link, &packet).await?;
        plan.merged_clock.merge_in(&committed);

        link.ensure_live()?;
        let report = self.commit_plan(peer, plan).await?;
        link.disconnect("sync complete").await;
        Ok(report)
    }

    /// Wait for the responder's `sync_ack`, resending our packet when it
    /// asks for a retransmit.
    async fn await_commit(&self, link: &mut PeerLink, packet: &SyncPacket) -> Result<VectorClock> {
        let mut resent = 0;
        loop {
            match self.next_message(link).await? {
                Message::SyncAck(SyncAck {
                    result: AckResult::Committed { vector_clock },
                }) => return Ok(vector_clock),
                Message::SyncAck(SyncAck {
                    result: AckResult::Retransmit,
                }) => {
                    if resent >= MAX_RETRANSMITS {
                        return Err(EngineError::ChecksumMismatch);
                    }
                    resent += 1;
                    tracing::warn!(peer = %link.peer_id(), resent, "Peer requested retransmit");
                    link.send(&Message::SyncData(SyncData {
                        packet: packet.clone(),
                    }))
                    .await?;
                }
                other => return Err(unexpected("sync_ack", other)),
            }
        }
    }

    // ===========================================
    // Responder round
    // ===========================================

    pub(super) async fn responder_round(
        &self,
        link: &mut PeerLink,
        request: SyncRequest,
    ) -> Result<SyncReport> {
        let peer = link.peer_id();
        let local = self.snapshot().await?;
        let (clock, own_baseline) = {
            let state = self.inner.state.lock().await;
            (state.vector_clock().clone(), state.baseline(&peer).is_some())
        };

        if needs_first_sync(
            request.baseline_known || own_baseline,
            &clock,
            &request.vector_clock,
            &local.stats(),
            &request.stats,
        ) {
            return self.responder_first_sync(link, local, clock).await;
        }

        tracing::info!(%peer, "Answering sync round");
        let outgoing = delta_for(&local, &request.vector_clock);
        let packet = link.seal_packet(clock.clone(), &outgoing)?;
        link.send(&Message::SyncData(SyncData {
            packet: packet.clone(),
        }))
        .await?;

        let data = self.await_data(link, &packet).await?;
        let (remote, remote_clock) = self.accept_packet(link, data).await?;
        let plan = self.plan_merge(&local, &clock, &remote, &remote_clock, peer);
        let merged = plan.merged_clock.clone();

        link.ensure_live()?;
        let report = self.commit_plan(peer, plan).await?;
        let ack = Message::SyncAck(SyncAck {
            result: AckResult::Committed {
                vector_clock: merged,
            },
        });
        if let Err(e) = link.send(&ack).await {
            tracing::warn!(%peer, error = %e, "Committed but could not acknowledge");
        }
        link.await_disconnect().await;
        Ok(report)
    }

    /// Wait for the initiator's `sync_data`, resending ours on request.
    async fn await_data(&self, link: &mut PeerLink, packet: &SyncPacket) -> Result<SyncData> {
        let mut resent = 0;
        loop {
            match self.next_message(link).await? {
                Message::SyncData(data) => return Ok(data),
                Message::SyncAck(SyncAck {
                    result: AckResult::Retransmit,
                }) => {
                    if resent >= MAX_RETRANSMITS {
                        return Err(EngineError::ChecksumMismatch);
                    }
                    resent += 1;
                    tracing::warn!(peer = %link.peer_id(), resent, "Peer requested retransmit");
                    link.send(&Message::SyncData(SyncData {
                        packet: packet.clone(),
                    }))
                    .await?;
                }
                other => return Err(unexpected("sync_data", other)),
            }
        }
    }

    // ===========================================
    // Shared round steps
    // ===========================================

    /// Next non-heartbeat message. Heartbeats refresh the peer's liveness.
    pub(super) async fn next_message(&self, link: &mut PeerLink) -> Result<Message> {
        loop {
            match link.recv().await? {
                Message::Heartbeat(_) => {
                    self.inner
                        .state
                        .lock()
                        .await
                        .record_heartbeat(&link.peer_id(), now_millis());
                }
                message => return Ok(message),
            }
        }
    }

    /// Decrypt a peer's packet, asking for a retransmit when its hash does
    /// not match.
    async fn accept_packet(
        &self,
        link: &mut PeerLink,
        mut data: SyncData,
    ) -> Result<(Dataset, VectorClock)> {
        let mut requested = 0;
        loop {
            match link.open_packet(&data.packet) {
                Ok(dataset) => return Ok((dataset, data.packet.vector_clock)),
                Err(EngineError::ChecksumMismatch) if requested < MAX_RETRANSMITS => {
                    requested += 1;
                    tracing::warn!(peer = %link.peer_id(), requested, "Packet hash mismatch, requesting retransmit");
                    link.send(&Message::SyncAck(SyncAck {
                        result: AckResult::Retransmit,
                    }))
                    .await?;
                    data = match self.next_message(link).await? {
                        Message::SyncData(data) => data,
                        other => return Err(unexpected("sync_data", other)),
                    };
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn plan_merge(
        &self,
        local: &Dataset,
        local_clock: &VectorClock,
        remote: &Dataset,
        remote_clock: &VectorClock,
        peer: DeviceId,
    ) -> MergePlan {
        reconcile(ReconcileInput {
            local,
            local_clock,
            remote,
            remote_clock,
            peer,
            strategy: self.inner.settings.conflict_strategy,
            policy: self.inner.merge_policy.as_ref(),
            now: now_millis(),
        })
    }

    /// Apply the plan in one transaction, then record clocks and conflicts.
    async fn commit_plan(&self, peer: DeviceId, plan: MergePlan) -> Result<SyncReport> {
        if !plan.delta.is_empty() {
            if let Err(e) = self.inner.store.apply(&plan.delta).await {
                tracing::error!(%peer, error = %e, "Commit failed, nothing applied");
                return Err(EngineError::CommitFailure(e));
            }
        }

        let report = SyncReport {
            peer,
            applied: plan.applied,
            conflicts: plan.conflicts.len(),
            first_sync: None,
        };
        let now = now_millis();
        let actions = self
            .inner
            .state
            .lock()
            .await
            .commit_round(self.local_id(), peer, plan, now);
        self.dispatch(actions);
        self.complete_round(&report, now).await?;
        Ok(report)
    }

    async fn complete_round(&self, report: &SyncReport, at: u64) -> Result<()> {
        self.persist().await?;
        self.transition(Event::RoundCompleted { at }).await;
        self.emit(SyncEvent::SyncCompleted {
            peer: report.peer,
            applied: report.applied,
            conflicts: report.conflicts,
        });
        tracing::info!(
            peer = %report.peer,
            applied = report.applied,
            conflicts = report.conflicts,
            "Sync round complete"
        );
        Ok(())
    }

    async fn snapshot(&self) -> Result<Dataset> {
        self.inner
            .store
            .snapshot()
            .await
            .map_err(EngineError::Storage)
    }

    async fn replace_dataset(&self, peer: DeviceId, dataset: Dataset) -> Result<()> {
        let records = dataset.len();
        if let Err(e) = self.inner.store.replace_all(dataset).await {
            tracing::error!(%peer, error = %e, "Replacement failed, nothing applied");
            return Err(EngineError::CommitFailure(e));
        }
        tracing::info!(%peer, records, "Adopted peer dataset");
        Ok(())
    }

    // ===========================================
    // First sync
    // ===========================================

    /// The initiator decides: prompt the user, keep the responder alive
    /// with heartbeats, then transfer the winning dataset.
    async fn initiator_first_sync(
        &self,
        link: &mut PeerLink,
        local: Dataset,
        clock: VectorClock,
        theirs: FirstSyncStats,
    ) -> Result<SyncReport> {
        let peer = link.peer_id();
        let (reply_tx, reply_rx) = oneshot::channel();
        *self.inner.first_sync_reply.lock().await = Some(reply_tx);
        let request = FirstSyncRequest {
            peer,
            peer_name: link.peer_name().to_string(),
            local_stats: local.stats(),
            remote_stats: theirs.stats,
        };
        let actions = self.inner.state.lock().await.begin_first_sync(request);
        self.dispatch(actions);
        tracing::info!(%peer, "First sync, waiting for a decision");

        let choice = self.wait_for_choice(link, reply_rx).await?;
        let Some(winner) = choice.winner(self.local_id(), peer) else {
            link.disconnect("first sync cancelled").await;
            return Err(EngineError::Cancelled);
        };
        link.send(&Message::FirstSyncChoice(FirstSyncDecision { winner }))
            .await?;

        let (merged, applied) = if winner == peer {
            let data = match self.next_message(link).await? {
                Message::FirstSyncData(data) => data,
                other => return Err(unexpected("first_sync_data", other)),
            };
            let dataset = link.open_packet(&data.packet)?;
            let merged = clock.merge(&data.packet.vector_clock);
            let applied = dataset.len();
            link.ensure_live()?;
            self.replace_dataset(peer, dataset).await?;
            link.send(&Message::FirstSyncAck(FirstSyncAck {
                vector_clock: merged.clone(),
            }))
            .await?;
            (merged, applied)
        } else {
            let packet = link.seal_packet(clock.clone(), &local)?;
            link.send(&Message::FirstSyncData(SyncData { packet }))
                .await?;
            let ack = match self.next_message(link).await? {
                Message::FirstSyncAck(ack) => ack,
                other => return Err(unexpected("first_sync_ack", other)),
            };
            (clock.merge(&ack.vector_clock), 0)
        };

        let report = self.commit_first_sync(peer, merged, choice, applied).await?;
        link.disconnect("sync complete").await;
        Ok(report)
    }

    async fn wait_for_choice(
        &self,
        link: &mut PeerLink,
        mut reply: oneshot::Receiver<FirstSyncChoice>,
    ) -> Result<FirstSyncChoice> {
        let deadline = tokio::time::sleep(self.inner.settings.first_sync_choice_timeout());
        tokio::pin!(deadline);
        let mut heartbeat = tokio::time::interval(self.inner.settings.broadcast_interval());
        heartbeat.tick().await;

        loop {
            tokio::select! {
                choice = &mut reply => return choice.map_err(|_| EngineError::Cancelled),
                _ = &mut deadline => {
                    tracing::warn!(peer = %link.peer_id(), "First sync decision timed out");
                    return Ok(FirstSyncChoice::Cancel);
                }
                _ = heartbeat.tick() => {
                    link.send(&Message::Heartbeat(Heartbeat::now())).await?;
                }
            }
        }
    }

    /// The responder reports its side and follows the initiator's decision.
    async fn responder_first_sync(
        &self,
        link: &mut PeerLink,
        local: Dataset,
        clock: VectorClock,
    ) -> Result<SyncReport> {
        let peer = link.peer_id();
        tracing::info!(%peer, "First sync, waiting for the peer's decision");
        link.send(&Message::FirstSyncRequest(FirstSyncStats {
            stats: local.stats(),
            vector_clock: clock.clone(),
        }))
        .await?;

        let decision = match tokio::time::timeout(
            self.inner.settings.first_sync_choice_timeout(),
            self.next_message(link),
        )
        .await
        {
            Ok(message) => message?,
            Err(_) => {
                link.disconnect("first sync decision timed out").await;
                return Err(EngineError::Cancelled);
            }
        };
        let winner = match decision {
            Message::FirstSyncChoice(decision) => decision.winner,
            Message::Disconnect(_) => {
                tracing::info!(%peer, "Peer cancelled first sync");
                return Err(EngineError::Cancelled);
            }
            other => return Err(unexpected("first_sync_choice", other)),
        };

        let (merged, applied, choice) = if winner == peer {
            let data = match self.next_message(link).await? {
                Message::FirstSyncData(data) => data,
                other => return Err(unexpected("first_sync_data", other)),
            };
            let dataset = link.open_packet(&data.packet)?;
            let merged = clock.merge(&data.packet.vector_clock);
            let applied = dataset.len();
            link.ensure_live()?;
            self.replace_dataset(peer, dataset).await?;
            link.send(&Message::FirstSyncAck(FirstSyncAck {
                vector_clock: merged.clone(),
            }))
            .await?;
            (merged, applied, FirstSyncChoice::Remote)
        } else if winner == self.local_id() {
            let packet = link.seal_packet(clock.clone(), &local)?;
            link.send(&Message::FirstSyncData(SyncData { packet }))
                .await?;
            let ack = match self.next_message(link).await? {
                Message::FirstSyncAck(ack) => ack,
                other => return Err(unexpected("first_sync_ack", other)),
            };
            (clock.merge(&ack.vector_clock), 0, FirstSyncChoice::Local)
        } else {
            return Err(EngineError::Protocol(format!(
                "first sync winner {winner} is not part of this session"
            )));
        };

        let report = self.commit_first_sync(peer, merged, choice, applied).await?;
        link.await_disconnect().await;
        Ok(report)
    }

    async fn commit_first_sync(
        &self,
        peer: DeviceId,
        merged: VectorClock,
        choice: FirstSyncChoice,
        applied: usize,
    ) -> Result<SyncReport> {
        let now = now_millis();
        self.inner
            .state
            .lock()
            .await
            .commit_first_sync(self.local_id(), peer, merged, now);
        let report = SyncReport {
            peer,
            applied,
            conflicts: 0,
            first_sync: Some(choice),
        };
        self.complete_round(&report, now).await?;
        Ok(report)
    }
}
