//! SyncEngine - the main interface for classsync.
//!
//! The engine owns the aggregate [`P2PSyncState`] and interprets the
//! actions produced by the pure state machine in sync-core, performing the
//! actual I/O through the [`Connector`], [`Transport`] and [`DataStore`]
//! boundaries.
//!
//! ```text
//! UI → SyncEngine → MessageChannel → Transport → Network
//!          ↓               ↓
//!     sync-core       DataStore
//! ```
//!
//! One session (pairing or sync, either role) runs at a time. Discovery runs
//! in background tasks feeding an engine-owned pump.
//!
//! # Example
//!
//! ```ignore
//! let engine = SyncEngine::builder(identity, JsonFileStore::new("records.json"), TcpConnector::default())
//!     .with_settings(settings)
//!     .with_state_store(Arc::new(FileStateStore::new("sync-state.json")))
//!     .build()
//!     .await?;
//!
//! engine.start_discovery().await?;
//! let report = engine.pair_with_qr(&payload).await?;
//! ```

mod link;
mod pairing;
mod round;


use classsync_core::{
    Action, Conflict, Event, FieldTypeMergePolicy, FieldUpdate, FirstSyncChoice, FirstSyncError,
    MergePolicy, MergedDelta, P2PSyncState, PairingSessions, QrCodeData, Resolution, SyncEvent,
};
use classsync_types::{
    now_millis, ConflictId, DeviceId, DeviceIdentity, DiscoveryAnnouncement, Dot, FieldValue,
    RecordKey,
};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;

use crate::channel::MessageChannel;
use crate::config::SyncSettings;
use crate::crypto::{AeadCipher, CryptoIdentity, KeyAgreement, X25519KeyAgreement, XChaChaCipher};
use crate::discovery::{spawn_discovery, DiscoveryConfig, DiscoveryEvent, DiscoveryHandle};
use crate::error::{EngineError, Result};
use crate::persist::{MemoryStateStore, PersistedState, StateStore};
use crate::store::DataStore;
use crate::transport::Connector;

/// Version announced in discovery and checked during pairing.
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

const EVENT_CAPACITY: usize = 64;
const DISCOVERY_QUEUE: usize = 64;

/// Outcome of a completed pairing or sync session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    /// Peer synced with.
    pub peer: DeviceId,
    /// Remote field writes applied (records adopted on a first sync).
    pub applied: usize,
    /// Conflicts detected in the round.
    pub conflicts: usize,
    /// The first-sync decision, when the round was a first sync.
    pub first_sync: Option<FirstSyncChoice>,
}

/// A pairing QR code ready to display.
#[derive(Debug, Clone)]
pub struct PairingQr {
    /// Decoded contents.
    pub data: QrCodeData,
    /// Text to render as the QR image.
    pub payload: String,
}

struct DiscoveryRuntime {
    _handle: DiscoveryHandle,
    pump: JoinHandle<()>,
}

impl Drop for DiscoveryRuntime {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

struct Inner<S, C> {
    channel: MessageChannel,
    store: S,
    connector: C,
    settings: SyncSettings,
    state_store: Arc<dyn StateStore>,
    agreement: Arc<dyn KeyAgreement>,
    merge_policy: Arc<dyn MergePolicy>,
    discovery_config: DiscoveryConfig,
    app_version: String,
    state: Mutex<P2PSyncState>,
    events: broadcast::Sender<SyncEvent>,
    session: Mutex<()>,
    cancel: watch::Sender<u64>,
    pairing: Mutex<PairingSessions>,
    first_sync_reply: Mutex<Option<oneshot::Sender<FirstSyncChoice>>>,
    discovery: Mutex<Option<DiscoveryRuntime>>,
}

/// Configures and restores a [`SyncEngine`].
pub struct EngineBuilder<S, C> {
    identity: CryptoIdentity,
    store: S,
    connector: C,
    settings: SyncSettings,
    state_store: Arc<dyn StateStore>,
    agreement: Arc<dyn KeyAgreement>,
    cipher: Arc<dyn AeadCipher>,
    merge_policy: Arc<dyn MergePolicy>,
    discovery_config: Option<DiscoveryConfig>,
    app_version: String,
}

impl<S, C> EngineBuilder<S, C>
where
    S: DataStore + 'static,
    C: Connector + 'static,
{
    /// Use `settings` instead of the defaults.
    pub fn with_settings(mut self, settings: SyncSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Persist engine state through `store` (default: in memory).
    pub fn with_state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.state_store = store;
        self
    }

    /// Replace the X25519 key agreement.
    pub fn with_key_agreement(mut self, agreement: Arc<dyn KeyAgreement>) -> Self {
        self.agreement = agreement;
        self
    }

    /// Replace the XChaCha20-Poly1305 cipher.
    pub fn with_cipher(mut self, cipher: Arc<dyn AeadCipher>) -> Self {
        self.cipher = cipher;
        self
    }

    /// Policy used by the `merge` conflict strategy.
    pub fn with_merge_policy(mut self, policy: Arc<dyn MergePolicy>) -> Self {
        self.merge_policy = policy;
        self
    }

    /// Override the discovery sockets (default: LAN broadcast on the
    /// configured port).
    pub fn with_discovery_config(mut self, config: DiscoveryConfig) -> Self {
        self.discovery_config = Some(config);
        self
    }

    /// Override the announced application version.
    pub fn with_app_version(mut self, version: impl Into<String>) -> Self {
        self.app_version = version.into();
        self
    }

    /// Validate settings and restore persisted state.
    pub async fn build(self) -> Result<SyncEngine<S, C>> {
        self.settings.validate()?;
        let persisted = self.state_store.load().await?;
        let state = persisted.restore(self.settings.offline_after_ms());
        let discovery_config = self.discovery_config.unwrap_or_else(|| {
            DiscoveryConfig::lan(self.settings.discovery_port, self.settings.broadcast_interval())
        });
        let channel = MessageChannel::new(Arc::new(self.identity), self.cipher);

        tracing::info!(
            device = %channel.local_id(),
            paired = state.directory().paired_devices().count(),
            "Sync engine ready"
        );

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (cancel, _) = watch::channel(0);
        Ok(SyncEngine {
            inner: Arc::new(Inner {
                channel,
                store: self.store,
                connector: self.connector,
                settings: self.settings,
                state_store: self.state_store,
                agreement: self.agreement,
                merge_policy: self.merge_policy,
                discovery_config,
                app_version: self.app_version,
                state: Mutex::new(state),
                events,
                session: Mutex::new(()),
                cancel,
                pairing: Mutex::new(PairingSessions::new()),
                first_sync_reply: Mutex::new(None),
                discovery: Mutex::new(None),
            }),
        })
    }
}

/// The LAN sync engine.
///
/// Cheap to clone; clones share one engine.
pub struct SyncEngine<S, C> {
    inner: Arc<Inner<S, C>>,
}

impl<S, C> Clone for SyncEngine<S, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S, C> std::fmt::Debug for SyncEngine<S, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("local", &self.inner.channel.local_id())
            .finish()
    }
}

impl<S, C> SyncEngine<S, C>
where
    S: DataStore + 'static,
    C: Connector + 'static,
{
    /// Start configuring an engine for `identity`.
    pub fn builder(identity: CryptoIdentity, store: S, connector: C) -> EngineBuilder<S, C> {
        EngineBuilder {
            identity,
            store,
            connector,
            settings: SyncSettings::default(),
            state_store: Arc::new(MemoryStateStore::new()),
            agreement: Arc::new(X25519KeyAgreement),
            cipher: Arc::new(XChaChaCipher),
            merge_policy: Arc::new(FieldTypeMergePolicy),
            discovery_config: None,
            app_version: APP_VERSION.to_string(),
        }
    }

    // ===========================================
    // Observation
    // ===========================================

    /// Copy of the current state.
    pub async fn state(&self) -> P2PSyncState {
        self.inner.state.lock().await.clone()
    }

    /// Receive [`SyncEvent`]s from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    /// This device's public identity.
    pub fn local_identity(&self) -> &DeviceIdentity {
        self.inner.channel.identity().identity()
    }

    /// Active settings.
    pub fn settings(&self) -> &SyncSettings {
        &self.inner.settings
    }

    /// The record store.
    pub fn store(&self) -> &S {
        &self.inner.store
    }

    fn local_id(&self) -> DeviceId {
        self.inner.channel.local_id()
    }

    // ===========================================
    // Discovery
    // ===========================================

    /// Start broadcasting and listening. Idempotent.
    pub async fn start_discovery(&self) -> Result<()> {
        let mut discovery = self.inner.discovery.lock().await;
        if discovery.is_none() {
            let (tx, rx) = mpsc::channel(DISCOVERY_QUEUE);
            let announcement = DiscoveryAnnouncement {
                identity: self.local_identity().clone(),
                port: self.inner.settings.sync_port,
                app_version: self.inner.app_version.clone(),
            };
            let handle = spawn_discovery(
                self.inner.channel.clone(),
                announcement,
                self.inner.discovery_config.clone(),
                tx,
            )
            .await?;
            let pump = spawn_pump(
                Arc::downgrade(&self.inner),
                rx,
                self.inner.settings.broadcast_interval(),
            );
            *discovery = Some(DiscoveryRuntime {
                _handle: handle,
                pump,
            });
        }
        drop(discovery);
        self.transition(Event::DiscoveryStarted).await;
        Ok(())
    }

    /// Stop discovery and forget discovered devices.
    pub async fn stop_discovery(&self) {
        let runtime = self.inner.discovery.lock().await.take();
        drop(runtime);
        self.inner.state.lock().await.clear_discovered();
        self.transition(Event::DiscoveryStopped).await;
    }

    /// Record one announcement heard on the network.
    ///
    /// With `auto_sync` on, a paired device that appears (or comes back
    /// online) gets a sync round in the background.
    pub async fn ingest_discovery(&self, event: DiscoveryEvent) {
        let peer = event.announcement.identity.id;
        let (actions, auto_sync) = {
            let mut state = self.inner.state.lock().await;
            let actions =
                state.record_discovery(&event.announcement, event.ip_address, event.received_at);
            let auto_sync = !actions.is_empty()
                && self.inner.settings.auto_sync
                && state.directory().is_paired(&peer)
                && state.status().can_start_session();
            (actions, auto_sync)
        };
        self.dispatch(actions);

        if auto_sync {
            tracing::info!(%peer, "Paired device online, starting automatic sync");
            let engine = self.clone();
            tokio::spawn(async move {
                if let Err(e) = engine.start_sync(peer).await {
                    tracing::debug!(%peer, error = %e, "Automatic sync failed");
                }
            });
        }
    }

    /// Mark devices that stopped broadcasting offline.
    pub async fn prune_stale(&self) {
        let actions = self.inner.state.lock().await.prune_stale(now_millis());
        self.dispatch(actions);
    }

    /// Unpair devices silent for longer than the heartbeat-loss policy
    /// allows. Skipped while a session is running.
    pub async fn apply_heartbeat_policy(&self) -> Result<Vec<DeviceId>> {
        let Ok(_session) = self.inner.session.try_lock() else {
            return Ok(Vec::new());
        };
        let policy = self.inner.settings.heartbeat_loss;
        let removed = {
            let mut state = self.inner.state.lock().await;
            let expired = state
                .directory()
                .paired_past_heartbeat_policy(now_millis(), policy);
            expired
                .into_iter()
                .filter(|id| state.remove_paired(id).is_some())
                .collect::<Vec<_>>()
        };
        if removed.is_empty() {
            return Ok(removed);
        }

        self.persist().await?;
        for peer in &removed {
            tracing::warn!(%peer, "Unpaired silent device");
            self.emit(SyncEvent::Unpaired { peer: *peer });
        }
        Ok(removed)
    }

    // ===========================================
    // Devices and data
    // ===========================================

    /// Forget a paired device, its baseline and its conflicts.
    pub async fn unpair(&self, peer: DeviceId) -> Result<()> {
        let _session = self.inner.session.lock().await;
        if self.inner.state.lock().await.remove_paired(&peer).is_none() {
            return Err(EngineError::UnknownPeer(peer));
        }
        self.persist().await?;
        tracing::info!(%peer, "Unpaired device");
        self.emit(SyncEvent::Unpaired { peer });
        Ok(())
    }

    /// Commit a locally authored field write and advance the local clock.
    pub async fn record_local_change(
        &self,
        key: RecordKey,
        field: &str,
        value: serde_json::Value,
    ) -> Result<Dot> {
        let _session = self.inner.session.lock().await;
        self.write_local(key, field, value).await
    }

    async fn write_local(&self, key: RecordKey, field: &str, value: serde_json::Value) -> Result<Dot> {
        let local = self.local_id();
        let dot = self.inner.state.lock().await.next_local_dot(local);
        let delta = MergedDelta {
            updates: vec![FieldUpdate {
                key,
                field: field.to_string(),
                value: FieldValue::new(value, now_millis(), dot),
            }],
        };
        self.inner.store.apply(&delta).await?;
        let dot = self.inner.state.lock().await.record_local_change(local);
        self.persist().await?;
        Ok(dot)
    }

    /// Settle a conflict left open by the `manual` strategy.
    ///
    /// The chosen value is written as a new local change so it propagates
    /// on the next round.
    pub async fn resolve_conflict(&self, id: ConflictId, resolution: Resolution) -> Result<Conflict> {
        let _session = self.inner.session.lock().await;
        let conflict = self
            .inner
            .state
            .lock()
            .await
            .unresolved_conflict(&id)
            .cloned()
            .ok_or(EngineError::UnknownConflict(id))?;

        let value = match conflict.value_for(&resolution) {
            Some(value) => value,
            None => {
                let local = FieldValue::new(
                    conflict.local_value.clone(),
                    conflict.local_timestamp,
                    conflict.local_dot,
                );
                let remote = FieldValue::new(
                    conflict.remote_value.clone(),
                    conflict.remote_timestamp,
                    conflict.remote_dot,
                );
                let (first, second) = if local.dot.device <= remote.dot.device {
                    (&local, &remote)
                } else {
                    (&remote, &local)
                };
                self.inner.merge_policy.merge(&conflict.field, first, second)
            }
        };

        self.write_local(conflict.field.key.clone(), &conflict.field.field, value)
            .await?;
        let resolved = self
            .inner
            .state
            .lock()
            .await
            .resolve_conflict(&id, resolution)
            .ok_or(EngineError::UnknownConflict(id))?;
        self.persist().await?;
        tracing::info!(conflict = %id, peer = %resolved.peer, "Conflict resolved");
        Ok(resolved)
    }

    /// Answer a pending first-sync prompt.
    pub async fn respond_first_sync(&self, choice: FirstSyncChoice) -> Result<()> {
        let reply = self
            .inner
            .first_sync_reply
            .lock()
            .await
            .take()
            .ok_or(FirstSyncError::NotAwaiting)?;
        self.inner.state.lock().await.choose_first_sync(choice)?;
        reply.send(choice).map_err(|_| EngineError::Cancelled)
    }

    // ===========================================
    // Session control
    // ===========================================

    /// Abort the running session. Returns false when nothing was running.
    pub async fn cancel(&self) -> bool {
        let actions = self.inner.state.lock().await.apply(Event::Cancelled);
        let aborted = actions.contains(&Action::AbortSession);
        self.inner.first_sync_reply.lock().await.take();
        self.dispatch(actions);
        if aborted {
            tracing::info!("Session cancelled");
        }
        aborted
    }

    /// Leave the `error` or `connected` state.
    pub async fn dismiss_error(&self) {
        self.transition(Event::Dismissed).await;
    }

    /// Stop discovery and save state.
    pub async fn shutdown(&self) -> Result<()> {
        self.stop_discovery().await;
        self.persist().await
    }

    // ===========================================
    // Internals
    // ===========================================

    fn dispatch(&self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::EmitEvent(event) => self.emit(event),
                Action::AbortSession => self.inner.cancel.send_modify(|generation| *generation += 1),
                // The calling operation owns the discovery tasks
                Action::StartDiscovery | Action::StopDiscovery => {}
            }
        }
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }

    async fn transition(&self, event: Event) {
        let actions = self.inner.state.lock().await.apply(event);
        self.dispatch(actions);
    }

    /// Move into a session state, returning the session's cancel signal.
    async fn begin_session(&self, event: Event) -> Result<watch::Receiver<u64>> {
        let cancel = self.inner.cancel.subscribe();
        let mut state = self.inner.state.lock().await;
        if !state.status().can_start_session() {
            return Err(EngineError::Protocol(format!(
                "engine is busy ({:?})",
                state.status()
            )));
        }
        let actions = state.apply(event);
        drop(state);
        self.dispatch(actions);
        Ok(cancel)
    }

    /// Map a session result onto the state machine.
    async fn finish<T>(&self, result: Result<T>) -> Result<T> {
        self.inner.first_sync_reply.lock().await.take();
        match &result {
            Ok(_) => {}
            Err(EngineError::Cancelled) => self.transition(Event::Cancelled).await,
            Err(e) => {
                tracing::warn!(error = %e, "Session failed");
                self.transition(Event::Failed {
                    error: e.to_string(),
                })
                .await;
            }
        }
        result
    }

    async fn persist(&self) -> Result<()> {
        let snapshot = PersistedState::capture(&*self.inner.state.lock().await);
        self.inner.state_store.save(&snapshot).await?;
        Ok(())
    }
}

/// Drain discovery events and tick offline detection.
fn spawn_pump<S, C>(
    inner: Weak<Inner<S, C>>,
    mut events: mpsc::Receiver<DiscoveryEvent>,
    every: Duration,
) -> JoinHandle<()>
where
    S: DataStore + 'static,
    C: Connector + 'static,
{
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(every);
        loop {
            tokio::select! {
                event = events.recv() => {
                    let (Some(event), Some(strong)) = (event, inner.upgrade()) else {
                        break;
                    };
                    SyncEngine { inner: strong }.ingest_discovery(event).await;
                }
                _ = timer.tick() => {
                    let Some(strong) = inner.upgrade() else {
                        break;
                    };
                    let engine = SyncEngine { inner: strong };
                    engine.prune_stale().await;
                    if let Err(e) = engine.apply_heartbeat_policy().await {
                        tracing::warn!(error = %e, "Heartbeat policy failed");
                    }
                }
            }
        }
        tracing::debug!("Discovery pump stopped");
    })
}
