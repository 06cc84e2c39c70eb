//! Sync engine state machine for classsync.
//!
//! [`SyncStatus::on_event`] is a pure, side-effect-free transition function
//! returning the new status plus a list of actions to execute.
//! [`P2PSyncState`] is the aggregate the engine owns; every mutation goes
//! through one of its transition methods.
//!
//! The actual I/O (sockets, discovery tasks, store commits) is performed by
//! sync-client, not by this module.

use classsync_types::{ConflictId, DeviceId, DiscoveryAnnouncement, Dot, VectorClock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::directory::{DeviceDirectory, PairedDevice};
use crate::first_sync::{FirstSyncChoice, FirstSyncError, FirstSyncRequest, FirstSyncState};
use crate::reconcile::{Conflict, MergePlan, Resolution};

/// Engine status shown to the user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Nothing running.
    #[default]
    Idle,
    /// Broadcasting presence and listening for peers.
    Discovering,
    /// Opening a connection to a peer.
    Connecting,
    /// Running the pairing handshake.
    Pairing,
    /// Running a sync round.
    Syncing,
    /// Last round finished; transient "done" state.
    Connected,
    /// Last operation failed; see `last_error`.
    Error,
}

impl SyncStatus {
    /// Whether a session is in flight (cancellable).
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            SyncStatus::Connecting | SyncStatus::Pairing | SyncStatus::Syncing
        )
    }

    /// Whether a new session may start from this status.
    pub fn can_start_session(&self) -> bool {
        matches!(
            self,
            SyncStatus::Idle | SyncStatus::Discovering | SyncStatus::Connected | SyncStatus::Error
        )
    }

    /// Process an event and return the new status plus actions to execute.
    ///
    /// `discovery_active` decides where cancel/dismiss land. Events that do
    /// not apply to the current status leave it unchanged.
    pub fn on_event(self, event: &Event, discovery_active: bool) -> (Self, Vec<Action>) {
        let rest = if discovery_active {
            SyncStatus::Discovering
        } else {
            SyncStatus::Idle
        };

        let (next, mut actions) = match (self, event) {
            (Self::Idle, Event::DiscoveryStarted) => (Self::Discovering, vec![Action::StartDiscovery]),
            (state, Event::DiscoveryStarted) => (state, vec![Action::StartDiscovery]),
            (Self::Discovering, Event::DiscoveryStopped) => (Self::Idle, vec![Action::StopDiscovery]),
            (state, Event::DiscoveryStopped) => (state, vec![Action::StopDiscovery]),

            (state, Event::PeerSelected { .. }) if state.can_start_session() => {
                (Self::Connecting, vec![])
            }
            (Self::Connecting, Event::TransportOpened { paired: true }) => (Self::Syncing, vec![]),
            (Self::Connecting, Event::TransportOpened { paired: false }) => (Self::Pairing, vec![]),

            (state, Event::PairRequestReceived) if state.can_start_session() => {
                (Self::Pairing, vec![])
            }
            (Self::Pairing, Event::PairingCompleted { .. }) => (Self::Syncing, vec![]),
            (state, Event::SyncRequestReceived { .. }) if state.can_start_session() => {
                (Self::Syncing, vec![])
            }
            (Self::Syncing, Event::RoundCompleted { .. }) => (Self::Connected, vec![]),

            (_, Event::Failed { error }) => (
                Self::Error,
                vec![Action::EmitEvent(SyncEvent::Failed {
                    error: error.clone(),
                })],
            ),
            (state, Event::Cancelled) if state.is_busy() => (rest, vec![Action::AbortSession]),
            (Self::Error | Self::Connected, Event::Dismissed) => (rest, vec![]),

            // Invalid transitions - stay in current state
            (state, _) => (state, vec![]),
        };

        if next != self {
            actions.push(Action::EmitEvent(SyncEvent::StatusChanged { status: next }));
        }
        (next, actions)
    }
}

/// Which side of a session this engine plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Opened the connection (pairing client / sync initiator).
    Initiator,
    /// Accepted the connection (pairing host / sync responder).
    Responder,
}

/// Inputs to the status machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// User enabled discovery.
    DiscoveryStarted,
    /// User disabled discovery.
    DiscoveryStopped,
    /// User picked a peer to pair or sync with.
    PeerSelected {
        /// Known peer id (None when pairing from a QR code).
        peer: Option<DeviceId>,
    },
    /// Connection established.
    TransportOpened {
        /// Whether the target is already paired.
        paired: bool,
    },
    /// A `pair_request` arrived while hosting.
    PairRequestReceived,
    /// Pairing handshake finished.
    PairingCompleted {
        /// The new peer.
        peer: DeviceId,
    },
    /// A `sync_request` arrived from a paired device.
    SyncRequestReceived {
        /// Requesting peer.
        peer: DeviceId,
    },
    /// Sync round committed.
    RoundCompleted {
        /// Commit time (Unix millis).
        at: u64,
    },
    /// Unrecoverable failure.
    Failed {
        /// Human-readable cause.
        error: String,
    },
    /// User aborted the session.
    Cancelled,
    /// User dismissed the error or done state.
    Dismissed,
}

/// Actions to be executed by the engine.
///
/// These are instructions, not side effects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Start the broadcast and listen tasks.
    StartDiscovery,
    /// Stop the broadcast and listen tasks.
    StopDiscovery,
    /// Abort the in-flight session without committing.
    AbortSession,
    /// Emit an event to the application.
    EmitEvent(SyncEvent),
}

/// Events emitted to the application layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// Status changed.
    StatusChanged {
        /// New status.
        status: SyncStatus,
    },
    /// A device appeared (or came back) on the network.
    DeviceDiscovered {
        /// Device id.
        id: DeviceId,
        /// Display name.
        name: String,
    },
    /// A device stopped sending heartbeats.
    DeviceOffline {
        /// Device id.
        id: DeviceId,
    },
    /// Pairing completed.
    Paired {
        /// New peer.
        peer: DeviceId,
        /// Peer display name.
        name: String,
    },
    /// A paired device was removed.
    Unpaired {
        /// Removed peer.
        peer: DeviceId,
    },
    /// The round is waiting for a first-sync decision.
    FirstSyncRequested(FirstSyncRequest),
    /// Conflicts need a manual choice.
    ConflictsDetected {
        /// Peer involved.
        peer: DeviceId,
        /// Number of unresolved conflicts.
        unresolved: usize,
    },
    /// A sync round committed.
    SyncCompleted {
        /// Peer synced with.
        peer: DeviceId,
        /// Remote field writes applied.
        applied: usize,
        /// Conflicts detected in the round.
        conflicts: usize,
    },
    /// A failure moved the engine to `error`.
    Failed {
        /// Human-readable cause.
        error: String,
    },
}

/// The engine's aggregate state.
///
/// Initialized from persisted state at startup and mutated only through
/// the transition methods below.
#[derive(Debug, Clone, Default)]
pub struct P2PSyncState {
    status: SyncStatus,
    role: Option<Role>,
    current_peer: Option<DeviceId>,
    directory: DeviceDirectory,
    vector_clock: VectorClock,
    peer_clocks: BTreeMap<DeviceId, VectorClock>,
    pending_local_changes: u64,
    last_error: Option<String>,
    conflicts: Vec<Conflict>,
    first_sync: FirstSyncState,
    last_sync_timestamp: Option<u64>,
    discovery_active: bool,
}

impl P2PSyncState {
    /// Build the state from persisted parts.
    pub fn new(
        directory: DeviceDirectory,
        vector_clock: VectorClock,
        peer_clocks: BTreeMap<DeviceId, VectorClock>,
        conflicts: Vec<Conflict>,
    ) -> Self {
        let last_sync_timestamp = directory
            .paired_devices()
            .filter_map(|d| d.last_sync_at)
            .max();
        Self {
            directory,
            vector_clock,
            peer_clocks,
            conflicts,
            last_sync_timestamp,
            ..Self::default()
        }
    }

    // ===========================================
    // Read access
    // ===========================================

    /// Current status.
    pub fn status(&self) -> SyncStatus {
        self.status
    }

    /// Role in the current session.
    pub fn role(&self) -> Option<Role> {
        self.role
    }

    /// Peer of the current session.
    pub fn current_peer(&self) -> Option<DeviceId> {
        self.current_peer
    }

    /// Paired and discovered devices.
    pub fn directory(&self) -> &DeviceDirectory {
        &self.directory
    }

    /// Local clock.
    pub fn vector_clock(&self) -> &VectorClock {
        &self.vector_clock
    }

    /// Sync baseline with `peer`: the merged clock of the last round.
    pub fn baseline(&self, peer: &DeviceId) -> Option<&VectorClock> {
        self.peer_clocks.get(peer)
    }

    /// All per-peer baselines.
    pub fn peer_clocks(&self) -> &BTreeMap<DeviceId, VectorClock> {
        &self.peer_clocks
    }

    /// Local writes since the last completed round.
    pub fn pending_local_changes(&self) -> u64 {
        self.pending_local_changes
    }

    /// Cause of the last failure.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// All tracked conflicts.
    pub fn conflicts(&self) -> &[Conflict] {
        &self.conflicts
    }

    /// Conflicts waiting for a manual choice.
    pub fn unresolved_conflicts(&self) -> impl Iterator<Item = &Conflict> {
        self.conflicts.iter().filter(|c| !c.resolved)
    }

    /// First-sync prompt state.
    pub fn first_sync(&self) -> &FirstSyncState {
        &self.first_sync
    }

    /// Time of the last completed round with any peer.
    pub fn last_sync_timestamp(&self) -> Option<u64> {
        self.last_sync_timestamp
    }

    /// Whether discovery is running.
    pub fn discovery_active(&self) -> bool {
        self.discovery_active
    }

    // ===========================================
    // Status transitions
    // ===========================================

    /// Feed an event through the status machine and update session fields.
    pub fn apply(&mut self, event: Event) -> Vec<Action> {
        match &event {
            Event::DiscoveryStarted => self.discovery_active = true,
            Event::DiscoveryStopped => self.discovery_active = false,
            _ => {}
        }

        let before = self.status;
        let (next, actions) = before.on_event(&event, self.discovery_active);
        let moved = next != before;
        self.status = next;

        match event {
            Event::PeerSelected { peer } if moved => {
                self.role = Some(Role::Initiator);
                self.current_peer = peer;
                self.last_error = None;
            }
            Event::PairRequestReceived if moved => {
                self.role = Some(Role::Responder);
                self.current_peer = None;
                self.last_error = None;
            }
            Event::PairingCompleted { peer } if moved => self.current_peer = Some(peer),
            Event::SyncRequestReceived { peer } if moved => {
                self.role = Some(Role::Responder);
                self.current_peer = Some(peer);
                self.last_error = None;
            }
            Event::RoundCompleted { at } if moved => {
                self.last_sync_timestamp = Some(at);
                self.first_sync.reset();
            }
            Event::Failed { error } => {
                self.last_error = Some(error);
                self.first_sync.reset();
            }
            Event::Cancelled | Event::Dismissed if moved => {
                self.role = None;
                self.current_peer = None;
                self.last_error = None;
                self.first_sync.reset();
            }
            _ => {}
        }

        actions
    }

    // ===========================================
    // Directory
    // ===========================================

    /// Record a discovery broadcast.
    pub fn record_discovery(
        &mut self,
        announcement: &DiscoveryAnnouncement,
        ip_address: impl Into<String>,
        now: u64,
    ) -> Vec<Action> {
        if self.directory.record_discovery(announcement, ip_address, now) {
            vec![Action::EmitEvent(SyncEvent::DeviceDiscovered {
                id: announcement.identity.id,
                name: announcement.identity.name.clone(),
            })]
        } else {
            vec![]
        }
    }

    /// Record a heartbeat.
    pub fn record_heartbeat(&mut self, peer: &DeviceId, now: u64) -> bool {
        self.directory.record_heartbeat(peer, now)
    }

    /// Mark silent devices offline.
    pub fn prune_stale(&mut self, now: u64) -> Vec<Action> {
        self.directory
            .prune_stale(now)
            .into_iter()
            .map(|id| Action::EmitEvent(SyncEvent::DeviceOffline { id }))
            .collect()
    }

    /// Forget discovered devices.
    pub fn clear_discovered(&mut self) {
        self.directory.clear_discovered();
    }

    /// Store a newly paired device. Drops any baseline with it, so the
    /// next round starts fresh.
    pub fn add_paired(&mut self, device: PairedDevice) -> Vec<Action> {
        let event = SyncEvent::Paired {
            peer: device.id,
            name: device.name.clone(),
        };
        self.peer_clocks.remove(&device.id);
        self.directory.upsert_paired(device);
        vec![Action::EmitEvent(event)]
    }

    /// Remove a paired device with its baseline and conflicts.
    pub fn remove_paired(&mut self, peer: &DeviceId) -> Option<PairedDevice> {
        let removed = self.directory.remove_paired(peer)?;
        self.peer_clocks.remove(peer);
        self.conflicts.retain(|c| c.peer != *peer);
        Some(removed)
    }

    // ===========================================
    // Clock and data
    // ===========================================

    /// Dot the next local write will carry.
    pub fn next_local_dot(&self, local: DeviceId) -> Dot {
        Dot::new(local, self.vector_clock.get(&local).saturating_add(1))
    }

    /// Advance the local counter for a committed local write.
    pub fn record_local_change(&mut self, local: DeviceId) -> Dot {
        self.pending_local_changes = self.pending_local_changes.saturating_add(1);
        self.vector_clock.increment(local)
    }

    /// Record a committed sync round with `peer`.
    ///
    /// The plan's merged clock becomes the baseline shared with `peer`;
    /// the local clock is that merge with `local`'s own counter advanced
    /// once more. Open conflicts with `peer` whose field the round just
    /// overwrote are dropped, and new conflicts replace earlier ones on
    /// the same field from the same peer.
    pub fn commit_round(
        &mut self,
        local: DeviceId,
        peer: DeviceId,
        plan: MergePlan,
        at: u64,
    ) -> Vec<Action> {
        self.vector_clock.merge_in(&plan.merged_clock);
        self.peer_clocks.insert(peer, self.vector_clock.clone());
        self.vector_clock.increment(local);
        self.directory.mark_synced(&peer, at);
        self.pending_local_changes = 0;

        let superseded = |c: &Conflict| {
            plan.delta.updates.iter().any(|update| {
                update.key == c.field.key
                    && update.field == c.field.field
                    && update.value.dot != c.remote_dot
            })
        };
        self.conflicts
            .retain(|c| c.resolved || c.peer != peer || !superseded(c));

        for conflict in plan.conflicts {
            self.conflicts
                .retain(|c| !(c.peer == conflict.peer && c.field == conflict.field && !c.resolved));
            self.conflicts.push(conflict);
        }

        let mut actions = Vec::new();
        let unresolved = self.unresolved_conflicts().filter(|c| c.peer == peer).count();
        if unresolved > 0 {
            actions.push(Action::EmitEvent(SyncEvent::ConflictsDetected { peer, unresolved }));
        }
        actions
    }

    /// Record a committed first sync. No conflicts are produced.
    pub fn commit_first_sync(
        &mut self,
        local: DeviceId,
        peer: DeviceId,
        merged_clock: VectorClock,
        at: u64,
    ) {
        let plan = MergePlan {
            merged_clock,
            ..MergePlan::default()
        };
        self.commit_round(local, peer, plan, at);
    }

    /// Mark an unresolved conflict resolved. Returns the updated conflict.
    pub fn resolve_conflict(&mut self, id: &ConflictId, resolution: Resolution) -> Option<Conflict> {
        let conflict = self.conflicts.iter_mut().find(|c| c.id == *id && !c.resolved)?;
        conflict.resolved = true;
        conflict.resolution = Some(resolution);
        Some(conflict.clone())
    }

    /// Look up an unresolved conflict.
    pub fn unresolved_conflict(&self, id: &ConflictId) -> Option<&Conflict> {
        self.conflicts.iter().find(|c| c.id == *id && !c.resolved)
    }

    // ===========================================
    // First sync
    // ===========================================

    /// Block the round on a first-sync decision.
    pub fn begin_first_sync(&mut self, request: FirstSyncRequest) -> Vec<Action> {
        self.first_sync.begin(request.clone());
        vec![Action::EmitEvent(SyncEvent::FirstSyncRequested(request))]
    }

    /// Record the user's first-sync answer.
    pub fn choose_first_sync(&mut self, choice: FirstSyncChoice) -> Result<(), FirstSyncError> {
        self.first_sync.choose(choice)
    }
}

/// Retry delay with jitter for a failed connect or round.
///
/// Formula: min(8s, 500ms * 2^(attempt-1)) + random(0..500ms)
pub fn calculate_backoff(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(4);
    let base_ms = (500u64 << exponent).min(8_000);
    Duration::from_millis(base_ms + random_jitter_ms())
}

/// Random jitter between 0 and 500 milliseconds.
fn random_jitter_ms() -> u64 {
    let mut bytes = [0u8; 8];
    if getrandom::getrandom(&mut bytes).is_err() {
        return 0;
    }
    u64::from_le_bytes(bytes) % 501
}
