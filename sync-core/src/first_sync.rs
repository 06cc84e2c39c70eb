//! First-sync arbitration.
//!
//! When two devices that have never exchanged data meet, field-level
//! reconciliation would interleave two unrelated datasets. Instead the user
//! picks whose dataset wins; the loser archives its data and adopts the
//! winner's dataset wholesale.

use classsync_types::{DataStats, DeviceId, VectorClock};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// User's answer to a first-sync prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirstSyncChoice {
    /// This device's data wins.
    Local,
    /// The peer's data wins.
    Remote,
    /// Abort the round without changing anything.
    Cancel,
}

impl FirstSyncChoice {
    /// Winning device for this choice, or `None` on cancel.
    pub fn winner(&self, local: DeviceId, remote: DeviceId) -> Option<DeviceId> {
        match self {
            FirstSyncChoice::Local => Some(local),
            FirstSyncChoice::Remote => Some(remote),
            FirstSyncChoice::Cancel => None,
        }
    }
}

/// The prompt shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirstSyncRequest {
    /// Peer device id.
    pub peer: DeviceId,
    /// Peer display name.
    pub peer_name: String,
    /// Summary of this device's data.
    pub local_stats: DataStats,
    /// Summary of the peer's data.
    pub remote_stats: DataStats,
}

/// Errors recording a first-sync choice.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FirstSyncError {
    /// No prompt is waiting for an answer.
    #[error("no first sync is awaiting a choice")]
    NotAwaiting,
    /// A choice was already recorded.
    #[error("first sync choice already recorded")]
    AlreadyChosen,
}

/// Session-scoped first-sync state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirstSyncState {
    /// Whether the current round is a first sync.
    pub is_first_sync: bool,
    /// The prompt, while one is active.
    pub pending_request: Option<FirstSyncRequest>,
    /// Whether the round is blocked on the user's answer.
    pub awaiting_choice: bool,
    /// The recorded answer.
    pub selected_choice: Option<FirstSyncChoice>,
    /// Peer's data summary.
    pub remote_data_stats: Option<DataStats>,
}

impl FirstSyncState {
    /// Enter `awaiting_choice` with `request`.
    pub fn begin(&mut self, request: FirstSyncRequest) {
        self.is_first_sync = true;
        self.remote_data_stats = Some(request.remote_stats.clone());
        self.pending_request = Some(request);
        self.awaiting_choice = true;
        self.selected_choice = None;
    }

    /// Record the user's answer.
    pub fn choose(&mut self, choice: FirstSyncChoice) -> Result<(), FirstSyncError> {
        if self.selected_choice.is_some() {
            return Err(FirstSyncError::AlreadyChosen);
        }
        if !self.awaiting_choice {
            return Err(FirstSyncError::NotAwaiting);
        }
        self.awaiting_choice = false;
        self.selected_choice = Some(choice);
        Ok(())
    }

    /// Clear everything (round finished or aborted).
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Whether a round between these two sides must go through arbitration.
///
/// True when neither side has a recorded baseline with the other, the
/// clocks share no history, and at least one side has data.
pub fn needs_first_sync(
    baseline_known: bool,
    local_clock: &VectorClock,
    remote_clock: &VectorClock,
    local_stats: &DataStats,
    remote_stats: &DataStats,
) -> bool {
    if baseline_known || local_clock.shares_history_with(remote_clock) {
        return false;
    }
    !(local_stats.is_empty() && remote_stats.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use classsync_types::Collection;
    use std::collections::BTreeMap;

    fn stats(classes: u64) -> DataStats {
        let mut record_counts = BTreeMap::new();
        if classes > 0 {
            record_counts.insert(Collection::Classes, classes);
        }
        DataStats {
            record_counts,
            total_records: classes,
            latest_modification: (classes > 0).then_some(1_700_000_000_000),
        }
    }

    #[test]
    fn fresh_install_meeting_populated_device_needs_first_sync() {
        let remote = VectorClock::from_entries([(DeviceId::random(), 3)]);
        assert!(needs_first_sync(
            false,
            &VectorClock::new(),
            &remote,
            &stats(0),
            &stats(3)
        ));
    }

    #[test]
    fn two_empty_devices_skip_arbitration() {
        assert!(!needs_first_sync(
            false,
            &VectorClock::new(),
            &VectorClock::new(),
            &stats(0),
            &stats(0)
        ));
    }

    #[test]
    fn shared_history_or_baseline_skips_arbitration() {
        let a = DeviceId::random();
        let b = DeviceId::random();
        let local = VectorClock::from_entries([(a, 2), (b, 1)]);
        let remote = VectorClock::from_entries([(b, 4)]);
        assert!(!needs_first_sync(false, &local, &remote, &stats(2), &stats(5)));

        let unrelated = VectorClock::from_entries([(a, 2)]);
        assert!(needs_first_sync(false, &unrelated, &remote, &stats(2), &stats(5)));
        assert!(!needs_first_sync(true, &unrelated, &remote, &stats(2), &stats(5)));
    }

    #[test]
    fn choice_is_recorded_once() {
        let mut state = FirstSyncState::default();
        assert_eq!(
            state.choose(FirstSyncChoice::Remote),
            Err(FirstSyncError::NotAwaiting)
        );

        state.begin(FirstSyncRequest {
            peer: DeviceId::random(),
            peer_name: "Laptop".into(),
            local_stats: stats(0),
            remote_stats: stats(3),
        });
        assert!(state.is_first_sync && state.awaiting_choice);
        assert_eq!(state.remote_data_stats, Some(stats(3)));

        state.choose(FirstSyncChoice::Remote).unwrap();
        assert!(!state.awaiting_choice);
        assert_eq!(
            state.choose(FirstSyncChoice::Local),
            Err(FirstSyncError::AlreadyChosen)
        );

        state.reset();
        assert_eq!(state, FirstSyncState::default());
    }

    #[test]
    fn winner_follows_choice() {
        let me = DeviceId::random();
        let peer = DeviceId::random();
        assert_eq!(FirstSyncChoice::Local.winner(me, peer), Some(me));
        assert_eq!(FirstSyncChoice::Remote.winner(me, peer), Some(peer));
        assert_eq!(FirstSyncChoice::Cancel.winner(me, peer), None);
    }
}
