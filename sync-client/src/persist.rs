//! Durable engine state: paired devices, clocks and open conflicts.
//!
//! Written only after a pairing or sync round completes (and on unpair or
//! conflict resolution), never mid-round.

use async_trait::async_trait;
use classsync_core::{Conflict, DeviceDirectory, P2PSyncState, PairedDevice};
use classsync_types::{DeviceId, VectorClock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::PersistError;
use crate::store::write_atomic;

/// The persisted part of [`P2PSyncState`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PersistedState {
    /// Paired devices with their shared secrets.
    #[serde(default)]
    pub paired: Vec<PairedDevice>,
    /// Local vector clock.
    #[serde(default)]
    pub vector_clock: VectorClock,
    /// Sync baseline per peer.
    #[serde(default)]
    pub peer_clocks: BTreeMap<DeviceId, VectorClock>,
    /// Conflicts awaiting a manual choice.
    #[serde(default)]
    pub conflicts: Vec<Conflict>,
}

impl PersistedState {
    /// Capture the durable fields of `state`.
    pub fn capture(state: &P2PSyncState) -> Self {
        Self {
            paired: state.directory().paired_devices().cloned().collect(),
            vector_clock: state.vector_clock().clone(),
            peer_clocks: state.peer_clocks().clone(),
            conflicts: state.unresolved_conflicts().cloned().collect(),
        }
    }

    /// Rebuild engine state. Devices go offline after `offline_after_ms`.
    pub fn restore(self, offline_after_ms: u64) -> P2PSyncState {
        let directory = DeviceDirectory::new(offline_after_ms).with_paired(self.paired);
        P2PSyncState::new(directory, self.vector_clock, self.peer_clocks, self.conflicts)
    }
}

/// Where [`PersistedState`] lives.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load the state, or the default when nothing was saved yet.
    async fn load(&self) -> Result<PersistedState, PersistError>;

    /// Replace the saved state.
    async fn save(&self, state: &PersistedState) -> Result<(), PersistError>;
}

/// JSON file (`sync-state.json`), owner-only permissions.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    /// Store at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self) -> Result<PersistedState, PersistError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => parse_state(&bytes).map_err(|source| PersistError::Format {
                path: self.path.clone(),
                source,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PersistedState::default()),
            Err(source) => Err(PersistError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    async fn save(&self, state: &PersistedState) -> Result<(), PersistError> {
        let io = |source| PersistError::Io {
            path: self.path.clone(),
            source,
        };
        let json = serde_json::to_vec_pretty(state).map_err(|source| PersistError::Format {
            path: self.path.clone(),
            source,
        })?;
        write_atomic(&self.path, &json).await.map_err(io)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))
                .await
                .map_err(io)?;
        }
        Ok(())
    }
}

/// Only a JSON object is a saved state.
fn parse_state(bytes: &[u8]) -> Result<PersistedState, serde_json::Error> {
    let value: serde_json::Value = serde_json::from_slice(bytes)?;
    if !value.is_object() {
        return Err(<serde_json::Error as serde::de::Error>::custom(
            "sync state must be a JSON object",
        ));
    }
    serde_json::from_value(value)
}

/// In-memory state store for tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryStateStore {
    inner: Arc<Mutex<(PersistedState, usize)>>,
}

impl MemoryStateStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Last saved state.
    pub fn saved(&self) -> PersistedState {
        self.inner.lock().unwrap().0.clone()
    }

    /// Number of saves.
    pub fn saves(&self) -> usize {
        self.inner.lock().unwrap().1
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self) -> Result<PersistedState, PersistError> {
        Ok(self.saved())
    }

    async fn save(&self, state: &PersistedState) -> Result<(), PersistError> {
        let mut inner = self.inner.lock().unwrap();
        inner.0 = state.clone();
        inner.1 += 1;
        Ok(())
    }
}
