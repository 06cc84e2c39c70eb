//! Data directory layout for the classsync CLI.
//!
//! ```text
//! <data dir>/
//!   identity.json    device id and Ed25519 key (0600)
//!   settings.toml    SyncSettings (0600)
//!   records.json     classroom records
//!   sync-state.json  paired devices, clocks, open conflicts (0600)
//! ```

use anyhow::{Context, Result};
use classsync_client::{
    CryptoIdentity, FileStateStore, JsonFileStore, PersistedState, StateStore, SyncEngine,
    SyncSettings, TcpConnector,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// The engine as the CLI runs it: JSON records over TCP.
pub type CliEngine = SyncEngine<JsonFileStore, TcpConnector>;

/// Paths inside one device's data directory.
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Wrap `root` without touching the filesystem.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The directory itself.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn identity_path(&self) -> PathBuf {
        self.root.join("identity.json")
    }

    pub fn settings_path(&self) -> PathBuf {
        self.root.join("settings.toml")
    }

    pub fn records_path(&self) -> PathBuf {
        self.root.join("records.json")
    }

    pub fn state_path(&self) -> PathBuf {
        self.root.join("sync-state.json")
    }

    /// Create the directory (0700) if missing.
    pub async fn ensure(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .context("Failed to create data directory")?;
        set_dir_permissions_0700(&self.root).await
    }

    /// Check if the device identity exists.
    pub fn is_initialized(&self) -> bool {
        self.identity_path().exists()
    }

    /// Load the device identity.
    pub async fn identity(&self) -> Result<CryptoIdentity> {
        if !self.is_initialized() {
            anyhow::bail!("Device not initialized. Run 'classsync init --name <name>' first.");
        }
        CryptoIdentity::load_or_generate(self.identity_path(), "")
            .await
            .context("Invalid device identity")
    }

    /// Load settings, falling back to defaults when the file is missing.
    pub fn settings(&self) -> Result<SyncSettings> {
        SyncSettings::load_or_default(&self.settings_path()).context("Invalid settings")
    }

    /// Write settings as TOML (0600).
    pub async fn save_settings(&self, settings: &SyncSettings) -> Result<()> {
        let path = self.settings_path();
        settings.save(&path).context("Failed to save settings")?;
        set_file_permissions_0600(&path).await
    }

    /// Read the persisted engine state without starting an engine.
    pub async fn load_state(&self) -> Result<PersistedState> {
        FileStateStore::new(self.state_path())
            .load()
            .await
            .context("Invalid sync state")
    }

    /// Restore the engine for this device.
    pub async fn open_engine(&self) -> Result<CliEngine> {
        let identity = self.identity().await?;
        let settings = self.settings()?;
        let connector = TcpConnector::new(settings.network_timeout());
        let engine = SyncEngine::builder(identity, JsonFileStore::new(self.records_path()), connector)
            .with_settings(settings)
            .with_state_store(Arc::new(FileStateStore::new(self.state_path())))
            .build()
            .await
            .context("Failed to start sync engine")?;
        Ok(engine)
    }
}

/// Set file permissions to 0600 (owner read/write only) on Unix.
/// No-op on non-Unix platforms.
async fn set_file_permissions_0600(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .await
            .context("Failed to set file permissions")?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

/// Set directory permissions to 0700 (owner only) on Unix.
/// No-op on non-Unix platforms.
async fn set_dir_permissions_0700(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
            .await
            .context("Failed to set directory permissions")?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn uninitialized_dir_has_no_identity() {
        let dir = tempdir().unwrap();
        let data = DataDir::new(dir.path());
        assert!(!data.is_initialized());
        assert!(data.identity().await.is_err());
        assert!(data.open_engine().await.is_err());
    }

    #[tokio::test]
    async fn missing_settings_use_defaults() {
        let dir = tempdir().unwrap();
        let data = DataDir::new(dir.path());
        assert_eq!(data.settings().unwrap(), SyncSettings::default());
        assert_eq!(data.load_state().await.unwrap(), PersistedState::default());
    }

    #[tokio::test]
    async fn settings_roundtrip() {
        let dir = tempdir().unwrap();
        let data = DataDir::new(dir.path());
        let settings = SyncSettings {
            auto_sync: true,
            sync_port: 50001,
            ..SyncSettings::default()
        };
        data.save_settings(&settings).await.unwrap();
        assert_eq!(data.settings().unwrap(), settings);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn settings_file_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let data = DataDir::new(dir.path());
        data.save_settings(&SyncSettings::default()).await.unwrap();

        let perms = tokio::fs::metadata(data.settings_path()).await.unwrap().permissions();
        assert_eq!(perms.mode() & 0o777, 0o600, "file should be 0600");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn data_dir_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let data = DataDir::new(dir.path().join("test-data"));
        data.ensure().await.unwrap();

        let perms = tokio::fs::metadata(data.root()).await.unwrap().permissions();
        assert_eq!(perms.mode() & 0o777, 0o700, "dir should be 0700");
    }
}
