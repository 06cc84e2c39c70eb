//! Sync settings.
//!
//! Settings are loaded from a TOML file (default: `settings.toml`). Every
//! field has a default, so an empty or missing file yields a working
//! configuration.

use classsync_core::{ConflictStrategy, HeartbeatLossPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// User-facing sync settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Sync automatically with paired devices when they are discovered
    /// (default: false).
    #[serde(default)]
    pub auto_sync: bool,
    /// How concurrent field edits are settled (default: newest).
    #[serde(default)]
    pub conflict_strategy: ConflictStrategy,
    /// UDP port for discovery broadcasts (default: 47800).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// TCP port sync sessions are accepted on (default: 47801).
    #[serde(default = "default_sync_port")]
    pub sync_port: u16,
    /// Seconds between discovery broadcasts (default: 2).
    #[serde(default = "default_broadcast_interval_secs")]
    pub broadcast_interval_secs: u64,
    /// Missed broadcasts before a device is shown offline (default: 3).
    #[serde(default = "default_offline_after_missed")]
    pub offline_after_missed: u32,
    /// Timeout for every network operation in seconds (default: 10).
    #[serde(default = "default_network_timeout_secs")]
    pub network_timeout_secs: u64,
    /// Retries after a timed-out connect or round (default: 3).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Lifetime of a pairing QR code in seconds (default: 300).
    #[serde(default = "default_pairing_ttl_secs")]
    pub pairing_ttl_secs: u64,
    /// How long a responder waits for the first-sync decision
    /// (default: 300).
    #[serde(default = "default_first_sync_choice_timeout_secs")]
    pub first_sync_choice_timeout_secs: u64,
    /// What happens to paired devices that stop broadcasting
    /// (default: offline_only).
    #[serde(default)]
    pub heartbeat_loss: HeartbeatLossPolicy,
}

// Default value functions
fn default_discovery_port() -> u16 {
    47800
}

fn default_sync_port() -> u16 {
    47801
}

fn default_broadcast_interval_secs() -> u64 {
    2
}

fn default_offline_after_missed() -> u32 {
    3
}

fn default_network_timeout_secs() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    3
}

fn default_pairing_ttl_secs() -> u64 {
    300 // 5 minutes
}

fn default_first_sync_choice_timeout_secs() -> u64 {
    300
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            auto_sync: false,
            conflict_strategy: ConflictStrategy::default(),
            discovery_port: default_discovery_port(),
            sync_port: default_sync_port(),
            broadcast_interval_secs: default_broadcast_interval_secs(),
            offline_after_missed: default_offline_after_missed(),
            network_timeout_secs: default_network_timeout_secs(),
            max_retries: default_max_retries(),
            pairing_ttl_secs: default_pairing_ttl_secs(),
            first_sync_choice_timeout_secs: default_first_sync_choice_timeout_secs(),
            heartbeat_loss: HeartbeatLossPolicy::default(),
        }
    }
}

impl SyncSettings {
    /// Load settings from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let settings: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings, falling back to defaults when the file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Write settings as TOML, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::SerializeError)?;
        let write = |e| ConfigError::WriteError {
            path: path.to_path_buf(),
            source: e,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(write)?;
        }
        std::fs::write(path, content).map_err(write)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broadcast_interval_secs == 0 {
            return Err(ConfigError::Invalid("broadcast_interval_secs must be positive".into()));
        }
        if self.offline_after_missed == 0 {
            return Err(ConfigError::Invalid("offline_after_missed must be positive".into()));
        }
        if self.network_timeout_secs == 0 {
            return Err(ConfigError::Invalid("network_timeout_secs must be positive".into()));
        }
        if self.pairing_ttl_secs == 0 {
            return Err(ConfigError::Invalid("pairing_ttl_secs must be positive".into()));
        }
        Ok(())
    }

    /// Timeout applied to each network operation.
    pub fn network_timeout(&self) -> Duration {
        Duration::from_secs(self.network_timeout_secs)
    }

    /// Time between discovery broadcasts.
    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_secs(self.broadcast_interval_secs)
    }

    /// Silence (in millis) after which a discovered device goes offline.
    pub fn offline_after_ms(&self) -> u64 {
        self.broadcast_interval_secs
            .saturating_mul(u64::from(self.offline_after_missed))
            .saturating_mul(1000)
    }

    /// Pairing QR lifetime.
    pub fn pairing_ttl(&self) -> Duration {
        Duration::from_secs(self.pairing_ttl_secs)
    }

    /// Responder wait for the first-sync decision.
    pub fn first_sync_choice_timeout(&self) -> Duration {
        Duration::from_secs(self.first_sync_choice_timeout_secs)
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
    /// Failed to write configuration file.
    #[error("failed to write config file {path}: {source}")]
    WriteError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to encode settings.
    #[error("failed to encode settings: {0}")]
    SerializeError(toml::ser::Error),
    /// A value is out of range.
    #[error("invalid setting: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_are_valid() {
        let settings = SyncSettings::default();
        assert_eq!(settings.discovery_port, 47800);
        assert_eq!(settings.sync_port, 47801);
        assert_eq!(settings.conflict_strategy, ConflictStrategy::Newest);
        assert_eq!(settings.heartbeat_loss, HeartbeatLossPolicy::OfflineOnly);
        assert!(!settings.auto_sync);
        settings.validate().unwrap();
    }

    #[test]
    fn settings_from_toml_string() {
        let toml = r#"
auto_sync = true
conflict_strategy = "manual"
discovery_port = 5000
max_retries = 5

[heartbeat_loss.unpair_after]
secs = 86400
"#;

        let settings: SyncSettings = toml::from_str(toml).unwrap();
        assert!(settings.auto_sync);
        assert_eq!(settings.conflict_strategy, ConflictStrategy::Manual);
        assert_eq!(settings.discovery_port, 5000);
        assert_eq!(settings.max_retries, 5);
        assert_eq!(
            settings.heartbeat_loss,
            HeartbeatLossPolicy::UnpairAfter { secs: 86400 }
        );
        // Unset fields keep their defaults
        assert_eq!(settings.sync_port, 47801);
        assert_eq!(settings.network_timeout_secs, 10);
    }

    #[test]
    fn empty_file_gives_defaults() {
        let settings: SyncSettings = toml::from_str("").unwrap();
        assert_eq!(settings, SyncSettings::default());
    }

    #[test]
    fn offline_window_is_multiple_of_broadcast_interval() {
        let settings = SyncSettings::default();
        assert_eq!(settings.offline_after_ms(), 6_000);
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.toml");
        let settings = SyncSettings {
            auto_sync: true,
            conflict_strategy: ConflictStrategy::Merge,
            heartbeat_loss: HeartbeatLossPolicy::UnpairAfter { secs: 60 },
            ..Default::default()
        };
        settings.save(&path).unwrap();
        assert_eq!(SyncSettings::from_file(&path).unwrap(), settings);
    }

    #[test]
    fn missing_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = SyncSettings::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(settings, SyncSettings::default());
    }

    #[test]
    fn zero_interval_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "broadcast_interval_secs = 0\n").unwrap();
        assert!(matches!(
            SyncSettings::from_file(&path),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn parse_error_names_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "discovery_port = \"high\"\n").unwrap();
        let err = SyncSettings::from_file(&path).unwrap_err();
        assert!(err.to_string().contains("settings.toml"));
    }
}
