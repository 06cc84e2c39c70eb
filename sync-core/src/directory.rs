//! Paired and discovered devices.
//!
//! The paired list is durable (persisted by `sync-client` after a pairing
//! or sync round completes). The discovered list is rebuilt from broadcasts
//! and never persisted.

use classsync_types::{DeviceId, DeviceIdentity, DiscoveryAnnouncement};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::pairing::SharedSecret;

/// A device this installation has completed pairing with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairedDevice {
    /// Peer device id.
    pub id: DeviceId,
    /// Peer display name.
    pub name: String,
    /// Peer Ed25519 verifying key.
    pub public_key: [u8; 32],
    /// Secret derived at pairing time.
    pub shared_secret: SharedSecret,
    /// When pairing completed (Unix millis).
    pub paired_at: u64,
    /// Last completed sync round (Unix millis).
    pub last_sync_at: Option<u64>,
}

impl PairedDevice {
    /// Public identity of the peer.
    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            id: self.id,
            name: self.name.clone(),
            public_key: self.public_key,
        }
    }
}

/// A device seen on the local network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    /// Device id.
    pub id: DeviceId,
    /// Display name.
    pub name: String,
    /// Source address of the last broadcast.
    pub ip_address: String,
    /// Sync port announced by the device.
    pub port: u16,
    /// Announced Ed25519 verifying key.
    pub public_key: [u8; 32],
    /// Announced application version.
    pub app_version: String,
    /// Last broadcast or heartbeat (Unix millis).
    pub last_seen: u64,
    /// Whether the device is in the paired list.
    pub is_paired: bool,
    /// Cleared when no heartbeat arrives within the offline window.
    pub is_online: bool,
}

impl DiscoveredDevice {
    /// `ip:port` to connect to.
    pub fn address(&self) -> String {
        if self.ip_address.contains(':') {
            format!("[{}]:{}", self.ip_address, self.port)
        } else {
            format!("{}:{}", self.ip_address, self.port)
        }
    }
}

/// What to do with a paired device that stops sending heartbeats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatLossPolicy {
    /// Only mark the device offline.
    #[default]
    OfflineOnly,
    /// Unpair after this long without any contact.
    UnpairAfter {
        /// Seconds without contact before unpairing.
        secs: u64,
    },
}

/// Durable paired list plus the transient discovered list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceDirectory {
    paired: BTreeMap<DeviceId, PairedDevice>,
    discovered: BTreeMap<DeviceId, DiscoveredDevice>,
    offline_after_ms: u64,
}

impl DeviceDirectory {
    /// Create a directory. Devices go offline after `offline_after_ms`
    /// without a broadcast or heartbeat.
    pub fn new(offline_after_ms: u64) -> Self {
        Self {
            paired: BTreeMap::new(),
            discovered: BTreeMap::new(),
            offline_after_ms,
        }
    }

    /// Seed the paired list (from persisted state).
    pub fn with_paired<I: IntoIterator<Item = PairedDevice>>(mut self, devices: I) -> Self {
        for device in devices {
            self.paired.insert(device.id, device);
        }
        self
    }

    // ===========================================
    // Paired devices
    // ===========================================

    /// Insert or overwrite a paired device.
    ///
    /// Re-pairing replaces the secret and resets `last_sync_at`, which
    /// forces a fresh baseline. Returns the previous entry.
    pub fn upsert_paired(&mut self, mut device: PairedDevice) -> Option<PairedDevice> {
        device.last_sync_at = None;
        if let Some(seen) = self.discovered.get_mut(&device.id) {
            seen.is_paired = true;
        }
        self.paired.insert(device.id, device)
    }

    /// Remove a paired device.
    pub fn remove_paired(&mut self, id: &DeviceId) -> Option<PairedDevice> {
        if let Some(seen) = self.discovered.get_mut(id) {
            seen.is_paired = false;
        }
        self.paired.remove(id)
    }

    /// Look up a paired device.
    pub fn paired(&self, id: &DeviceId) -> Option<&PairedDevice> {
        self.paired.get(id)
    }

    /// Whether `id` is paired.
    pub fn is_paired(&self, id: &DeviceId) -> bool {
        self.paired.contains_key(id)
    }

    /// All paired devices in id order.
    pub fn paired_devices(&self) -> impl Iterator<Item = &PairedDevice> {
        self.paired.values()
    }

    /// Record a completed sync round. Returns false for unknown peers.
    pub fn mark_synced(&mut self, id: &DeviceId, at: u64) -> bool {
        match self.paired.get_mut(id) {
            Some(device) => {
                device.last_sync_at = Some(at);
                true
            }
            None => false,
        }
    }

    // ===========================================
    // Discovered devices
    // ===========================================

    /// Record a discovery broadcast received from `ip_address`.
    ///
    /// Returns true when the device is new or came back online.
    pub fn record_discovery(
        &mut self,
        announcement: &DiscoveryAnnouncement,
        ip_address: impl Into<String>,
        now: u64,
    ) -> bool {
        let identity = &announcement.identity;
        let is_paired = self.paired.contains_key(&identity.id);
        let ip_address = ip_address.into();

        match self.discovered.get_mut(&identity.id) {
            Some(seen) => {
                let came_back = !seen.is_online;
                seen.name = identity.name.clone();
                seen.ip_address = ip_address;
                seen.port = announcement.port;
                seen.public_key = identity.public_key;
                seen.app_version = announcement.app_version.clone();
                seen.last_seen = seen.last_seen.max(now);
                seen.is_paired = is_paired;
                seen.is_online = true;
                came_back
            }
            None => {
                self.discovered.insert(
                    identity.id,
                    DiscoveredDevice {
                        id: identity.id,
                        name: identity.name.clone(),
                        ip_address,
                        port: announcement.port,
                        public_key: identity.public_key,
                        app_version: announcement.app_version.clone(),
                        last_seen: now,
                        is_paired,
                        is_online: true,
                    },
                );
                true
            }
        }
    }

    /// Record a heartbeat from a known device. Returns false if unknown.
    pub fn record_heartbeat(&mut self, id: &DeviceId, now: u64) -> bool {
        match self.discovered.get_mut(id) {
            Some(seen) => {
                seen.last_seen = seen.last_seen.max(now);
                seen.is_online = true;
                true
            }
            None => false,
        }
    }

    /// Mark devices offline whose last contact is older than the offline
    /// window. Returns the ids that went offline in this call.
    pub fn prune_stale(&mut self, now: u64) -> Vec<DeviceId> {
        let mut went_offline = Vec::new();
        for seen in self.discovered.values_mut() {
            if seen.is_online && now.saturating_sub(seen.last_seen) > self.offline_after_ms {
                seen.is_online = false;
                went_offline.push(seen.id);
            }
        }
        went_offline
    }

    /// Look up a discovered device.
    pub fn discovered(&self, id: &DeviceId) -> Option<&DiscoveredDevice> {
        self.discovered.get(id)
    }

    /// All discovered devices in id order.
    pub fn discovered_devices(&self) -> impl Iterator<Item = &DiscoveredDevice> {
        self.discovered.values()
    }

    /// Forget every discovered device (discovery stopped).
    pub fn clear_discovered(&mut self) {
        self.discovered.clear();
    }

    /// Paired devices that should be unpaired under `policy`.
    ///
    /// Last contact is the latest of the last broadcast, the last sync and
    /// the pairing time.
    pub fn paired_past_heartbeat_policy(
        &self,
        now: u64,
        policy: HeartbeatLossPolicy,
    ) -> Vec<DeviceId> {
        let limit_ms = match policy {
            HeartbeatLossPolicy::OfflineOnly => return Vec::new(),
            HeartbeatLossPolicy::UnpairAfter { secs } => secs.saturating_mul(1000),
        };
        self.paired
            .values()
            .filter(|device| {
                let seen = self.discovered.get(&device.id).map(|d| d.last_seen);
                let last_contact = [seen, device.last_sync_at, Some(device.paired_at)]
                    .into_iter()
                    .flatten()
                    .max()
                    .unwrap_or(0);
                now.saturating_sub(last_contact) > limit_ms
            })
            .map(|device| device.id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pairing::SecretBytes;

    const NOW: u64 = 1_700_000_000_000;

    fn paired(id: DeviceId) -> PairedDevice {
        PairedDevice {
            id,
            name: "Tablet".into(),
            public_key: [1; 32],
            shared_secret: SecretBytes::from_bytes([2; 32]),
            paired_at: NOW,
            last_sync_at: None,
        }
    }

    fn announcement(id: DeviceId) -> DiscoveryAnnouncement {
        DiscoveryAnnouncement {
            identity: DeviceIdentity {
                id,
                name: "Tablet".into(),
                public_key: [1; 32],
            },
            port: 47801,
            app_version: "1.0.0".into(),
        }
    }

    #[test]
    fn repairing_overwrites_secret_and_resets_last_sync() {
        let id = DeviceId::random();
        let mut directory = DeviceDirectory::new(6_000);
        directory.upsert_paired(paired(id));
        directory.mark_synced(&id, NOW + 5);
        assert_eq!(directory.paired(&id).unwrap().last_sync_at, Some(NOW + 5));

        let mut again = paired(id);
        again.shared_secret = SecretBytes::from_bytes([9; 32]);
        again.last_sync_at = Some(NOW + 99);
        let previous = directory.upsert_paired(again);

        assert!(previous.is_some());
        assert_eq!(directory.paired_devices().count(), 1);
        let stored = directory.paired(&id).unwrap();
        assert_eq!(stored.shared_secret.as_bytes(), &[9; 32]);
        assert_eq!(stored.last_sync_at, None);
    }

    #[test]
    fn remove_paired_clears_flag_on_discovered_entry() {
        let id = DeviceId::random();
        let mut directory = DeviceDirectory::new(6_000);
        directory.upsert_paired(paired(id));
        directory.record_discovery(&announcement(id), "10.0.0.2", NOW);
        assert!(directory.discovered(&id).unwrap().is_paired);

        assert!(directory.remove_paired(&id).is_some());
        assert!(!directory.is_paired(&id));
        assert!(!directory.discovered(&id).unwrap().is_paired);
    }

    #[test]
    fn discovery_updates_address_and_reports_new_devices() {
        let id = DeviceId::random();
        let mut directory = DeviceDirectory::new(6_000);

        assert!(directory.record_discovery(&announcement(id), "10.0.0.2", NOW));
        assert!(!directory.record_discovery(&announcement(id), "10.0.0.3", NOW + 1));

        let seen = directory.discovered(&id).unwrap();
        assert_eq!(seen.address(), "10.0.0.3:47801");
        assert_eq!(seen.last_seen, NOW + 1);
    }

    #[test]
    fn prune_marks_silent_devices_offline_once() {
        let quiet = DeviceId::random();
        let chatty = DeviceId::random();
        let mut directory = DeviceDirectory::new(6_000);
        directory.record_discovery(&announcement(quiet), "10.0.0.2", NOW);
        directory.record_discovery(&announcement(chatty), "10.0.0.3", NOW);
        directory.record_heartbeat(&chatty, NOW + 5_000);

        assert!(directory.prune_stale(NOW + 6_000).is_empty());
        assert_eq!(directory.prune_stale(NOW + 7_000), vec![quiet]);
        assert!(directory.prune_stale(NOW + 8_000).is_empty());
        assert!(directory.discovered(&chatty).unwrap().is_online);

        // A fresh broadcast brings the device back
        assert!(directory.record_discovery(&announcement(quiet), "10.0.0.2", NOW + 9_000));
        assert!(directory.discovered(&quiet).unwrap().is_online);
    }

    #[test]
    fn heartbeat_from_unknown_device_is_ignored() {
        let mut directory = DeviceDirectory::new(6_000);
        assert!(!directory.record_heartbeat(&DeviceId::random(), NOW));
    }

    #[test]
    fn offline_only_policy_never_unpairs() {
        let id = DeviceId::random();
        let directory = DeviceDirectory::new(6_000).with_paired([paired(id)]);
        let stale = directory.paired_past_heartbeat_policy(NOW * 2, HeartbeatLossPolicy::OfflineOnly);
        assert!(stale.is_empty());
    }

    #[test]
    fn unpair_policy_uses_latest_contact() {
        let old = DeviceId::random();
        let recent = DeviceId::random();
        let mut directory = DeviceDirectory::new(6_000).with_paired([paired(old), paired(recent)]);
        directory.record_discovery(&announcement(recent), "10.0.0.5", NOW + 50_000);

        let policy = HeartbeatLossPolicy::UnpairAfter { secs: 60 };
        let stale = directory.paired_past_heartbeat_policy(NOW + 90_000, policy);
        assert_eq!(stale, vec![old]);
    }

    #[test]
    fn heartbeat_policy_serde_shapes() {
        #[derive(Deserialize)]
        struct Wrapper {
            policy: HeartbeatLossPolicy,
        }
        fn parse(value: &str) -> HeartbeatLossPolicy {
            let wrapper: Wrapper =
                serde_json::from_str(&format!("{{\"policy\": {}}}", value)).unwrap();
            wrapper.policy
        }

        assert_eq!(parse("\"offline_only\""), HeartbeatLossPolicy::OfflineOnly);
        assert_eq!(
            parse("{\"unpair_after\": {\"secs\": 30}}"),
            HeartbeatLossPolicy::UnpairAfter { secs: 30 }
        );
    }
}
