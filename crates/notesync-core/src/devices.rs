//! Known devices sharing the sync key.
//!
//! Every record that passes through the change log tells us a device exists
//! and how far its clock has progressed. Tombstone GC uses this to decide
//! whether every device has moved past a deletion.
//!
//! Stored in `.sync/devices.json`.

use crate::DeviceId;
use crate::fs::{self, FileSystem};
use crate::model::Stamp;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEVICES_PATH: &str = ".sync/devices.json";

/// What we know about one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnownDevice {
    pub device_id: DeviceId,
    /// Latest stamp seen from this device
    pub last_stamp: Stamp,
    /// Local wall time when that stamp was seen (unix ms)
    pub last_seen_ms: u64,
}

/// Collection of known devices, keyed by id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KnownDevices {
    devices: BTreeMap<DeviceId, KnownDevice>,
}

impl KnownDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn load<F: FileSystem + ?Sized>(fs: &F) -> fs::Result<Self> {
        Ok(fs::read_json(fs, DEVICES_PATH).await?.unwrap_or_default())
    }

    pub async fn save<F: FileSystem + ?Sized>(&self, fs: &F) -> fs::Result<()> {
        fs::write_json(fs, DEVICES_PATH, self).await
    }

    /// Record a stamp produced by a device. Returns true if it advanced what
    /// we knew about that device.
    pub fn observe(&mut self, stamp: Stamp, now_ms: u64) -> bool {
        match self.devices.get_mut(&stamp.origin) {
            Some(known) if known.last_stamp >= stamp => false,
            Some(known) => {
                known.last_stamp = stamp;
                known.last_seen_ms = now_ms;
                true
            }
            None => {
                self.devices.insert(
                    stamp.origin,
                    KnownDevice {
                        device_id: stamp.origin,
                        last_stamp: stamp,
                        last_seen_ms: now_ms,
                    },
                );
                true
            }
        }
    }

    pub fn get(&self, device: DeviceId) -> Option<&KnownDevice> {
        self.devices.get(&device)
    }

    pub fn all(&self) -> impl Iterator<Item = &KnownDevice> {
        self.devices.values()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Whether every known device other than `local` has produced a stamp
    /// after `deletion`. A device stamping after the deletion has merged the
    /// mirror state that contained it.
    pub fn all_observed(&self, deletion: Stamp, local: DeviceId) -> bool {
        self.devices
            .values()
            .filter(|d| d.device_id != local && d.device_id != deletion.origin)
            .all(|d| d.last_stamp.at > deletion.at)
    }

    pub fn forget(&mut self, device: DeviceId) -> bool {
        self.devices.remove(&device).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Timestamp;
    use crate::fs::InMemoryFs;

    fn stamp(wall: u64, device: u64) -> Stamp {
        Stamp::new(Timestamp::new(wall, 0), DeviceId::from(device))
    }

    #[test]
    fn test_observe_tracks_latest_stamp() {
        let mut devices = KnownDevices::new();
        assert!(devices.observe(stamp(10, 1), 100));
        assert!(devices.observe(stamp(20, 1), 200));
        assert!(!devices.observe(stamp(15, 1), 300));

        let known = devices.get(DeviceId::from(1)).unwrap();
        assert_eq!(known.last_stamp, stamp(20, 1));
        assert_eq!(known.last_seen_ms, 200);
    }

    #[test]
    fn test_all_observed_requires_every_remote_device() {
        let local = DeviceId::from(1);
        let mut devices = KnownDevices::new();
        devices.observe(stamp(50, 1), 0);
        devices.observe(stamp(60, 2), 0);
        devices.observe(stamp(30, 3), 0);

        let deletion = stamp(40, 1);
        assert!(!devices.all_observed(deletion, local));

        devices.observe(stamp(45, 3), 0);
        assert!(devices.all_observed(deletion, local));
    }

    #[test]
    fn test_deleting_device_counts_as_observer() {
        let mut devices = KnownDevices::new();
        devices.observe(stamp(40, 2), 0);
        assert!(devices.all_observed(stamp(40, 2), DeviceId::from(1)));
    }

    #[tokio::test]
    async fn test_round_trips_through_filesystem() {
        let fs = InMemoryFs::new();
        let mut devices = KnownDevices::new();
        devices.observe(stamp(10, 7), 99);
        devices.save(&fs).await.unwrap();

        let loaded = KnownDevices::load(&fs).await.unwrap();
        assert_eq!(loaded, devices);
        assert!(fs.exists(DEVICES_PATH).await.unwrap());
    }

    #[tokio::test]
    async fn test_load_missing_file_is_empty() {
        let fs = InMemoryFs::new();
        assert!(KnownDevices::load(&fs).await.unwrap().is_empty());
    }
}
