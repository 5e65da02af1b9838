// Persisted known-device collection.
//
// A single JSON array of records keyed by device id, read in full at open
// and rewritten in full on every mutation (write to a temp file, then
// rename). The session manager is the only writer; collaborators read
// snapshots.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{LinkError, Result};
use crate::radio::DeviceId;

/// Persisted connection status of a known device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    NeverConnected,
    Connected,
    Disconnected,
}

/// One remembered peripheral. Created on first successful connection and
/// kept until the user explicitly forgets it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownDevice {
    pub id: DeviceId,
    pub name: String,
    pub status: DeviceStatus,
}

pub struct DeviceStore {
    path: PathBuf,
    devices: Vec<KnownDevice>,
}

impl DeviceStore {
    /// Open the store at `path`, reading the full collection. A missing
    /// file is an empty store, not an error.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let devices = if path.exists() {
            let content = fs::read_to_string(&path)
                .map_err(|e| LinkError::Store(format!("failed to read {}: {e}", path.display())))?;
            serde_json::from_str(&content)
                .map_err(|e| LinkError::Store(format!("failed to parse {}: {e}", path.display())))?
        } else {
            Vec::new()
        };
        Ok(Self { path, devices })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of every record, in stored order.
    pub fn devices(&self) -> &[KnownDevice] {
        &self.devices
    }

    pub fn get(&self, id: &DeviceId) -> Option<&KnownDevice> {
        self.devices.iter().find(|d| &d.id == id)
    }

    /// Record a successful connection. Creates the record on first
    /// connection; on an existing record only the status changes — the
    /// display name recorded back then is preserved.
    pub fn mark_connected(&mut self, id: &DeviceId, name: &str) -> Result<()> {
        match self.devices.iter_mut().find(|d| &d.id == id) {
            Some(device) => device.status = DeviceStatus::Connected,
            None => self.devices.push(KnownDevice {
                id: id.clone(),
                name: name.to_string(),
                status: DeviceStatus::Connected,
            }),
        }
        self.persist()
    }

    /// Record a disconnect. A no-op for ids the store has never seen —
    /// records are only ever created by a successful connection.
    pub fn mark_disconnected(&mut self, id: &DeviceId) -> Result<()> {
        match self.devices.iter_mut().find(|d| &d.id == id) {
            Some(device) => {
                device.status = DeviceStatus::Disconnected;
                self.persist()
            }
            None => Ok(()),
        }
    }

    /// Drop a remembered device. Explicit user action; returns whether a
    /// record existed.
    pub fn forget(&mut self, id: &DeviceId) -> Result<bool> {
        let before = self.devices.len();
        self.devices.retain(|d| &d.id != id);
        if self.devices.len() == before {
            return Ok(false);
        }
        self.persist()?;
        Ok(true)
    }

    /// Rewrite the whole collection. Temp file + rename so a crash mid-write
    /// never leaves a truncated store, and the data is on disk before the
    /// caller's state transition completes.
    fn persist(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                LinkError::Store(format!("failed to create {}: {e}", parent.display()))
            })?;
        }

        let json = serde_json::to_string_pretty(&self.devices)
            .map_err(|e| LinkError::Store(format!("failed to serialise store: {e}")))?;

        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, &json)
            .map_err(|e| LinkError::Store(format!("failed to write temp file: {e}")))?;
        fs::rename(&temp_path, &self.path)
            .map_err(|e| LinkError::Store(format!("failed to rename temp file: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &tempfile::TempDir) -> DeviceStore {
        DeviceStore::open(dir.path().join("known_devices.json")).unwrap()
    }

    #[test]
    fn missing_file_is_an_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        assert!(store.devices().is_empty());
    }

    #[test]
    fn first_connection_creates_the_record() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);
        let id = DeviceId::new("AA:BB");
        store.mark_connected(&id, "Relay-1").unwrap();

        let device = store.get(&id).unwrap();
        assert_eq!(device.name, "Relay-1");
        assert_eq!(device.status, DeviceStatus::Connected);
    }

    #[test]
    fn reconnect_preserves_the_original_name() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);
        let id = DeviceId::new("AA:BB");
        store.mark_connected(&id, "Relay-1").unwrap();
        store.mark_disconnected(&id).unwrap();
        store.mark_connected(&id, "Renamed-Later").unwrap();

        let device = store.get(&id).unwrap();
        assert_eq!(device.name, "Relay-1");
        assert_eq!(device.status, DeviceStatus::Connected);
    }

    #[test]
    fn disconnect_of_unknown_id_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);
        store.mark_disconnected(&DeviceId::new("never-seen")).unwrap();
        assert!(store.devices().is_empty());
    }

    #[test]
    fn mutations_survive_a_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_devices.json");
        let a = DeviceId::new("AA:BB");
        let b = DeviceId::new("CC:DD");

        {
            let mut store = DeviceStore::open(path.clone()).unwrap();
            store.mark_connected(&a, "Relay-1").unwrap();
            store.mark_connected(&b, "Relay-2").unwrap();
            store.mark_disconnected(&a).unwrap();
        }

        let store = DeviceStore::open(path).unwrap();
        assert_eq!(store.devices().len(), 2);
        assert_eq!(store.get(&a).unwrap().status, DeviceStatus::Disconnected);
        assert_eq!(store.get(&b).unwrap().status, DeviceStatus::Connected);
        // Stored order is record-creation order.
        assert_eq!(store.devices()[0].id, a);
    }

    #[test]
    fn forget_removes_the_record() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);
        let id = DeviceId::new("AA:BB");
        store.mark_connected(&id, "Relay-1").unwrap();

        assert!(store.forget(&id).unwrap());
        assert!(store.get(&id).is_none());
        assert!(!store.forget(&id).unwrap());
    }

    #[test]
    fn no_temp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);
        store.mark_connected(&DeviceId::new("AA:BB"), "Relay-1").unwrap();
        assert!(!dir.path().join("known_devices.json.tmp").exists());
        assert!(dir.path().join("known_devices.json").exists());
    }

    #[test]
    fn status_serialises_snake_case() {
        let json = serde_json::to_string(&DeviceStatus::NeverConnected).unwrap();
        assert_eq!(json, "\"never_connected\"");
    }
}
