// Radio adapter abstraction.
//
// The session manager never touches the platform Bluetooth stack directly;
// everything goes through the `RadioAdapter` trait so tests can drive the
// state machine with a scripted double. `btle` provides the production
// implementation over btleplug.

pub mod btle;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

/// Stable, opaque identifier for a physical peripheral (the platform's
/// peripheral id string). Immutable once observed; key for every per-device
/// map in the crate.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// One advertisement callback's worth of data. Ephemeral — many may arrive
/// for the same peripheral within a single scan window.
#[derive(Clone, Debug)]
pub struct Sighting {
    pub id: DeviceId,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub seen_at: DateTime<Utc>,
}

/// Outcome of an adapter-level disconnect.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisconnectOutcome {
    /// The link was up and has been torn down.
    Done,
    /// The peripheral was already gone (raced with a radio-initiated drop).
    /// Not an error.
    AlreadyGone,
}

/// Lazy sequence of advertisement sightings for one scan window.
pub type SightingStream = BoxStream<'static, Sighting>;

/// Raw notification payloads from one subscribed endpoint, in arrival order.
pub type NotificationStream = BoxStream<'static, Vec<u8>>;

/// The physical radio, abstracted to the operations the session manager
/// needs. One instance is owned by the manager (passed in at construction).
#[async_trait]
pub trait RadioAdapter: Send + Sync + 'static {
    /// Opaque live-link handle. Owned by the adapter; the manager only
    /// stores and passes it back.
    type Transport: Clone + Send + Sync + 'static;

    /// Begin advertising discovery and return the sighting sequence.
    /// The stream stays open until `stop_scan` or the adapter gives up.
    async fn scan(&self) -> Result<SightingStream>;

    /// End an active scan. Idempotent.
    async fn stop_scan(&self);

    /// Establish a transport link to the peripheral.
    async fn connect(&self, id: &DeviceId) -> Result<Self::Transport>;

    /// Enumerate the peripheral's endpoints on a fresh link. Must complete
    /// before any `write`/`subscribe` on the same transport.
    async fn discover_endpoints(&self, transport: &Self::Transport) -> Result<()>;

    /// Whether the link to the peripheral is currently up.
    async fn is_connected(&self, id: &DeviceId) -> bool;

    /// Tear the link down. An already-dropped link is reported as
    /// `AlreadyGone`, distinct from a failure.
    async fn disconnect(&self, id: &DeviceId) -> Result<DisconnectOutcome>;

    /// Write a payload to one endpoint, with response.
    async fn write(&self, transport: &Self::Transport, endpoint: Uuid, payload: &[u8])
        -> Result<()>;

    /// Subscribe to an endpoint's notifications.
    async fn subscribe(&self, transport: &Self::Transport, endpoint: Uuid)
        -> Result<NotificationStream>;
}

/// Build a 128-bit UUID from the same 5-field encoding used by Zephyr's
/// BT_UUID_128_ENCODE macro.
pub const fn uuid_from_fields(a: u32, b: u16, c: u16, d: u16, e: u64) -> Uuid {
    let hi: u64 = (a as u64) << 32 | (b as u64) << 16 | c as u64;
    let lo: u64 = (d as u64) << 48 | e;
    Uuid::from_u128(((hi as u128) << 64) | lo as u128)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_encoding() {
        let uuid = uuid_from_fields(0x0000ffe0, 0x0000, 0x1000, 0x8000, 0x00805f9b34fb);
        assert_eq!(uuid.to_string(), "0000ffe0-0000-1000-8000-00805f9b34fb");
    }

    #[test]
    fn device_id_round_trips_through_json() {
        let id = DeviceId::new("AA:BB:CC:DD:EE:FF");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"AA:BB:CC:DD:EE:FF\"");
        let back: DeviceId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
