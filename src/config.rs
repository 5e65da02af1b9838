// Runtime configuration for the session manager.
//
// Serialisable so a host application can persist it next to its own
// settings. Every field has a default; an empty `{}` deserialises to the
// stock configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::radio::uuid_from_fields;

// GATT endpoints of a SafeOp-class relay unit. The FFE0 vendor pattern is
// a placeholder until the peripheral protocol is published; override via
// config for units that differ.
const RELAY_SERVICE_UUID: Uuid = uuid_from_fields(0x0000ffe0, 0x0000, 0x1000, 0x8000, 0x00805f9b34fb);
const RELAY_COMMAND_UUID: Uuid = uuid_from_fields(0x0000ffe1, 0x0000, 0x1000, 0x8000, 0x00805f9b34fb);
const INPUT_STATE_UUID: Uuid = uuid_from_fields(0x0000ffe2, 0x0000, 0x1000, 0x8000, 0x00805f9b34fb);

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LinkConfig {
    /// How long one scan window stays open before discovery auto-stops.
    #[serde(default = "default_scan_window_ms")]
    pub scan_window_ms: u64,

    /// Upper bound on a single connect attempt (transport + endpoint
    /// discovery). Elapsing counts as a connect failure.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// How often a live session's watchdog polls the radio for an
    /// unsolicited drop.
    #[serde(default = "default_watchdog_interval_ms")]
    pub watchdog_interval_ms: u64,

    /// When set, only peripherals whose advertised name starts with this
    /// prefix are surfaced by discovery.
    #[serde(default)]
    pub name_prefix: Option<String>,

    /// Location of the persisted known-device collection.
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,

    /// Service the relay endpoints live under.
    #[serde(default = "default_relay_service")]
    pub relay_service: Uuid,

    /// Writable relay command endpoint.
    #[serde(default = "default_command_endpoint")]
    pub command_endpoint: Uuid,

    /// Notifying input-state endpoint.
    #[serde(default = "default_status_endpoint")]
    pub status_endpoint: Uuid,
}

fn default_scan_window_ms() -> u64 {
    8_000
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_watchdog_interval_ms() -> u64 {
    2_000
}
fn default_store_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("relaylink")
        .join("known_devices.json")
}
fn default_relay_service() -> Uuid {
    RELAY_SERVICE_UUID
}
fn default_command_endpoint() -> Uuid {
    RELAY_COMMAND_UUID
}
fn default_status_endpoint() -> Uuid {
    INPUT_STATE_UUID
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            scan_window_ms: default_scan_window_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            watchdog_interval_ms: default_watchdog_interval_ms(),
            name_prefix: None,
            store_path: default_store_path(),
            relay_service: default_relay_service(),
            command_endpoint: default_command_endpoint(),
            status_endpoint: default_status_endpoint(),
        }
    }
}

impl LinkConfig {
    pub fn scan_window(&self) -> Duration {
        Duration::from_millis(self.scan_window_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }
}
