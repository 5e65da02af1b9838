// relaylink — session management for SafeOp-class BLE relay peripherals.
//
// Turns raw, duplicate-prone radio advertisements and racy connection
// events into a consistent, persisted view of known and available devices,
// enforces at most one live session per device, and serialises relay
// command writes to connected units.

#[macro_use]
mod logging;

pub mod command;
pub mod config;
pub mod device_store;
pub mod discovery;
pub mod error;
pub mod notify;
pub mod permissions;
pub mod radio;
pub mod session;

pub use command::{RelayCommand, COMMAND_LEN, RELAY_COUNT};
pub use config::LinkConfig;
pub use device_store::{DeviceStatus, DeviceStore, KnownDevice};
pub use discovery::AvailableDevice;
pub use error::{LinkError, Result};
pub use logging::{init_file_logging, stop_file_logging};
pub use notify::{InputState, StatusEvent};
pub use permissions::{Capability, PermissionGate, PlatformGate};
pub use radio::btle::BtleRadio;
pub use radio::{DeviceId, DisconnectOutcome, RadioAdapter, Sighting};
pub use session::{SessionManager, SessionState};
