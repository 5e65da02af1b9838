// Failure taxonomy for the session manager.
//
// Every fallible operation surfaces one of these to its immediate caller;
// nothing is swallowed and nothing is retried automatically. An unsolicited
// radio drop is handled as a normal state transition and never appears here.

use thiserror::Error;

use crate::radio::DeviceId;

#[derive(Debug, Error)]
pub enum LinkError {
    /// One or more required radio capabilities were not granted.
    #[error("bluetooth capabilities not granted")]
    PermissionDenied,

    /// The scan could not be started or a sighting could not be read.
    /// Per-sighting occurrences are non-fatal; the scan continues.
    #[error("scan failed: {0}")]
    ScanFailure(String),

    /// A connection attempt failed at the transport or endpoint-discovery
    /// step. Terminal for that attempt; the caller decides whether to retry.
    #[error("failed to connect to {id}: {reason}")]
    ConnectFailure { id: DeviceId, reason: String },

    /// A connect, disconnect or command write is already in flight for this
    /// device. The call is rejected, never queued.
    #[error("operation already in flight for {0}")]
    AlreadyBusy(DeviceId),

    /// The operation requires a live connected session.
    #[error("{0} is not connected")]
    NotConnected(DeviceId),

    /// A command write reached the radio and failed there.
    #[error("write to {id} failed: {reason}")]
    WriteFailure { id: DeviceId, reason: String },

    /// A status notification payload could not be decoded. Per-update;
    /// the subscription stays alive.
    #[error("could not decode status payload: {0}")]
    DecodeFailure(String),

    /// The command refers to a relay the device does not have. Rejected
    /// before any radio I/O.
    #[error("relay index {0} out of range")]
    InvalidCommand(u8),

    /// The known-device store could not be read or written.
    #[error("device store: {0}")]
    Store(String),

    /// The radio adapter itself could not be initialised or driven.
    #[error("radio adapter: {0}")]
    Radio(String),
}

pub type Result<T> = std::result::Result<T, LinkError>;
