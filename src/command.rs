// Relay command wire codec.
//
// The command endpoint takes a fixed two-byte payload: relay index then
// desired state. The index range is enforced here, before any radio I/O —
// an out-of-range command is rejected, never sent as an undefined payload.

use serde::{Deserialize, Serialize};

use crate::error::{LinkError, Result};

/// Number of relay channels on a SafeOp-class unit.
pub const RELAY_COUNT: u8 = 8;

/// Encoded payload width in bytes.
pub const COMMAND_LEN: usize = 2;

const STATE_OFF: u8 = 0x00;
const STATE_ON: u8 = 0x01;

/// A request to drive one relay channel. Transient — encoded and discarded
/// once the write resolves.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayCommand {
    /// Relay channel, `0..RELAY_COUNT`.
    pub relay: u8,
    /// Desired state: energised or released.
    pub on: bool,
}

impl RelayCommand {
    pub fn new(relay: u8, on: bool) -> Self {
        Self { relay, on }
    }
}

/// Encode a command into its wire payload. Total over the legal input
/// space; fails closed on a relay index the unit does not have.
pub fn encode_command(command: &RelayCommand) -> Result<[u8; COMMAND_LEN]> {
    if command.relay >= RELAY_COUNT {
        return Err(LinkError::InvalidCommand(command.relay));
    }
    let state = if command.on { STATE_ON } else { STATE_OFF };
    Ok([command.relay, state])
}
