// Input-state notification relay.
//
// Once a session is connected, the manager subscribes to the unit's
// input-state endpoint and republishes each decoded update to observers in
// arrival order. A payload that fails to decode is reported as its own
// event and does not end the subscription.

use futures::StreamExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::{LinkError, Result};
use crate::radio::{DeviceId, NotificationStream};

/// Decoded input-state update: one bit per relay channel, bit set = input
/// active.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InputState {
    pub channels: u8,
}

impl InputState {
    pub fn is_active(&self, relay: u8) -> bool {
        relay < 8 && self.channels & (1 << relay) != 0
    }
}

/// What observers receive from a connected device's status endpoint.
#[derive(Clone, Debug)]
pub enum StatusEvent {
    /// A decoded input-state update.
    Update { id: DeviceId, state: InputState },
    /// A payload that could not be decoded. The subscription continues.
    DecodeError { id: DeviceId, reason: String },
}

/// Decode one status payload. The unit sends exactly one bitmap byte;
/// anything else is rejected.
pub fn decode_status(payload: &[u8]) -> Result<InputState> {
    match payload {
        [channels] => Ok(InputState { channels: *channels }),
        [] => Err(LinkError::DecodeFailure("empty payload".to_string())),
        other => Err(LinkError::DecodeFailure(format!(
            "expected 1 byte, got {} ({})",
            other.len(),
            hex::encode(other)
        ))),
    }
}

/// Forward a device's notification stream to the observer channel until the
/// stream ends or the task is aborted (session leaving `Connected`).
pub(crate) fn spawn_relay(
    id: DeviceId,
    mut stream: NotificationStream,
    events: broadcast::Sender<StatusEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(payload) = stream.next().await {
            let event = match decode_status(&payload) {
                Ok(state) => StatusEvent::Update {
                    id: id.clone(),
                    state,
                },
                Err(e) => {
                    tlog!("[notify] Bad status payload from {id}: {e}");
                    StatusEvent::DecodeError {
                        id: id.clone(),
                        reason: e.to_string(),
                    }
                }
            };
            // A send error just means nobody is listening right now.
            let _ = events.send(event);
        }
        tlog!("[notify] Status stream for {id} ended");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_a_single_bitmap_byte() {
        let state = decode_status(&[0b0000_0101]).unwrap();
        assert!(state.is_active(0));
        assert!(!state.is_active(1));
        assert!(state.is_active(2));
        assert!(!state.is_active(7));
    }

    #[test]
    fn rejects_empty_and_oversized_payloads() {
        assert!(matches!(
            decode_status(&[]),
            Err(LinkError::DecodeFailure(_))
        ));
        assert!(matches!(
            decode_status(&[0x01, 0x02]),
            Err(LinkError::DecodeFailure(_))
        ));
    }

    #[test]
    fn out_of_range_channel_is_never_active() {
        let state = InputState { channels: 0xff };
        assert!(state.is_active(7));
        assert!(!state.is_active(8));
    }

    #[tokio::test]
    async fn relay_forwards_updates_in_order_and_survives_bad_payloads() {
        let (payload_tx, payload_rx) = tokio::sync::mpsc::unbounded_channel::<Vec<u8>>();
        let stream = futures::stream::unfold(payload_rx, |mut rx| async move {
            rx.recv().await.map(|p| (p, rx))
        });
        let (events_tx, mut events_rx) = broadcast::channel(16);

        let task = spawn_relay(DeviceId::new("A"), Box::pin(stream), events_tx);

        payload_tx.send(vec![0x01]).unwrap();
        payload_tx.send(vec![]).unwrap(); // undecodable
        payload_tx.send(vec![0x02]).unwrap();

        match events_rx.recv().await.unwrap() {
            StatusEvent::Update { state, .. } => assert_eq!(state.channels, 0x01),
            other => panic!("expected update, got {other:?}"),
        }
        match events_rx.recv().await.unwrap() {
            StatusEvent::DecodeError { .. } => {}
            other => panic!("expected decode error, got {other:?}"),
        }
        // The subscription survived the bad payload.
        match events_rx.recv().await.unwrap() {
            StatusEvent::Update { state, .. } => assert_eq!(state.channels, 0x02),
            other => panic!("expected update, got {other:?}"),
        }

        drop(payload_tx);
        task.await.unwrap();
    }
}
