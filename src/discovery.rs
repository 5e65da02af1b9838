// Scan-window discovery with duplicate suppression.
//
// Owns the "available devices" view: cleared when a window opens, populated
// first-seen-first from the adapter's sighting stream, frozen when the
// window closes. Observers get snapshots over a watch channel.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::radio::{DeviceId, RadioAdapter, Sighting};

/// Deduplicated projection of the most recent scan window. One entry per
/// peripheral, in first-seen order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AvailableDevice {
    pub id: DeviceId,
    pub name: String,
    pub rssi: Option<i16>,
}

pub(crate) struct DiscoveryDeduplicator {
    available_tx: watch::Sender<Vec<AvailableDevice>>,
    scan_task: Mutex<Option<JoinHandle<()>>>,
    scan_window: Duration,
    name_prefix: Option<String>,
}

impl DiscoveryDeduplicator {
    pub(crate) fn new(scan_window: Duration, name_prefix: Option<String>) -> Self {
        let (available_tx, _) = watch::channel(Vec::new());
        Self {
            available_tx,
            scan_task: Mutex::new(None),
            scan_window,
            name_prefix,
        }
    }

    /// Snapshot subscription for the available-device view.
    pub(crate) fn watch(&self) -> watch::Receiver<Vec<AvailableDevice>> {
        self.available_tx.subscribe()
    }

    /// Open a scan window. An already-open window is restarted: its task is
    /// cancelled and its results are cleared — results never accumulate
    /// across windows. The window closes itself after `scan_window`.
    pub(crate) async fn start_scan<A: RadioAdapter>(&self, radio: &Arc<A>) -> Result<()> {
        self.cancel_window();
        radio.stop_scan().await;
        self.available_tx.send_replace(Vec::new());

        let mut stream = radio.scan().await?;
        let available_tx = self.available_tx.clone();
        let radio = radio.clone();
        let window = self.scan_window;
        let name_prefix = self.name_prefix.clone();

        let task = tokio::spawn(async move {
            let deadline = tokio::time::sleep(window);
            tokio::pin!(deadline);
            let mut available: Vec<AvailableDevice> = Vec::new();

            loop {
                tokio::select! {
                    _ = &mut deadline => break,
                    sighting = stream.next() => match sighting {
                        Some(sighting) => {
                            if admit(&mut available, &sighting, name_prefix.as_deref()) {
                                tlog!(
                                    "[discovery] Found: {} ({}), RSSI: {:?}",
                                    available[available.len() - 1].name,
                                    sighting.id,
                                    sighting.rssi
                                );
                                available_tx.send_replace(available.clone());
                            }
                        }
                        // Adapter ended the stream early; close the window.
                        None => break,
                    },
                }
            }

            radio.stop_scan().await;
            tlog!("[discovery] Scan window closed ({} devices)", available.len());
        });

        if let Ok(mut guard) = self.scan_task.lock() {
            *guard = Some(task);
        }
        Ok(())
    }

    /// Close the window early. The available view keeps the results
    /// gathered so far; only the next `start_scan` clears them.
    pub(crate) async fn stop_scan<A: RadioAdapter>(&self, radio: &Arc<A>) {
        self.cancel_window();
        radio.stop_scan().await;
    }

    fn cancel_window(&self) {
        if let Ok(mut guard) = self.scan_task.lock() {
            if let Some(task) = guard.take() {
                task.abort();
            }
        }
    }
}

/// Apply one sighting to the available set. First sighting of an id wins —
/// name and signal strength from later duplicates are ignored. Sightings
/// without a usable display name (or outside the configured name prefix)
/// are discarded. Returns whether the set changed.
fn admit(
    available: &mut Vec<AvailableDevice>,
    sighting: &Sighting,
    name_prefix: Option<&str>,
) -> bool {
    let name = match sighting.name.as_deref() {
        Some(name) if !name.is_empty() => name,
        _ => return false,
    };
    if let Some(prefix) = name_prefix {
        if !name.starts_with(prefix) {
            return false;
        }
    }
    if available.iter().any(|d| d.id == sighting.id) {
        return false;
    }
    available.push(AvailableDevice {
        id: sighting.id.clone(),
        name: name.to_string(),
        rssi: sighting.rssi,
    });
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sighting(id: &str, name: Option<&str>, rssi: Option<i16>) -> Sighting {
        Sighting {
            id: DeviceId::new(id),
            name: name.map(String::from),
            rssi,
            seen_at: Utc::now(),
        }
    }

    #[test]
    fn first_sighting_wins_for_an_id() {
        let mut available = Vec::new();
        assert!(admit(&mut available, &sighting("A", Some("Relay-1"), Some(-40)), None));
        assert!(!admit(&mut available, &sighting("A", Some("Other-Name"), Some(-20)), None));

        assert_eq!(available.len(), 1);
        assert_eq!(available[0].name, "Relay-1");
        assert_eq!(available[0].rssi, Some(-40));
    }

    #[test]
    fn unnamed_sightings_are_discarded() {
        let mut available = Vec::new();
        assert!(!admit(&mut available, &sighting("B", None, None), None));
        assert!(!admit(&mut available, &sighting("B", Some(""), None), None));
        assert!(available.is_empty());
    }

    #[test]
    fn insertion_order_is_first_seen_order() {
        let mut available = Vec::new();
        admit(&mut available, &sighting("C", Some("Relay-3"), None), None);
        admit(&mut available, &sighting("A", Some("Relay-1"), None), None);
        admit(&mut available, &sighting("B", Some("Relay-2"), None), None);
        admit(&mut available, &sighting("A", Some("Relay-1"), None), None);

        let ids: Vec<&str> = available.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["C", "A", "B"]);
    }

    #[test]
    fn name_prefix_filters_other_devices() {
        let mut available = Vec::new();
        assert!(admit(&mut available, &sighting("A", Some("SafeOp-1"), None), Some("SafeOp")));
        assert!(!admit(&mut available, &sighting("B", Some("Headphones"), None), Some("SafeOp")));
        assert_eq!(available.len(), 1);
    }

    #[test]
    fn named_and_unnamed_mix_yields_named_only() {
        // Scan window sees A ("Relay-1") and B (unnamed): only A is exposed.
        let mut available = Vec::new();
        admit(&mut available, &sighting("A", Some("Relay-1"), Some(-50)), None);
        admit(&mut available, &sighting("B", None, Some(-30)), None);

        assert_eq!(available.len(), 1);
        assert_eq!(available[0].id, DeviceId::new("A"));
    }
}
