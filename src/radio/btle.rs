// Production radio adapter over btleplug.
//
// Scanning polls the platform adapter for discovered peripherals instead of
// relying on a scan filter. On macOS, CoreBluetooth's filter only matches
// UUIDs in the primary advertisement packet, but relay units typically place
// their 128-bit service UUID in the scan response data instead — so we
// discover everything and let the consumer filter.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CharPropFlags, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use chrono::Utc;
use futures::StreamExt;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::error::{LinkError, Result};
use crate::radio::{
    DeviceId, DisconnectOutcome, NotificationStream, RadioAdapter, Sighting, SightingStream,
};

/// How often the scan task polls the adapter for discovered peripherals.
const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct BtleRadio {
    adapter: Adapter,
    /// Service UUID a peripheral must expose to pass endpoint discovery.
    /// `None` skips the check.
    required_service: Option<Uuid>,
    scanning: Arc<Mutex<bool>>,
}

impl BtleRadio {
    /// Initialise the platform Bluetooth manager and grab the first adapter.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|e| LinkError::Radio(format!("BLE manager init failed: {e}")))?;
        let adapters = manager
            .adapters()
            .await
            .map_err(|e| LinkError::Radio(format!("Failed to list BLE adapters: {e}")))?;
        let adapter = adapters
            .into_iter()
            .next()
            .ok_or_else(|| LinkError::Radio("No BLE adapter found".to_string()))?;
        Ok(Self {
            adapter,
            required_service: None,
            scanning: Arc::new(Mutex::new(false)),
        })
    }

    /// Require peripherals to expose this service during endpoint discovery.
    pub fn with_service(mut self, service: Uuid) -> Self {
        self.required_service = Some(service);
        self
    }

    /// Find a discovered peripheral by its platform id string.
    async fn find_peripheral(&self, id: &DeviceId) -> Result<Peripheral> {
        let peripherals = self
            .adapter
            .peripherals()
            .await
            .map_err(|e| LinkError::Radio(format!("Failed to list peripherals: {e}")))?;
        peripherals
            .into_iter()
            .find(|p| p.id().to_string() == id.as_str())
            .ok_or_else(|| LinkError::ConnectFailure {
                id: id.clone(),
                reason: "device not found (not seen in a scan?)".to_string(),
            })
    }
}

/// Find a GATT characteristic by UUID on a connected peripheral.
fn find_characteristic(peripheral: &Peripheral, uuid: Uuid) -> Option<Characteristic> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == uuid)
}

fn peripheral_id(peripheral: &Peripheral) -> DeviceId {
    DeviceId::new(peripheral.id().to_string())
}

#[async_trait]
impl RadioAdapter for BtleRadio {
    type Transport = Peripheral;

    async fn scan(&self) -> Result<SightingStream> {
        {
            let mut scanning = self.scanning.lock().await;
            if *scanning {
                // Restarting the window: drop the platform scan first.
                let _ = self.adapter.stop_scan().await;
            }
            *scanning = true;
        }

        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| LinkError::ScanFailure(format!("Failed to start BLE scan: {e}")))?;

        tlog!("[radio] Scan started");

        let (tx, rx) = mpsc::channel::<Sighting>(64);
        let adapter = self.adapter.clone();
        let scanning = self.scanning.clone();

        // Poll the adapter's peripheral list and forward everything seen.
        // Deduplication is the consumer's job; repeats are expected.
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(SCAN_POLL_INTERVAL).await;

                if !*scanning.lock().await {
                    break;
                }

                let peripherals = match adapter.peripherals().await {
                    Ok(p) => p,
                    Err(e) => {
                        tlog!("[radio] Peripheral listing failed mid-scan: {e}");
                        continue;
                    }
                };

                for peripheral in peripherals {
                    let props = match peripheral.properties().await.ok().flatten() {
                        Some(p) => p,
                        None => continue,
                    };
                    let sighting = Sighting {
                        id: peripheral_id(&peripheral),
                        name: props.local_name,
                        rssi: props.rssi,
                        seen_at: Utc::now(),
                    };
                    if tx.send(sighting).await.is_err() {
                        // Consumer dropped the stream — stop the scan.
                        let mut scanning = scanning.lock().await;
                        if *scanning {
                            *scanning = false;
                            let _ = adapter.stop_scan().await;
                        }
                        return;
                    }
                }
            }
        });

        let stream =
            futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|s| (s, rx)) });
        Ok(Box::pin(stream))
    }

    async fn stop_scan(&self) {
        let mut scanning = self.scanning.lock().await;
        if *scanning {
            *scanning = false;
            let _ = self.adapter.stop_scan().await;
            tlog!("[radio] Scan stopped");
        }
    }

    async fn connect(&self, id: &DeviceId) -> Result<Peripheral> {
        let peripheral = self.find_peripheral(id).await?;

        tlog!("[radio] Connecting to {id}...");
        peripheral
            .connect()
            .await
            .map_err(|e| LinkError::ConnectFailure {
                id: id.clone(),
                reason: format!("transport connect failed: {e}"),
            })?;

        Ok(peripheral)
    }

    async fn discover_endpoints(&self, transport: &Peripheral) -> Result<()> {
        let id = peripheral_id(transport);

        if let Err(e) = transport.discover_services().await {
            // Don't leave a half-set-up link dangling.
            let p = transport.clone();
            tokio::spawn(async move {
                let _ = p.disconnect().await;
            });
            return Err(LinkError::ConnectFailure {
                id,
                reason: format!("service discovery failed: {e}"),
            });
        }

        if let Some(service) = self.required_service {
            let has_service = transport.services().iter().any(|s| s.uuid == service);
            if !has_service {
                let _ = transport.disconnect().await;
                return Err(LinkError::ConnectFailure {
                    id,
                    reason: format!("device does not expose service {service}"),
                });
            }
        }

        Ok(())
    }

    async fn is_connected(&self, id: &DeviceId) -> bool {
        match self.find_peripheral(id).await {
            Ok(p) => p.is_connected().await.unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn disconnect(&self, id: &DeviceId) -> Result<DisconnectOutcome> {
        let peripheral = match self.find_peripheral(id).await {
            Ok(p) => p,
            // Never discovered or platform already forgot it — nothing to do.
            Err(_) => return Ok(DisconnectOutcome::AlreadyGone),
        };

        if !peripheral.is_connected().await.unwrap_or(false) {
            return Ok(DisconnectOutcome::AlreadyGone);
        }

        peripheral
            .disconnect()
            .await
            .map_err(|e| LinkError::Radio(format!("disconnect failed: {e}")))?;
        Ok(DisconnectOutcome::Done)
    }

    async fn write(&self, transport: &Peripheral, endpoint: Uuid, payload: &[u8]) -> Result<()> {
        let id = peripheral_id(transport);
        let characteristic =
            find_characteristic(transport, endpoint).ok_or_else(|| LinkError::WriteFailure {
                id: id.clone(),
                reason: format!("characteristic {endpoint} not found"),
            })?;

        transport
            .write(&characteristic, payload, WriteType::WithResponse)
            .await
            .map_err(|e| LinkError::WriteFailure {
                id,
                reason: e.to_string(),
            })
    }

    async fn subscribe(&self, transport: &Peripheral, endpoint: Uuid) -> Result<NotificationStream> {
        let id = peripheral_id(transport);
        let characteristic =
            find_characteristic(transport, endpoint).ok_or_else(|| LinkError::ConnectFailure {
                id: id.clone(),
                reason: format!("characteristic {endpoint} not found"),
            })?;

        if !characteristic.properties.contains(CharPropFlags::NOTIFY) {
            return Err(LinkError::ConnectFailure {
                id,
                reason: format!("characteristic {endpoint} does not support notifications"),
            });
        }

        transport
            .subscribe(&characteristic)
            .await
            .map_err(|e| LinkError::ConnectFailure {
                id: id.clone(),
                reason: format!("subscribe failed: {e}"),
            })?;

        // The notifications() stream is multiplexed across all subscribed
        // characteristics — keep only this endpoint's values.
        let stream = transport
            .notifications()
            .await
            .map_err(|e| LinkError::ConnectFailure {
                id,
                reason: format!("notification stream unavailable: {e}"),
            })?;
        let filtered = stream
            .filter_map(move |n| futures::future::ready((n.uuid == endpoint).then_some(n.value)));
        Ok(Box::pin(filtered))
    }
}
