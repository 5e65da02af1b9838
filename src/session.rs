// Connection session manager.
//
// The facade collaborators talk to. Owns the per-device state machine
// (Idle → Connecting → Connected → Disconnecting → Idle), the discovery
// window, the persisted known-device store and the command/notification
// paths. Constructed with an explicit radio adapter and permission gate so
// tests can drive the whole machine with doubles.
//
// Serialisation discipline: a device's map entry is its busy marker. The
// entry is inserted or flipped under the sessions lock before any radio
// await, so re-entrant calls for the same device fail fast with
// `AlreadyBusy` while different devices proceed in parallel. Every state
// transition lands in the store before the call returns.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;

use crate::command::{encode_command, RelayCommand};
use crate::config::LinkConfig;
use crate::device_store::{DeviceStatus, DeviceStore, KnownDevice};
use crate::discovery::{AvailableDevice, DiscoveryDeduplicator};
use crate::error::{LinkError, Result};
use crate::notify::{spawn_relay, StatusEvent};
use crate::permissions::PermissionGate;
use crate::radio::{DeviceId, DisconnectOutcome, RadioAdapter};

/// Phase of a live session. A device with no session entry is Idle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Connected,
    Disconnecting,
}

struct Session<T> {
    state: SessionState,
    transport: Option<T>,
    /// Held while a command write is in flight. `try_lock` semantics give
    /// the one-outstanding-write-per-device rule without queueing.
    write_gate: Arc<Mutex<()>>,
    relay_task: Option<JoinHandle<()>>,
    watchdog: Option<JoinHandle<()>>,
}

impl<T> Session<T> {
    fn connecting() -> Self {
        Self {
            state: SessionState::Connecting,
            transport: None,
            write_gate: Arc::new(Mutex::new(())),
            relay_task: None,
            watchdog: None,
        }
    }

    fn abort_tasks(&mut self) {
        if let Some(task) = self.relay_task.take() {
            task.abort();
        }
        if let Some(task) = self.watchdog.take() {
            task.abort();
        }
    }
}

/// State shared with the per-session watchdog tasks.
struct Shared<A: RadioAdapter> {
    radio: Arc<A>,
    config: LinkConfig,
    sessions: Mutex<HashMap<DeviceId, Session<A::Transport>>>,
    store: StdMutex<DeviceStore>,
    known_tx: watch::Sender<Vec<KnownDevice>>,
    status_tx: broadcast::Sender<StatusEvent>,
}

impl<A: RadioAdapter> Shared<A> {
    fn publish_known(&self) {
        if let Ok(store) = self.store.lock() {
            self.known_tx.send_replace(store.devices().to_vec());
        }
    }

    fn mark_connected(&self, id: &DeviceId, name: &str) -> Result<()> {
        {
            let mut store = self
                .store
                .lock()
                .map_err(|_| LinkError::Store("store lock poisoned".to_string()))?;
            store.mark_connected(id, name)?;
        }
        self.publish_known();
        Ok(())
    }

    fn mark_disconnected(&self, id: &DeviceId) -> Result<()> {
        {
            let mut store = self
                .store
                .lock()
                .map_err(|_| LinkError::Store("store lock poisoned".to_string()))?;
            store.mark_disconnected(id)?;
        }
        self.publish_known();
        Ok(())
    }
}

pub struct SessionManager<A: RadioAdapter> {
    shared: Arc<Shared<A>>,
    discovery: DiscoveryDeduplicator,
    gate: Box<dyn PermissionGate>,
    /// Cached gate verdict; the gate runs once until re-requested.
    permission_verdict: Mutex<Option<bool>>,
}

impl<A: RadioAdapter> SessionManager<A> {
    /// Build a manager over an owned radio adapter and permission gate.
    /// Reads the known-device store in full.
    pub fn new(radio: A, gate: impl PermissionGate + 'static, config: LinkConfig) -> Result<Self> {
        let store = DeviceStore::open(config.store_path.clone())?;
        let (known_tx, _) = watch::channel(store.devices().to_vec());
        let (status_tx, _) = broadcast::channel(64);
        let discovery =
            DiscoveryDeduplicator::new(config.scan_window(), config.name_prefix.clone());

        Ok(Self {
            shared: Arc::new(Shared {
                radio: Arc::new(radio),
                config,
                sessions: Mutex::new(HashMap::new()),
                store: StdMutex::new(store),
                known_tx,
                status_tx,
            }),
            discovery,
            gate: Box::new(gate),
            permission_verdict: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &LinkConfig {
        &self.shared.config
    }

    // ========================================================================
    // Permissions
    // ========================================================================

    /// Run the permission gate and cache its verdict. Safe to call
    /// repeatedly; already-granted capabilities are not re-prompted.
    pub async fn request_permissions(&self) -> bool {
        let granted = self.gate.request_capabilities().await;
        *self.permission_verdict.lock().await = Some(granted);
        granted
    }

    /// Gate radio actions on the cached verdict, running the gate once if
    /// it has never been asked.
    async fn ensure_permissions(&self) -> Result<()> {
        let mut verdict = self.permission_verdict.lock().await;
        let granted = match *verdict {
            Some(granted) => granted,
            None => {
                let granted = self.gate.request_capabilities().await;
                *verdict = Some(granted);
                granted
            }
        };
        if granted {
            Ok(())
        } else {
            Err(LinkError::PermissionDenied)
        }
    }

    // ========================================================================
    // Discovery
    // ========================================================================

    /// Open a scan window (restarting any window already open). Runs in the
    /// background and auto-stops after the configured duration.
    pub async fn start_scan(&self) -> Result<()> {
        self.ensure_permissions().await?;
        self.discovery.start_scan(&self.shared.radio).await
    }

    /// Close the scan window early.
    pub async fn stop_scan(&self) {
        self.discovery.stop_scan(&self.shared.radio).await;
    }

    /// Snapshot subscription for the current scan window's devices.
    pub fn watch_available(&self) -> watch::Receiver<Vec<AvailableDevice>> {
        self.discovery.watch()
    }

    // ========================================================================
    // Known devices
    // ========================================================================

    /// Current persisted records, in stored order.
    pub fn known_devices(&self) -> Vec<KnownDevice> {
        self.shared
            .store
            .lock()
            .map(|store| store.devices().to_vec())
            .unwrap_or_default()
    }

    /// Snapshot subscription for the persisted records.
    pub fn watch_known(&self) -> watch::Receiver<Vec<KnownDevice>> {
        self.shared.known_tx.subscribe()
    }

    /// Drop a remembered device (explicit user action). A live session for
    /// the id is not touched.
    pub fn forget(&self, id: &DeviceId) -> Result<bool> {
        let removed = {
            let mut store = self
                .shared
                .store
                .lock()
                .map_err(|_| LinkError::Store("store lock poisoned".to_string()))?;
            store.forget(id)?
        };
        if removed {
            self.shared.publish_known();
        }
        Ok(removed)
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    /// Current phase of a device's session, if one is live.
    pub async fn session_state(&self, id: &DeviceId) -> Option<SessionState> {
        self.shared.sessions.lock().await.get(id).map(|s| s.state)
    }

    /// Observer channel for decoded status updates from connected devices.
    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusEvent> {
        self.shared.status_tx.subscribe()
    }

    /// Connect to a peripheral and record it as a known device.
    ///
    /// Valid only from Idle; a session in any phase rejects with
    /// `AlreadyBusy`. On success the store holds `{id, name, Connected}`
    /// (the display name from the record's creation is preserved on
    /// reconnect) before this returns, the status endpoint is subscribed
    /// and a drop watchdog is running. On failure at any step the device is
    /// back at Idle and the store is untouched.
    pub async fn connect(&self, id: &DeviceId) -> Result<()> {
        self.ensure_permissions().await?;

        {
            let mut sessions = self.shared.sessions.lock().await;
            if sessions.contains_key(id) {
                return Err(LinkError::AlreadyBusy(id.clone()));
            }
            sessions.insert(id.clone(), Session::connecting());
        }
        tlog!("[session] Connecting to {id}...");

        let transport = match self.establish(id).await {
            Ok(transport) => transport,
            Err(e) => {
                self.shared.sessions.lock().await.remove(id);
                tlog!("[session] Connect to {id} failed: {e}");
                return Err(e);
            }
        };

        // Persist before the transition is reported complete.
        let name = self.display_name(id);
        if let Err(e) = self.shared.mark_connected(id, &name) {
            let _ = self.shared.radio.disconnect(id).await;
            self.shared.sessions.lock().await.remove(id);
            return Err(e);
        }

        // Subscribe the notification relay. A unit without a notifying
        // status endpoint still gets a usable session.
        let relay_task = match self
            .shared
            .radio
            .subscribe(&transport, self.shared.config.status_endpoint)
            .await
        {
            Ok(stream) => Some(spawn_relay(
                id.clone(),
                stream,
                self.shared.status_tx.clone(),
            )),
            Err(e) => {
                tlog!("[session] Status subscription for {id} failed: {e}");
                None
            }
        };
        let watchdog = spawn_watchdog(&self.shared, id.clone());

        let mut sessions = self.shared.sessions.lock().await;
        if let Some(session) = sessions.get_mut(id) {
            session.state = SessionState::Connected;
            session.transport = Some(transport);
            session.relay_task = relay_task;
            session.watchdog = Some(watchdog);
        }
        tlog!("[session] Connected to {id} ({name})");
        Ok(())
    }

    /// Disconnect a connected peripheral.
    ///
    /// A device mid-transition rejects with `AlreadyBusy`. With no live
    /// session this is a no-op success; a stale persisted `Connected`
    /// (crash leftover) is normalised to `Disconnected`. The adapter
    /// reporting the link already gone still counts as success.
    pub async fn disconnect(&self, id: &DeviceId) -> Result<()> {
        enum Entry {
            Proceed,
            Busy,
            NoSession,
        }

        let entry = {
            let mut sessions = self.shared.sessions.lock().await;
            match sessions.get_mut(id) {
                Some(session) if session.state == SessionState::Connected => {
                    session.state = SessionState::Disconnecting;
                    Entry::Proceed
                }
                Some(_) => Entry::Busy,
                None => Entry::NoSession,
            }
        };
        match entry {
            Entry::Proceed => {}
            Entry::Busy => return Err(LinkError::AlreadyBusy(id.clone())),
            Entry::NoSession => {
                let stale = self
                    .shared
                    .store
                    .lock()
                    .map(|store| {
                        matches!(
                            store.get(id).map(|d| d.status),
                            Some(DeviceStatus::Connected)
                        )
                    })
                    .unwrap_or(false);
                if stale {
                    self.shared.mark_disconnected(id)?;
                }
                return Ok(());
            }
        }
        tlog!("[session] Disconnecting from {id}...");

        // Best-effort at the adapter: already-gone is success, and even an
        // adapter error must not leave the session half torn down.
        match self.shared.radio.disconnect(id).await {
            Ok(DisconnectOutcome::Done) => {}
            Ok(DisconnectOutcome::AlreadyGone) => {
                tlog!("[session] {id} was already gone (raced a radio drop)");
            }
            Err(e) => tlog!("[session] Adapter disconnect for {id} reported: {e}"),
        }

        if let Some(mut session) = self.shared.sessions.lock().await.remove(id) {
            session.abort_tasks();
        }
        self.shared.mark_disconnected(id)?;
        tlog!("[session] Disconnected from {id}");
        Ok(())
    }

    /// Send a relay command to a connected peripheral.
    ///
    /// Fails with `NotConnected` outside the `Connected` phase and with
    /// `AlreadyBusy` while another write for the same device is in flight —
    /// in both cases without any radio I/O. The payload is validated before
    /// sending.
    pub async fn send_command(&self, id: &DeviceId, command: RelayCommand) -> Result<()> {
        let payload = encode_command(&command)?;

        let (transport, gate) = {
            let sessions = self.shared.sessions.lock().await;
            match sessions.get(id) {
                Some(session) if session.state == SessionState::Connected => {
                    match &session.transport {
                        Some(transport) => (transport.clone(), session.write_gate.clone()),
                        None => return Err(LinkError::NotConnected(id.clone())),
                    }
                }
                _ => return Err(LinkError::NotConnected(id.clone())),
            }
        };

        let _guard = gate
            .try_lock_owned()
            .map_err(|_| LinkError::AlreadyBusy(id.clone()))?;

        tlog!(
            "[command] {} relay {} -> {} ({})",
            id,
            command.relay,
            if command.on { "on" } else { "off" },
            hex::encode(payload)
        );
        self.shared
            .radio
            .write(&transport, self.shared.config.command_endpoint, &payload)
            .await
    }

    /// Transport connect plus endpoint discovery, bounded by the configured
    /// timeout.
    async fn establish(&self, id: &DeviceId) -> Result<A::Transport> {
        let attempt = async {
            let transport = self.shared.radio.connect(id).await?;
            self.shared.radio.discover_endpoints(&transport).await?;
            Ok(transport)
        };
        match tokio::time::timeout(self.shared.config.connect_timeout(), attempt).await {
            Ok(result) => result,
            Err(_) => Err(LinkError::ConnectFailure {
                id: id.clone(),
                reason: format!(
                    "timed out after {} ms",
                    self.shared.config.connect_timeout_ms
                ),
            }),
        }
    }

    /// Display name for a new store record: the current scan window's
    /// sighting first, then the name remembered from an earlier connection.
    fn display_name(&self, id: &DeviceId) -> String {
        if let Some(device) = self
            .discovery
            .watch()
            .borrow()
            .iter()
            .find(|d| &d.id == id)
        {
            return device.name.clone();
        }
        if let Ok(store) = self.shared.store.lock() {
            if let Some(device) = store.get(id) {
                return device.name.clone();
            }
        }
        "Unnamed".to_string()
    }
}

/// Watch a connected session for an unsolicited drop. A drop is a normal
/// `Connected → Idle` transition with status `Disconnected`, not an error.
fn spawn_watchdog<A: RadioAdapter>(shared: &Arc<Shared<A>>, id: DeviceId) -> JoinHandle<()> {
    let shared = shared.clone();
    tokio::spawn(async move {
        let interval = shared.config.watchdog_interval();
        loop {
            tokio::time::sleep(interval).await;

            {
                let sessions = shared.sessions.lock().await;
                match sessions.get(&id) {
                    Some(session) if session.state == SessionState::Connected => {}
                    // Mid-transition: look again next tick.
                    Some(_) => continue,
                    None => break,
                }
            }

            if shared.radio.is_connected(&id).await {
                continue;
            }

            // Only tear down if a disconnect hasn't raced us.
            let session = {
                let mut sessions = shared.sessions.lock().await;
                let still_connected = matches!(
                    sessions.get(&id),
                    Some(s) if s.state == SessionState::Connected
                );
                if still_connected {
                    sessions.remove(&id)
                } else {
                    None
                }
            };
            if let Some(mut session) = session {
                if let Some(task) = session.relay_task.take() {
                    task.abort();
                }
                tlog!("[session] {id} dropped by the radio");
                if let Err(e) = shared.mark_disconnected(&id) {
                    tlog!("[session] Failed to record drop for {id}: {e}");
                }
            }
            break;
        }
    })
}
