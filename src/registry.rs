//! Device registry
//!
//! Keyed store of live device entries. An entry exclusively represents the
//! device's dialed-in connection for its lifetime: replacement requires
//! removal first (takeover), and the busy/idle contract is guarded by a
//! per-entry mutex.

use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::transport::Transport;

/// A connected field device
pub struct Device {
    id: String,
    transport: Arc<Transport>,
    registered_at: SystemTime,
    /// Id of the session currently using this device, `None` when idle
    session: Mutex<Option<String>>,
    /// Signals the device's supervisory tasks to stop
    stop_keepalive: CancellationToken,
    /// Fires when a session first claims this device, ending the
    /// post-registration dial window
    claimed: CancellationToken,
}

impl Device {
    #[must_use]
    pub fn new(id: String, transport: Arc<Transport>) -> Self {
        Self {
            id,
            transport,
            registered_at: SystemTime::now(),
            session: Mutex::new(None),
            stop_keepalive: CancellationToken::new(),
            claimed: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    #[must_use]
    pub fn registered_at(&self) -> SystemTime {
        self.registered_at
    }

    /// Mark the device as in session
    pub fn set_session(&self, session_id: &str) {
        let mut session = self.session.lock().unwrap_or_else(|e| e.into_inner());
        *session = Some(session_id.to_string());
        // Interrupt the dial window so the session owns the device's bytes
        self.claimed.cancel();
    }

    /// Mark the device as idle
    pub fn clear_session(&self) {
        let mut session = self.session.lock().unwrap_or_else(|e| e.into_inner());
        *session = None;
    }

    /// True while a session is using this device
    #[must_use]
    pub fn is_in_session(&self) -> bool {
        self.session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Id of the session using this device, if any
    #[must_use]
    pub fn session_id(&self) -> Option<String> {
        self.session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Token observed by the device's supervisory tasks
    #[must_use]
    pub fn stop_token(&self) -> &CancellationToken {
        &self.stop_keepalive
    }

    /// Stop the device's supervisory tasks (used on takeover)
    pub fn stop_keepalive(&self) {
        self.stop_keepalive.cancel();
    }

    /// Resolves once a session has claimed this device
    pub async fn claimed(&self) {
        self.claimed.cancelled().await;
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("remote_addr", &self.transport.peer_addr())
            .field("in_session", &self.is_in_session())
            .finish()
    }
}

/// Serializable snapshot of a device entry
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub id: String,
    /// Unix seconds
    pub registered_at: u64,
    pub in_session: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub remote_addr: String,
}

/// Registry of connected devices, at most one entry per device id
#[derive(Default)]
pub struct Registry {
    devices: DashMap<String, Arc<Device>>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a device, silently overwriting any previous entry. Callers
    /// wanting takeover semantics evict the old entry first.
    pub fn register(&self, device: Arc<Device>) {
        self.devices.insert(device.id.clone(), device);
    }

    /// Remove a device. Idempotent.
    pub fn unregister(&self, device_id: &str) {
        self.devices.remove(device_id);
    }

    /// Remove a specific entry only if it is still the registered one.
    /// A concurrent takeover may already have replaced it; the replacement
    /// must survive the old owner's cleanup.
    pub fn unregister_entry(&self, device: &Arc<Device>) {
        self.devices
            .remove_if(&device.id, |_, current| Arc::ptr_eq(current, device));
    }

    #[must_use]
    pub fn get(&self, device_id: &str) -> Option<Arc<Device>> {
        self.devices.get(device_id).map(|entry| entry.value().clone())
    }

    #[must_use]
    pub fn list(&self) -> Vec<Arc<Device>> {
        self.devices
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.devices.len()
    }

    /// Snapshot of every entry for the status API. Consistent per entry,
    /// not across the registry.
    #[must_use]
    pub fn list_info(&self) -> Vec<DeviceInfo> {
        self.devices
            .iter()
            .map(|entry| {
                let device = entry.value();
                let session = device
                    .session
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone();
                DeviceInfo {
                    id: device.id.clone(),
                    registered_at: device
                        .registered_at
                        .duration_since(UNIX_EPOCH)
                        .unwrap_or_default()
                        .as_secs(),
                    in_session: session.is_some(),
                    session_id: session,
                    remote_addr: device.transport.peer_addr().to_string(),
                }
            })
            .collect()
    }
}
