use clap::ValueEnum;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::status::StatusHub;
use crate::store::{self, KeyValueStore, StoreError};

pub const DEVICES_KEY: &str = "invoys_saved_devices";
pub const ACTIVE_DEVICE_KEY: &str = "invoys_active_device_id";
pub const DEFAULT_TERMINAL_PORT: u16 = 8989;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Printer,
    Terminal,
    Other,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeviceKind::Printer => "printer",
            DeviceKind::Terminal => "terminal",
            DeviceKind::Other => "other",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub ip: String,
    #[serde(rename = "type")]
    pub kind: DeviceKind,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl Device {
    pub fn endpoint_id(ip: &str, port: u16) -> String {
        format!("{}:{port}", ip.trim())
    }

    pub fn new(name: Option<&str>, ip: &str, port: u16, kind: DeviceKind) -> Self {
        let ip = ip.trim().to_string();
        let name = name
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("Device {ip}"));
        Self {
            id: Self::endpoint_id(&ip, port),
            name,
            ip,
            kind,
            port,
            token: None,
        }
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref().filter(|token| !token.is_empty())
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("device '{0}' is not registered")]
    UnknownDevice(String),
    #[error("invalid device: {0}")]
    InvalidDevice(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Default)]
struct RegistryState {
    devices: Vec<Device>,
    active_id: Option<String>,
}

impl RegistryState {
    fn find(&self, id: &str) -> Option<&Device> {
        self.devices.iter().find(|device| device.id == id)
    }

    fn active(&self) -> Option<Device> {
        self.active_id
            .as_deref()
            .and_then(|id| self.find(id))
            .cloned()
    }
}

/// Saved terminal endpoints plus the pointer to the active one.
///
/// The pointer is only an id; a pointer to a deleted device resolves to "no
/// active device". Every mutation rewrites the full device list while holding
/// the registry lock, so concurrent writers are serialized.
#[derive(Clone)]
pub struct DeviceRegistry {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn KeyValueStore>,
    status: StatusHub,
    state: Mutex<RegistryState>,
}

impl DeviceRegistry {
    pub fn load(store: Arc<dyn KeyValueStore>, status: StatusHub) -> Self {
        let devices = match store::load_json::<Vec<Device>>(store.as_ref(), DEVICES_KEY) {
            Ok(devices) => devices.unwrap_or_default(),
            Err(err) => {
                tracing::warn!(
                    target: "innalok::registry",
                    error = %err,
                    "failed to parse saved devices; starting with none"
                );
                Vec::new()
            }
        };
        let active_id = match store.get(ACTIVE_DEVICE_KEY) {
            Ok(id) => id,
            Err(err) => {
                tracing::warn!(
                    target: "innalok::registry",
                    error = %err,
                    "failed to read active device id"
                );
                None
            }
        };

        let state = RegistryState { devices, active_id };
        if let (Some(id), None) = (state.active_id.as_deref(), state.active()) {
            tracing::debug!(
                target: "innalok::registry",
                device_id = %id,
                "active device pointer refers to a removed device"
            );
        }
        status.publish_active(state.active());

        Self {
            inner: Arc::new(Inner {
                store,
                status,
                state: Mutex::new(state),
            }),
        }
    }

    pub fn status(&self) -> &StatusHub {
        &self.inner.status
    }

    pub fn list_devices(&self) -> Vec<Device> {
        self.inner.state.lock().devices.clone()
    }

    pub fn device(&self, id: &str) -> Option<Device> {
        self.inner.state.lock().find(id).cloned()
    }

    pub fn active_device(&self) -> Option<Device> {
        self.inner.state.lock().active()
    }

    /// Registers `candidate`. The id is re-derived from ip and port, so adding
    /// the same endpoint twice is a no-op that returns `None`.
    pub fn add_device(&self, mut candidate: Device) -> Result<Option<Device>, RegistryError> {
        if candidate.ip.trim().is_empty() {
            return Err(RegistryError::InvalidDevice("ip address is required".into()));
        }
        candidate.ip = candidate.ip.trim().to_string();
        candidate.id = Device::endpoint_id(&candidate.ip, candidate.port);

        let mut state = self.inner.state.lock();
        if state.find(&candidate.id).is_some() {
            return Ok(None);
        }
        let mut devices = state.devices.clone();
        devices.push(candidate.clone());
        self.persist_devices(&devices)?;
        state.devices = devices;
        tracing::info!(
            target: "innalok::registry",
            device_id = %candidate.id,
            name = %candidate.name,
            "device saved"
        );
        Ok(Some(candidate))
    }

    pub fn remove_device(&self, id: &str) -> Result<Option<Device>, RegistryError> {
        let mut state = self.inner.state.lock();
        let Some(position) = state.devices.iter().position(|device| device.id == id) else {
            return Ok(None);
        };
        let mut devices = state.devices.clone();
        let removed = devices.remove(position);
        self.persist_devices(&devices)?;
        state.devices = devices;

        if state.active_id.as_deref() == Some(id) {
            self.inner.store.remove(ACTIVE_DEVICE_KEY)?;
            state.active_id = None;
            self.inner.status.publish_active(None);
        }
        tracing::info!(target: "innalok::registry", device_id = %id, "device removed");
        Ok(Some(removed))
    }

    /// Points the registry at `id`, or clears the pointer with `None`.
    pub fn set_active_device(&self, id: Option<&str>) -> Result<Option<Device>, RegistryError> {
        let mut state = self.inner.state.lock();
        match id {
            Some(id) => {
                let device = state
                    .find(id)
                    .cloned()
                    .ok_or_else(|| RegistryError::UnknownDevice(id.to_string()))?;
                self.inner.store.set(ACTIVE_DEVICE_KEY, id)?;
                state.active_id = Some(id.to_string());
                self.inner.status.publish_active(Some(device.clone()));
                tracing::info!(target: "innalok::registry", device_id = %id, "active device set");
                Ok(Some(device))
            }
            None => {
                self.inner.store.remove(ACTIVE_DEVICE_KEY)?;
                state.active_id = None;
                self.inner.status.publish_active(None);
                tracing::info!(target: "innalok::registry", "active device cleared");
                Ok(None)
            }
        }
    }

    pub fn update_device_token(&self, id: &str, token: &str) -> Result<Device, RegistryError> {
        let mut state = self.inner.state.lock();
        let mut devices = state.devices.clone();
        let device = devices
            .iter_mut()
            .find(|device| device.id == id)
            .ok_or_else(|| RegistryError::UnknownDevice(id.to_string()))?;
        device.token = Some(token.to_string());
        let updated = device.clone();
        self.persist_devices(&devices)?;
        state.devices = devices;

        if state.active_id.as_deref() == Some(id) {
            self.inner.status.publish_active(Some(updated.clone()));
        }
        Ok(updated)
    }

    fn persist_devices(&self, devices: &[Device]) -> Result<(), RegistryError> {
        store::save_json(self.inner.store.as_ref(), DEVICES_KEY, devices)?;
        Ok(())
    }
}
