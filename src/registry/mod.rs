//! Shared registries populated by the external device bridge.
//!
//! The relay never writes these on its own behalf: the bridge attaches and
//! detaches devices as they connect, and publishes the local port a device's
//! mirroring stream is served on once it has been started. Both registries
//! are created at startup and injected into the components that read them.

use std::collections::{HashMap, HashSet};
use std::fmt;

use tokio::sync::RwLock;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DeviceId(String);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for DeviceId {
    fn from(device_id: &str) -> Self {
        DeviceId(device_id.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(device_id: String) -> Self {
        DeviceId(device_id)
    }
}

/// Set of devices currently connected to the local bridge.
pub struct DeviceRegistry {
    devices: RwLock<HashSet<DeviceId>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            devices: RwLock::new(HashSet::new()),
        }
    }

    pub async fn attach(&self, device_id: DeviceId) {
        self.devices.write().await.insert(device_id);
    }

    pub async fn detach(&self, device_id: &DeviceId) {
        self.devices.write().await.remove(device_id);
    }

    pub async fn is_live(&self, device_id: &DeviceId) -> bool {
        self.devices.read().await.contains(device_id)
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Eventually-consistent map from device to the local port its mirroring
/// stream is served on. Written by the bridge once mirroring has started.
pub struct PortRegistry {
    ports: RwLock<HashMap<DeviceId, u16>>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self {
            ports: RwLock::new(HashMap::new()),
        }
    }

    pub async fn publish(&self, device_id: DeviceId, port: u16) {
        self.ports.write().await.insert(device_id, port);
    }

    pub async fn withdraw(&self, device_id: &DeviceId) {
        self.ports.write().await.remove(device_id);
    }

    pub async fn port(&self, device_id: &DeviceId) -> Option<u16> {
        self.ports.read().await.get(device_id).copied()
    }
}

impl Default for PortRegistry {
    fn default() -> Self {
        Self::new()
    }
}
