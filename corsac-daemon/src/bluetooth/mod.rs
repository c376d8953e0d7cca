/*!
 * Bluetooth Device Management
 * Device model, registry and BlueZ object-tree helpers
 */

pub mod admission;
pub mod playback;
pub mod volume;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::bus::{ObjectMap, PropValue};

pub const BLUEZ_SERVICE: &str = "org.bluez";
pub const ADAPTER_IFACE: &str = "org.bluez.Adapter1";
pub const DEVICE_IFACE: &str = "org.bluez.Device1";
pub const PLAYER_IFACE: &str = "org.bluez.MediaPlayer1";
pub const TRANSPORT_IFACE: &str = "org.bluez.MediaTransport1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub address: String,
    pub name: String,
    pub paired: bool,
    pub connected: bool,
}

impl Device {
    /// Build a device from decoded Device1 properties. Address is the
    /// identity and therefore required; everything else defaults.
    pub fn from_props(props: &HashMap<String, PropValue>) -> Option<Self> {
        let address = props.get("Address")?.as_str()?.to_string();
        Some(Device {
            address,
            name: props
                .get("Name")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            paired: props
                .get("Paired")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            connected: props
                .get("Connected")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
        })
    }
}

/// Extract the colon-hex address from a BlueZ object path like
/// `/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF/player0`.
pub fn address_from_path(path: &str) -> Option<String> {
    path.split('/')
        .find_map(|segment| segment.strip_prefix("dev_"))
        .map(|addr| addr.replace('_', ":"))
}

pub fn find_adapter_path(objects: &ObjectMap) -> Option<String> {
    objects
        .iter()
        .find(|(_, interfaces)| interfaces.contains_key(ADAPTER_IFACE))
        .map(|(path, _)| path.clone())
}

/// All devices currently marked connected, with their object paths.
pub fn connected_devices(objects: &ObjectMap) -> Vec<(String, Device)> {
    let mut found: Vec<(String, Device)> = objects
        .iter()
        .filter_map(|(path, interfaces)| {
            let device = Device::from_props(interfaces.get(DEVICE_IFACE)?)?;
            device.connected.then(|| (path.clone(), device))
        })
        .collect();
    found.sort_by(|a, b| a.0.cmp(&b.0));
    found
}

/// Devices observed on the bus, keyed by object path. Replaces the old
/// habit of ambient global dictionaries: the registry is created once in
/// main and handed to the router and the shutdown path explicitly.
pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, Device>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
        }
    }

    pub async fn seed(&self, objects: &ObjectMap) {
        let mut devices = self.devices.write().await;
        devices.clear();
        for (path, interfaces) in objects {
            if let Some(device) = interfaces.get(DEVICE_IFACE).and_then(Device::from_props) {
                devices.insert(path.clone(), device);
            }
        }
    }

    pub async fn upsert(&self, path: &str, device: Device) {
        self.devices.write().await.insert(path.to_string(), device);
    }

    pub async fn remove(&self, path: &str) -> Option<Device> {
        self.devices.write().await.remove(path)
    }

    /// Flip the connected flag, creating a minimal entry when the device
    /// was never enumerated. Returns the updated device.
    pub async fn set_connected(&self, path: &str, connected: bool) -> Option<Device> {
        let mut devices = self.devices.write().await;
        match devices.get_mut(path) {
            Some(device) => {
                device.connected = connected;
                Some(device.clone())
            }
            None => {
                let address = address_from_path(path)?;
                let device = Device {
                    address,
                    name: String::new(),
                    paired: false,
                    connected,
                };
                devices.insert(path.to_string(), device.clone());
                Some(device)
            }
        }
    }

    pub async fn all(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self.devices.read().await.values().cloned().collect();
        devices.sort_by(|a, b| a.address.cmp(&b.address));
        devices
    }

    pub async fn connected(&self) -> Vec<(String, Device)> {
        self.devices
            .read()
            .await
            .iter()
            .filter(|(_, d)| d.connected)
            .map(|(p, d)| (p.clone(), d.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_address_from_device_and_child_paths() {
        assert_eq!(
            address_from_path("/org/bluez/hci0/dev_80_B9_89_1E_B5_6F"),
            Some("80:B9:89:1E:B5:6F".to_string())
        );
        assert_eq!(
            address_from_path("/org/bluez/hci0/dev_80_B9_89_1E_B5_6F/player0"),
            Some("80:B9:89:1E:B5:6F".to_string())
        );
        assert_eq!(address_from_path("/org/bluez/hci0"), None);
    }

    #[test]
    fn device_requires_address() {
        let mut props = HashMap::new();
        props.insert("Name".to_string(), PropValue::Str("Phone".to_string()));
        assert!(Device::from_props(&props).is_none());

        props.insert(
            "Address".to_string(),
            PropValue::Str("AA:BB:CC:DD:EE:FF".to_string()),
        );
        props.insert("Connected".to_string(), PropValue::Bool(true));
        let device = Device::from_props(&props).unwrap();
        assert_eq!(device.address, "AA:BB:CC:DD:EE:FF");
        assert!(device.connected);
        assert!(!device.paired);
    }

    #[tokio::test]
    async fn registry_tracks_connection_flags() {
        let registry = DeviceRegistry::new();
        let path = "/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF";

        let device = registry.set_connected(path, true).await.unwrap();
        assert_eq!(device.address, "AA:BB:CC:DD:EE:FF");
        assert_eq!(registry.connected().await.len(), 1);

        registry.set_connected(path, false).await;
        assert!(registry.connected().await.is_empty());
    }
}
