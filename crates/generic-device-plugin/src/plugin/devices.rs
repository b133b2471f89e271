//! Owned device state for one plugin server instance.

use std::collections::HashMap;

use device_plugin_api::v1beta1;
use device_plugin_api::HEALTHY;
use device_plugin_api::UNHEALTHY;
use tokio::sync::RwLock;

use crate::config::Resource;

/// Health of a single advertised device.
///
/// Downgrades are one-way: nothing moves a device back to `Healthy` within
/// the lifetime of a server instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Health {
    Healthy,
    Unhealthy,
}

impl Health {
    fn as_str(self) -> &'static str {
        match self {
            Health::Healthy => HEALTHY,
            Health::Unhealthy => UNHEALTHY,
        }
    }
}

#[derive(Debug)]
struct Device {
    id: String,
    health: Health,
}

/// Device list in catalog order plus the per-device allocation payloads.
///
/// Owned by exactly one plugin server. The only mutation is the health
/// downgrade; every reader works from a snapshot.
#[derive(Debug)]
pub(crate) struct DeviceTable {
    devices: RwLock<Vec<Device>>,
    payloads: HashMap<String, v1beta1::ContainerAllocateResponse>,
}

impl DeviceTable {
    pub(crate) fn new(resource: &Resource) -> Self {
        let devices = resource
            .sets
            .iter()
            .map(|set| Device {
                id: set.id.clone(),
                health: Health::Healthy,
            })
            .collect();
        let payloads = resource
            .sets
            .iter()
            .map(|set| {
                (
                    set.id.clone(),
                    v1beta1::ContainerAllocateResponse::from(&set.spec),
                )
            })
            .collect();
        Self {
            devices: RwLock::new(devices),
            payloads,
        }
    }

    /// Wire-format view of the current device list, in catalog order.
    pub(crate) async fn snapshot(&self) -> Vec<v1beta1::Device> {
        self.devices
            .read()
            .await
            .iter()
            .map(|device| v1beta1::Device {
                id: device.id.clone(),
                health: device.health.as_str().to_string(),
            })
            .collect()
    }

    /// Downgrade one device. Returns whether the device transitioned now;
    /// unknown ids and already-unhealthy devices report `false`.
    pub(crate) async fn mark_unhealthy(&self, id: &str) -> bool {
        let mut devices = self.devices.write().await;
        match devices.iter_mut().find(|device| device.id == id) {
            Some(device) if device.health == Health::Healthy => {
                device.health = Health::Unhealthy;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn contains(&self, id: &str) -> bool {
        self.payloads.contains_key(id)
    }

    /// Allocation payload configured for `id`.
    pub(crate) fn payload(&self, id: &str) -> Option<v1beta1::ContainerAllocateResponse> {
        self.payloads.get(id).cloned()
    }
}
