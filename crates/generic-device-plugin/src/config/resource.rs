//! Device catalog configuration.
//!
//! The catalog is a YAML file naming one kubelet resource and the fixed set
//! of devices backing it. Parsing is strict: unknown fields are rejected so
//! a typo cannot silently advertise a device without its payload.

use std::collections::HashMap;
use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;

use device_plugin_api::v1beta1;
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("{resource}: device id {id} already defined")]
    DuplicateId { resource: String, id: String },
    #[error("{resource}: catalog defines no devices")]
    EmptyCatalog { resource: String },
}

/// One schedulable resource and the devices backing it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Resource {
    /// Resource name advertised to the kubelet, e.g. `example.com/foo`.
    pub name: String,
    /// One entry per schedulable device.
    pub sets: Vec<ResourceSet>,
}

/// A single device id and the payload handed to containers allocated to it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceSet {
    pub id: String,
    /// Omitting the spec advertises the device with an empty payload.
    #[serde(default)]
    pub spec: AllocateSpec,
}

/// Declarative form of the allocation response for one device.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AllocateSpec {
    pub envs: HashMap<String, String>,
    pub mounts: Vec<Mount>,
    pub devices: Vec<DeviceSpec>,
    pub annotations: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct Mount {
    pub container_path: String,
    pub host_path: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct DeviceSpec {
    pub container_path: String,
    pub host_path: String,
    /// Cgroup permissions, one or more of "r", "w", "m".
    pub permissions: String,
}

impl Resource {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.sets.is_empty() {
            return Err(ConfigError::EmptyCatalog {
                resource: self.name.clone(),
            });
        }
        let mut seen = HashSet::new();
        for set in &self.sets {
            if !seen.insert(set.id.as_str()) {
                return Err(ConfigError::DuplicateId {
                    resource: self.name.clone(),
                    id: set.id.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Load and validate a device catalog.
pub fn load(path: &Path) -> Result<Resource, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let resource: Resource = serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    resource.validate()?;
    Ok(resource)
}

impl From<&AllocateSpec> for v1beta1::ContainerAllocateResponse {
    fn from(spec: &AllocateSpec) -> Self {
        Self {
            envs: spec.envs.clone(),
            mounts: spec.mounts.iter().map(v1beta1::Mount::from).collect(),
            devices: spec.devices.iter().map(v1beta1::DeviceSpec::from).collect(),
            annotations: spec.annotations.clone(),
        }
    }
}

impl From<&Mount> for v1beta1::Mount {
    fn from(mount: &Mount) -> Self {
        Self {
            container_path: mount.container_path.clone(),
            host_path: mount.host_path.clone(),
            read_only: mount.read_only,
        }
    }
}

impl From<&DeviceSpec> for v1beta1::DeviceSpec {
    fn from(device: &DeviceSpec) -> Self {
        Self {
            container_path: device.container_path.clone(),
            host_path: device.host_path.clone(),
            permissions: device.permissions.clone(),
        }
    }
}
