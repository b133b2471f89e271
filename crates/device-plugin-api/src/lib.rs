//! Kubelet device plugin API definitions (v1beta1).
//!
//! Generated gRPC bindings for the kubelet's `Registration` service and the
//! plugin-side `DevicePlugin` service, plus the protocol's well-known
//! constants.

/// Generated bindings for the `v1beta1` protocol.
pub mod v1beta1 {
    tonic::include_proto!("v1beta1");
}

/// Protocol version announced during registration.
pub const API_VERSION: &str = "v1beta1";

/// Directory where the kubelet expects device plugin sockets.
pub const DEVICE_PLUGIN_PATH: &str = "/var/lib/kubelet/device-plugins";

/// Basename of the kubelet's registration socket inside [`DEVICE_PLUGIN_PATH`].
pub const KUBELET_SOCKET_NAME: &str = "kubelet.sock";

/// Health value for a schedulable device.
pub const HEALTHY: &str = "Healthy";

/// Health value for a device that must not be scheduled.
pub const UNHEALTHY: &str = "Unhealthy";
