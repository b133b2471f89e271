//! Node-local agent advertising a fixed device catalog to the kubelet over
//! the device plugin gRPC protocol (v1beta1).

pub mod config;
pub mod logging;
pub mod plugin;
pub mod supervisor;
pub mod watcher;

// Re-export the pieces the binary and the integration tests wire together
pub use config::Resource;
pub use plugin::HealthMonitor;
pub use plugin::PluginServer;
pub use supervisor::Supervisor;
pub use watcher::SignalWatcher;
pub use watcher::SocketWatcher;
