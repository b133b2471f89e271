//! Device plugin serving module.
//!
//! One [`PluginServer`] instance covers one serve attempt: it owns the unix
//! socket, the gRPC service, the device table, and the per-instance stop
//! signal. Instances are never restarted; the supervisor builds a fresh one
//! for every attempt.
//!
//! The main components are:
//! - [`PluginServer`]: socket lifecycle, kubelet registration, teardown
//! - [`HealthMonitor`]: background health watcher feeding downgrade events
//! - [`HealthEvent`]: a single one-way downgrade

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub(crate) mod devices;
pub mod health;
pub mod server;

pub use health::HealthEvent;
pub use health::HealthMonitor;
pub use server::PluginServer;

/// Failed attempt to open a gRPC channel over a unix socket.
#[derive(Error, Debug)]
pub enum DialError {
    #[error("timed out connecting to {} after {timeout:?}", path.display())]
    Timeout { path: PathBuf, timeout: Duration },
    #[error("failed to connect to {}: {source}", path.display())]
    Connect {
        path: PathBuf,
        source: tonic::transport::Error,
    },
}

/// Failure while binding and starting the plugin's own server.
#[derive(Error, Debug)]
pub enum StartError {
    #[error("device plugin server was already started")]
    AlreadyStarted,
    #[error("failed to remove stale socket {}: {source}", path.display())]
    Cleanup {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to bind {}: {source}", path.display())]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("liveness probe failed: {0}")]
    Probe(#[from] DialError),
}

/// Failure while announcing the plugin to the kubelet.
#[derive(Error, Debug)]
pub enum RegisterError {
    #[error("failed to reach kubelet: {0}")]
    Dial(#[from] DialError),
    #[error("kubelet rejected registration: {0}")]
    Rpc(#[from] tonic::Status),
}

/// Failure of a whole serve attempt, either phase.
#[derive(Error, Debug)]
pub enum ServeError {
    #[error("start failed: {0}")]
    Start(#[from] StartError),
    #[error("registration failed: {0}")]
    Register(#[from] RegisterError),
}
