//! Device health monitoring.
//!
//! Opaque devices expose no failure source the daemon could poll, so the
//! monitor itself only parks on the stop signal. [`HealthMonitor::report_unhealthy`]
//! is the submission path a concrete detector drives once one exists.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;

/// A one-way health downgrade for a single device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthEvent {
    pub device_id: String,
}

/// Background health watcher for one plugin server instance.
#[derive(Debug, Clone)]
pub struct HealthMonitor {
    device_ids: Vec<String>,
    events: mpsc::Sender<HealthEvent>,
}

impl HealthMonitor {
    pub(crate) fn new(device_ids: Vec<String>, events: mpsc::Sender<HealthEvent>) -> Self {
        Self { device_ids, events }
    }

    /// Queue a downgrade for one of this instance's devices.
    ///
    /// Returns whether the event was accepted; ids outside the catalog are
    /// ignored, and a stopped server no longer consumes events.
    pub async fn report_unhealthy(&self, device_id: &str) -> bool {
        if !self.device_ids.iter().any(|id| id == device_id) {
            debug!("ignoring health report for unknown device {device_id}");
            return false;
        }
        self.events
            .send(HealthEvent {
                device_id: device_id.to_string(),
            })
            .await
            .is_ok()
    }

    /// Park until the server stops.
    pub(crate) async fn run(self, cancellation_token: CancellationToken) {
        cancellation_token.cancelled().await;
        info!("health monitor stopped");
    }
}
