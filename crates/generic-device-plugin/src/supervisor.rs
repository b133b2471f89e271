//! Restart supervision for the plugin server.
//!
//! The kubelet forgets every registered plugin when it restarts, and signals
//! this by recreating its registration socket. The supervisor owns the serve
//! loop: it builds a fresh [`PluginServer`] per attempt, watches for the
//! kubelet coming back, and re-registers.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::bail;
use device_plugin_api::KUBELET_SOCKET_NAME;
use notify::Event;
use notify::EventKind;
use tokio::time::sleep;
use tracing::info;
use tracing::warn;

use crate::config::Resource;
use crate::plugin::PluginServer;
use crate::watcher::SignalEvent;
use crate::watcher::SignalWatcher;
use crate::watcher::SocketWatcher;

/// Pause between stopping a live server and binding its replacement, so the
/// kubelet can finish tearing down the old endpoint.
const RESTART_GRACE_PERIOD: Duration = Duration::from_secs(1);

enum State {
    /// No live server; the next loop iteration makes a serve attempt.
    NeedsStart,
    /// Exactly one live, registered server instance.
    Serving(PluginServer),
    /// Terminal, `run` returns.
    Stopped,
}

/// Drives serve attempts and restarts for one resource catalog.
pub struct Supervisor {
    resource: Resource,
    plugin_dir: PathBuf,
    kubelet_socket: PathBuf,
}

impl Supervisor {
    pub fn new(resource: Resource, plugin_dir: PathBuf) -> Self {
        let kubelet_socket = plugin_dir.join(KUBELET_SOCKET_NAME);
        Self {
            resource,
            plugin_dir,
            kubelet_socket,
        }
    }

    /// Run until a terminate signal arrives.
    ///
    /// Serve failures are not fatal: the attempt is logged and retried on
    /// the next external event. Only a dead filesystem watcher ends the
    /// loop with an error, since kubelet restarts could no longer be
    /// observed.
    pub async fn run(
        self,
        mut sockets: SocketWatcher,
        mut signals: SignalWatcher,
    ) -> anyhow::Result<()> {
        let mut state = State::NeedsStart;

        loop {
            if matches!(state, State::NeedsStart) {
                state = self.try_serve().await;
            }

            state = tokio::select! {
                event = sockets.next() => match event {
                    Some(Ok(event)) => self.handle_fs_event(state, event).await,
                    Some(Err(e)) => {
                        warn!("filesystem watcher error: {e}");
                        state
                    }
                    None => bail!("filesystem watcher stopped unexpectedly"),
                },
                signal = signals.recv() => match signal {
                    SignalEvent::Reload => {
                        info!("received SIGHUP, restarting");
                        self.restart(state).await
                    }
                    SignalEvent::Terminate(name) => {
                        info!("received {name}, shutting down");
                        self.shutdown(state).await;
                        State::Stopped
                    }
                },
            };

            if matches!(state, State::Stopped) {
                return Ok(());
            }
        }
    }

    /// One serve attempt with a fresh server instance.
    async fn try_serve(&self) -> State {
        info!(
            "advertising {} devices for {}",
            self.resource.sets.len(),
            self.resource.name
        );
        let mut server = PluginServer::new(&self.resource, &self.plugin_dir);
        match server.serve(&self.kubelet_socket).await {
            Ok(()) => State::Serving(server),
            Err(e) => {
                warn!(
                    "could not serve device plugin: {e}; \
                     is the kubelet running with the device plugin feature gate enabled?"
                );
                State::NeedsStart
            }
        }
    }

    async fn handle_fs_event(&self, state: State, event: Event) -> State {
        if !self.is_kubelet_socket_created(&event) {
            return state;
        }
        info!("kubelet socket recreated, restarting");
        self.restart(state).await
    }

    fn is_kubelet_socket_created(&self, event: &Event) -> bool {
        matches!(event.kind, EventKind::Create(_))
            && event.paths.iter().any(|p| p == &self.kubelet_socket)
    }

    /// Stop the live instance if one exists, then wait out the grace period
    /// before the caller binds a replacement.
    async fn restart(&self, state: State) -> State {
        if let State::Serving(mut server) = state {
            if let Err(e) = server.stop().await {
                warn!("failed to stop device plugin server: {e}");
            }
            sleep(RESTART_GRACE_PERIOD).await;
        }
        State::NeedsStart
    }

    async fn shutdown(&self, state: State) {
        if let State::Serving(mut server) = state {
            if let Err(e) = server.stop().await {
                warn!("failed to stop device plugin server: {e}");
            }
        }
    }
}
