//! Process signal handling for the supervisor loop.

use std::io;

use tokio::signal::unix::signal;
use tokio::signal::unix::Signal;
use tokio::signal::unix::SignalKind;

/// What a received signal means for the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    /// SIGHUP: drop the current server instance and re-register.
    Reload,
    /// Shut down cleanly; carries the signal name for logging.
    Terminate(&'static str),
}

/// Multiplexes the process signals the daemon reacts to.
pub struct SignalWatcher {
    sighup: Signal,
    sigint: Signal,
    sigterm: Signal,
    sigquit: Signal,
}

impl SignalWatcher {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            sighup: signal(SignalKind::hangup())?,
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
            sigquit: signal(SignalKind::quit())?,
        })
    }

    /// Wait for the next signal the daemon cares about.
    pub async fn recv(&mut self) -> SignalEvent {
        tokio::select! {
            _ = self.sighup.recv() => SignalEvent::Reload,
            _ = self.sigint.recv() => SignalEvent::Terminate("SIGINT"),
            _ = self.sigterm.recv() => SignalEvent::Terminate("SIGTERM"),
            _ = self.sigquit.recv() => SignalEvent::Terminate("SIGQUIT"),
        }
    }
}
