//! Filesystem watching for the plugin directory.

use std::path::Path;

use notify::Config;
use notify::Event;
use notify::RecommendedWatcher;
use notify::RecursiveMode;
use notify::Watcher;
use tokio::sync::mpsc;
use tracing::debug;

/// Stream of raw filesystem events for the plugin directory.
///
/// notify delivers events on its own thread; the callback forwards them into
/// a tokio channel so the supervisor can select over them. The watcher must
/// stay alive for events to keep flowing, so it lives inside this handle.
pub struct SocketWatcher {
    _watcher: RecommendedWatcher,
    events: mpsc::UnboundedReceiver<notify::Result<Event>>,
}

impl SocketWatcher {
    /// Watch `plugin_dir`, non-recursive.
    pub fn new(plugin_dir: &Path) -> notify::Result<Self> {
        let (tx, events) = mpsc::unbounded_channel();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                // send fails only once the supervisor is gone
                let _ = tx.send(res);
            },
            Config::default(),
        )?;
        watcher.watch(plugin_dir, RecursiveMode::NonRecursive)?;
        debug!("watching {} for socket changes", plugin_dir.display());

        Ok(Self {
            _watcher: watcher,
            events,
        })
    }

    /// Next raw event, or `None` if the watcher went away.
    pub async fn next(&mut self) -> Option<notify::Result<Event>> {
        self.events.recv().await
    }
}
