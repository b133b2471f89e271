//! External event sources for the supervisor.
//!
//! The main components are:
//! - [`SocketWatcher`]: filesystem events from the plugin directory
//! - [`SignalWatcher`]: process signals mapped to supervisor actions

pub mod fs;
pub mod signal;

pub use fs::SocketWatcher;
pub use signal::SignalEvent;
pub use signal::SignalWatcher;
