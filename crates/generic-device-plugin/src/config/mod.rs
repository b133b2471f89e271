//! Daemon configuration: command line arguments and the device catalog.

pub mod cli;
pub mod resource;

pub use cli::*;
pub use resource::*;
