//! tracing subscriber setup

use std::io::IsTerminal;

use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// Install the global subscriber, writing to stderr.
///
/// `default_level` comes from the command line; directives in `RUST_LOG`
/// still take precedence for the targets they name. Color is only emitted
/// when stderr is a terminal, so journald and container logs stay clean.
pub fn init(default_level: filter::LevelFilter) {
    let env_filter = filter::EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    let fmt_layer = layer()
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_target(true)
        .with_filter(env_filter);

    registry().with(fmt_layer).init();
}
