use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::filter::LevelFilter;

/// Expose a fixed set of node devices to the kubelet.
#[derive(Parser, Debug)]
#[command(about, version)]
pub struct Cli {
    /// Device catalog to advertise.
    #[arg(value_hint = clap::ValueHint::FilePath)]
    pub config: PathBuf,

    #[arg(
        long,
        env = "PLUGIN_DIR",
        value_hint = clap::ValueHint::DirPath,
        default_value = device_plugin_api::DEVICE_PLUGIN_PATH,
        help = "Directory holding the kubelet registration socket and plugin sockets"
    )]
    pub plugin_dir: PathBuf,

    #[arg(
        long,
        default_value = "info",
        value_parser = parse_log_level,
        help = "Default log level, individual targets can be overridden via RUST_LOG"
    )]
    pub log_level: LevelFilter,
}

fn parse_log_level(value: &str) -> Result<LevelFilter, String> {
    value
        .parse()
        .map_err(|_| format!("invalid log level: {value}"))
}
