use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use generic_device_plugin::config;
use generic_device_plugin::config::Cli;
use generic_device_plugin::logging;
use generic_device_plugin::supervisor::Supervisor;
use generic_device_plugin::watcher::SignalWatcher;
use generic_device_plugin::watcher::SocketWatcher;
use tracing::info;

/// Route panics through the log output as well as stderr.
fn setup_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("thread panicked: {panic_info}");
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_panic_hook();

    let cli = Cli::parse();
    logging::init(cli.log_level);

    let resource = config::load(&cli.config)
        .with_context(|| format!("failed to load device catalog {}", cli.config.display()))?;
    info!(
        "loaded catalog for {} with {} devices",
        resource.name,
        resource.sets.len()
    );

    let sockets = SocketWatcher::new(&cli.plugin_dir).with_context(|| {
        format!(
            "failed to watch plugin directory {}",
            cli.plugin_dir.display()
        )
    })?;
    let signals = SignalWatcher::new().context("failed to install signal handlers")?;

    Supervisor::new(resource, cli.plugin_dir)
        .run(sockets, signals)
        .await
}
