use std::path::PathBuf;

use anyhow::Context as _;
use clap::Parser;
use log::{LevelFilter, error, info};

mod alert;
mod assets;
mod config;
mod debounce;
mod identity;
mod ingest;
mod lifecycle;
mod logging;
mod manager;
mod messages;
mod mqtt;
mod notifier;
mod presentation;
mod speaker;
#[cfg(all(feature = "tray", target_os = "linux"))]
mod tray;

/// Receive a notification when the cat wants to come inside.
#[derive(Parser, Debug)]
#[command(name = "cat-doorbell", version, about)]
struct Args {
    /// Path to the configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory to store log files.
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Log verbosity (off, error, warn, info, debug, trace).
    #[arg(long, default_value = "info")]
    log_level: LevelFilter,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(err) = run(args).await {
        error!("Failed to run the application: {:#}", err);
        if log::max_level() == LevelFilter::Off {
            eprintln!("Failed to run the application: {:#}", err);
        }
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let log_dir = args.log_dir.unwrap_or_else(logging::default_log_dir);
    let log_file = logging::init(args.log_level, &log_dir)?;
    info!("Logging to {}", log_file.display());

    let config_path = args.config.unwrap_or_else(config::default_path);
    let config = config::load(&config_path)
        .with_context(|| format!("failed to load configuration from {}", config_path.display()))?;

    info!("Target device: {}", config.target_mac);

    let transport = mqtt::MqttTransport::new(&config)?;
    let lifecycle = lifecycle::Lifecycle::new();
    lifecycle::spawn_signal_listener(lifecycle.handle());

    manager::Manager::new(
        config,
        lifecycle,
        Box::new(transport),
        Box::new(presentation::DesktopPresentation::default()),
    )
    .run_loop()
    .await
}
