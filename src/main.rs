//! MIDI Directory command-line tool
//!
//! Lists MIDI endpoints and monitors decoded traffic with hot-plug support.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

mod cli;
mod sniffer;

use crate::cli::{Args, Command};
use midi_directory::config::LoggingConfig;
use midi_directory::{AppConfig, MidiSystem, MidirTransport};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let config_path = args.config.clone().or_else(AppConfig::default_path);
    let mut config = match &config_path {
        Some(path) => AppConfig::load_or_default(path)
            .await
            .with_context(|| format!("Failed to load config: {}", path.display()))?,
        None => AppConfig::default(),
    };
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    if args.log_json {
        config.logging.json = true;
    }

    // Keep the guard alive so buffered file logs are flushed on exit
    let _guard = init_logging(&config.logging)?;

    info!("Starting MIDI Directory v{}", env!("CARGO_PKG_VERSION"));
    if let Some(path) = &config_path {
        info!("Configuration file: {}", path.display());
    }

    let transport = Arc::new(MidirTransport::new(config.client_name.clone()));
    let system = MidiSystem::start(transport, config, tokio::runtime::Handle::current())
        .context("Failed to start MIDI system")?;

    let result = match args.command {
        Command::List { json } => sniffer::print_endpoints(system.directory(), json),
        Command::Monitor { filter } => sniffer::run_monitor(system.clone(), filter).await,
    };

    system.shutdown().await;
    info!("MIDI Directory shutdown complete");
    result
}

fn init_logging(logging: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let console = if logging.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_writer(std::io::stderr)
            .boxed()
    };

    let (file, guard) = match &logging.directory {
        Some(directory) => {
            let (layer, guard) = file_layer(directory)?;
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .init();

    Ok(guard)
}

type BoxedLayer<S> = Box<dyn Layer<S> + Send + Sync>;

fn file_layer<S>(directory: &Path) -> Result<(BoxedLayer<S>, WorkerGuard)>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    std::fs::create_dir_all(directory)
        .with_context(|| format!("Failed to create log directory: {}", directory.display()))?;

    let appender = tracing_appender::rolling::daily(directory, "midi-directory.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_target(false)
        .with_writer(writer)
        .boxed();

    Ok((layer, guard))
}
