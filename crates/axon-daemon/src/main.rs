//! Axon Daemon - Main entry point
//!
//! Runs the bridge between device traffic and consolidated state snapshots
//! and serves the inspection API.

mod api;
mod bridge;
mod config;
mod replay;
mod server;
mod state;
mod ws;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "axon")]
#[command(about = "Device command correlation and state snapshot bridge")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "axon.toml")]
    config: PathBuf,

    /// Bind address for web server
    #[arg(short, long)]
    bind: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Replay a JSON-lines recording of `{topic, payload}` records, print snapshots and exit
    #[arg(long)]
    replay: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Axon v{}", env!("CARGO_PKG_VERSION"));

    let mut config = config::load_config(&args.config)?;

    if let Some(bind) = args.bind {
        config.daemon.bind = bind;
    }

    info!(
        src = %config.bridge.src,
        resp_to = %config.bridge.resp_to,
        timeout_secs = config.bridge.request_timeout_secs,
        "Configuration loaded"
    );

    let state = state::AppState::new(config.clone()).await?;

    if let Some(path) = args.replay {
        replay::replay_file(&state, &path).await?;
        let snapshots = state.snapshots().await;
        println!("{}", serde_json::to_string_pretty(&snapshots)?);
    } else {
        server::run(state, &config.daemon.bind).await?;
    }

    Ok(())
}
