//! sgnd - SGN Knowledge Unit Gossip Daemon
//!
//! Accepts KUs over HTTP, persists them once, and fans them out to
//! WebSocket subscribers with at-least-once, per-subscriber-ordered
//! delivery.

use clap::Parser;
use sgnd::config::Config;
use sgnd::server::Daemon;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();
    init_logging(&config);

    info!("sgnd v{}", env!("CARGO_PKG_VERSION"));

    let daemon = match Daemon::new(config) {
        Ok(daemon) => Arc::new(daemon),
        Err(e) => {
            error!("failed to initialize daemon: {e}");
            return ExitCode::from(e.exit_code());
        }
    };

    if let Err(e) = daemon.run().await {
        error!("daemon error: {e}");
        return ExitCode::from(e.exit_code());
    }

    ExitCode::SUCCESS
}

fn init_logging(config: &Config) {
    let default_level = if config.verbose { "sgnd=debug" } else { "sgnd=info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    if config.log_format == "json" {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }
}
