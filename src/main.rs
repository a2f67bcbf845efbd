mod client;
mod clock;
mod codec;
mod config;
mod error;
mod node;
mod server;

use anyhow::{Context, Result};
use clap::Parser;
use config::Cli;
use node::Node;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug)?;

    info!("ntp5node v{}", env!("CARGO_PKG_VERSION"));
    info!("experimental NTPv4/NTPv5 client and server node");

    let mut node = Node::new(
        cli.local,
        cli.port,
        cli.max_distance,
        cli.dispersion_rate,
        cli.no_refid_loop,
        &cli.servers,
        cli.version,
        cli.poll,
        cli.interleaved,
        cli.refids_fragments,
    )
    .context("failed to initialize node")?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_handler = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        warn!("shutdown requested");
        shutdown_handler.store(true, Ordering::SeqCst);
    })
    .context("failed to set Ctrl+C handler")?;

    info!(port = cli.port, servers = ?cli.servers, "listening");

    while !shutdown.load(Ordering::SeqCst) {
        if let Err(e) = node.process_events(true) {
            error!(error = %e, "event loop error");
        }
    }

    info!("shutting down");
    Ok(())
}

fn init_logging(debug: u8) -> Result<()> {
    let default_level = match debug {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .context("failed to create log filter")?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}
