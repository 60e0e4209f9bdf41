#![forbid(unsafe_code)]

//! **chronicled** – Chronicle event store daemon.
//!
//! Serves the multipart command protocol over TCP against a daily-layout
//! store, or rebuilds the per-type indexes and exits.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chronicle_engine::ActionHandler;
use chronicle_serial::PassthruSerializer;
use chronicle_server::CommandServer;
use chronicle_store_core::EventStorage;
use chronicle_store_daily::DailyDiskStorage;

#[derive(Parser)]
#[command(name = "chronicled")]
#[command(about = "Chronicle - append-only event store daemon")]
#[command(version)]
struct Cli {
    /// Transport URI to listen on
    #[arg(long, default_value = "tcp://127.0.0.1:12345")]
    addr: String,

    /// Storage root directory
    #[arg(long, default_value = "./events")]
    db: PathBuf,

    /// Rebuild the per-type indexes from the global index, then exit
    #[arg(long, alias = "buildTypeIndexes")]
    build_type_indexes: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(&cli.log_level)?;
    info!("chronicled v{}", env!("CARGO_PKG_VERSION"));

    let storage_root = if cli.db.is_absolute() {
        cli.db.clone()
    } else {
        std::env::current_dir()?.join(&cli.db)
    };
    info!(path = %storage_root.display(), "storage root");

    let storage = Arc::new(DailyDiskStorage::open(&storage_root).await?);

    if cli.build_type_indexes {
        storage.rebuild_type_indexes().await?;
        info!("type indexes rebuilt, exiting");
        return Ok(());
    }

    let serializer = Arc::new(PassthruSerializer::tunneling());
    let handler = Arc::new(ActionHandler::new(storage, serializer));

    let listen_addr = parse_listen_addr(&cli.addr)?;
    let server = CommandServer::bind(listen_addr, handler).await?;
    info!(addr = %cli.addr, "listening");

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("interrupt received, shutting down"),
    }
    Ok(())
}

fn init_tracing(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

fn parse_listen_addr(addr: &str) -> Result<&str> {
    addr.strip_prefix("tcp://")
        .context("only tcp:// listen addresses are supported")
}
