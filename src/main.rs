//! Runway server binary: composition root wiring the inventory, queue,
//! streaming hub, shell transport, and HTTP API together.

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use runway::{
    ExecutionQueue, HttpState, ShellTransport, StaticInventory, StreamingHub, TargetExpander,
    config, observability, run_http_server,
};

#[derive(Debug, Parser)]
#[command(name = "runway", about = "Execution admission and live-output streaming service")]
struct Args {
    /// Override RUNWAY_HTTP_ADDR
    #[arg(long)]
    http_addr: Option<SocketAddr>,

    /// Override RUNWAY_INVENTORY_PATH
    #[arg(long)]
    inventory: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();
    let args = Args::parse();

    let mut config = config::try_get_config()?;
    if let Some(addr) = args.http_addr {
        config.http_addr = addr;
    }
    if let Some(path) = args.inventory {
        config.inventory_path = path.display().to_string();
    }

    let inventory = StaticInventory::load(&config.inventory_path)?;
    info!(
        path = %config.inventory_path,
        groups = inventory.group_count(),
        "inventory loaded",
    );

    let hub = StreamingHub::new(config.stream.clone());
    hub.start_heartbeat();

    let queue = ExecutionQueue::new(
        config.queue.clone(),
        Arc::new(ShellTransport::new()),
        hub.clone(),
    );
    let worker = queue.start();

    let state = HttpState {
        expander: TargetExpander::new(Arc::new(inventory)),
        queue,
        hub: hub.clone(),
    };

    let listener = TcpListener::bind(config.http_addr)
        .await
        .with_context(|| format!("failed to bind http listener on {}", config.http_addr))?;

    tokio::select! {
        result = run_http_server(listener, state) => result?,
        _ = tokio::signal::ctrl_c() => info!("shutdown signal received"),
    }

    hub.shutdown();
    worker.shutdown().await?;
    Ok(())
}
