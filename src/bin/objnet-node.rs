//! objnet-node — in-memory object node served over TCP, for manual testing.
//!
//! Usage:
//!   objnet-node [--bind 127.0.0.1:7070] [--epoch N] [--frame-size BYTES]

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use objnet_core::memory::{MemoryNode, DEFAULT_FRAME_SIZE};

#[derive(Parser)]
#[command(name = "objnet-node")]
#[command(about = "In-memory objnet node (state is lost on exit)", long_about = None)]
struct Args {
    #[arg(long, default_value = "127.0.0.1:7070")]
    bind: String,

    /// Current epoch; session tokens must cover it
    #[arg(long, default_value_t = 0)]
    epoch: u64,

    /// Payload bytes per download frame
    #[arg(long, default_value_t = DEFAULT_FRAME_SIZE)]
    frame_size: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let listener = TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("can't bind {}", args.bind))?;
    let node = MemoryNode::with_frame_size(args.epoch, args.frame_size);
    info!(bind = %args.bind, epoch = args.epoch, "node starting");

    tokio::select! {
        res = objnet_core::net::serve(listener, Arc::new(node)) => res.context("node stopped")?,
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }
    Ok(())
}
