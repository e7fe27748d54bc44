//! collab-relay: WebSocket relay server for collaborative documents.
//!
//! Hosts rooms keyed by document id. Each room holds the authoritative CRDT
//! replica and the live presence set; connected clients exchange updates,
//! snapshots, and ephemeral presence through it.

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use collab_core::PeerId;
use collab_relay::CollabServer;

#[derive(Parser, Debug)]
#[command(name = "collab-relay")]
#[command(about = "Document collaboration relay server")]
struct Args {
    /// Address to listen on for incoming connections
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    listen: String,

    /// Server peer ID as 16 hex digits (generated if not provided)
    #[arg(long)]
    peer_id: Option<String>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,collab_relay=debug"
    } else {
        "info,collab_relay=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting collab-relay");
    info!("Listen address: {}", args.listen);

    let peer = match args.peer_id {
        Some(raw) => raw.parse::<PeerId>()?,
        None => {
            let id = PeerId::generate();
            info!("Generated peer ID: {}", id);
            id
        }
    };

    let server = CollabServer::new(peer);
    let listener = CollabServer::bind(&args.listen).await?;

    info!("Relay running. Press Ctrl+C to stop.");

    tokio::select! {
        _ = server.run(listener) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    info!("Shutting down");
    Ok(())
}
