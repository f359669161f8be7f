//! Slate relay — reference server for whiteboard sessions.
//!
//! Serves the WebSocket push stream and, unless disabled, the HTTP
//! snapshot/event API used by polling replicas. Log output follows
//! `RUST_LOG` (e.g. `RUST_LOG=slate_collab=debug`).

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{error, info};
use slate_collab::{RelayServer, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "slate-relay")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// WebSocket stream address
    #[arg(long, default_value = "127.0.0.1:9090")]
    ws_addr: String,

    /// HTTP API address
    #[arg(long, default_value = "127.0.0.1:9091")]
    http_addr: String,

    /// Serve the stream only
    #[arg(long)]
    no_http: bool,

    /// Maximum stream members per session
    #[arg(long, default_value_t = 100)]
    max_peers: usize,

    /// Buffered frames per session before slow members start lagging
    #[arg(long, default_value_t = 256)]
    capacity: usize,

    /// Seconds between stats lines, 0 to disable
    #[arg(long, default_value_t = 60)]
    stats_interval: u64,
}

impl Args {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.ws_addr.clone(),
            http_addr: (!self.no_http).then(|| self.http_addr.clone()),
            max_peers_per_session: self.max_peers,
            broadcast_capacity: self.capacity.max(1),
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let args = Args::parse();

    let server = Arc::new(RelayServer::new(args.server_config()));
    info!(
        "Starting Slate relay: stream {}, http {}",
        server.bind_addr(),
        server.http_addr().unwrap_or("disabled")
    );

    if args.stats_interval > 0 {
        let server = server.clone();
        let period = Duration::from_secs(args.stats_interval);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let stats = server.stats().await;
                info!(
                    "connections {}/{} messages {} bytes {} rejected {} sessions {}",
                    stats.active_connections,
                    stats.total_connections,
                    stats.total_messages,
                    stats.total_bytes,
                    stats.rejected_events,
                    server.hub().active_sessions().await
                );
            }
        });
    }

    if let Err(e) = server.run().await {
        error!("Relay stopped: {e}");
        std::process::exit(1);
    }
}
