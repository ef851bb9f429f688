//! grip-proxy: a WebSocket reverse proxy speaking the grip control protocol.
//!
//! # Architecture Overview
//!
//! ```text
//!                     ┌──────────────────────────────────────────────────┐
//!                     │                   GRIP PROXY                     │
//!   Client upgrade    │  ┌────────┐   ┌───────────┐   ┌──────────────┐   │
//!   ──────────────────┼─▶│  http  │──▶│  session  │──▶│  transport   │───┼──▶ Backend
//!                     │  │ server │   │  (per     │   │  upstream    │   │
//!   ◀─────────────────┼──│        │◀──│  client)  │◀──│              │◀──┼───
//!                     │  └────────┘   └─────┬─────┘   └──────────────┘   │
//!                     │                     │ grip                       │
//!                     │               ┌─────▼─────┐                      │
//!                     │               │ grip hub  │──▶ broker outbox     │
//!                     │               └───────────┘                      │
//!                     │  config · routing · security · observability     │
//!                     └──────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use grip_proxy::config::{self, watcher::ConfigWatcher, ProxyConfig};
use grip_proxy::grip::control::ControlManager;
use grip_proxy::grip::hub::{ControlHub, PacketKind};
use grip_proxy::http::server::apply_route_updates;
use grip_proxy::lifecycle::shutdown::drain_sessions;
use grip_proxy::lifecycle::signals::spawn_signal_handler;
use grip_proxy::net::listener;
use grip_proxy::observability::{logging, metrics};
use grip_proxy::{HttpServer, Shutdown};

/// Time given to live sessions after the listener stops.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "grip-proxy")]
#[command(about = "WebSocket reverse proxy with grip control channel support", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Reload routes when the configuration file changes.
    #[arg(short, long, requires = "config")]
    watch: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => ProxyConfig::default(),
    };

    logging::init_logging(&config.observability.log_level);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "grip-proxy starting");
    tracing::info!(
        bind_address = %config.listener.bind_address,
        max_connections = config.listener.max_connections,
        routes = config.routes.len(),
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let control: Option<Arc<dyn ControlManager>> = if config.control.enabled {
        let (hub, mut packets) = ControlHub::new();
        tracing::info!("Control hub enabled without a broker link; pushes and detaches are not delivered");
        tokio::spawn(async move {
            while let Some(packet) = packets.recv().await {
                match packet.kind {
                    PacketKind::Here => tracing::debug!(cid = %packet.cid, "Control session here"),
                    PacketKind::Grip(message) => tracing::debug!(
                        cid = %packet.cid,
                        message = %String::from_utf8_lossy(&message),
                        "Grip message"
                    ),
                    PacketKind::Gone => tracing::debug!(cid = %packet.cid, "Control session gone"),
                }
            }
        });
        Some(Arc::new(hub))
    } else {
        None
    };

    let listener = listener::bind(&config.listener).await?;
    let server = HttpServer::new(&config, control)?;
    let tracker = server.tracker();

    // Keep the watcher alive for the life of the server.
    let _watcher = match (&cli.config, cli.watch) {
        (Some(path), true) => {
            let (watcher, updates) = ConfigWatcher::new(path);
            let handle = watcher.run()?;
            tokio::spawn(apply_route_updates(server.routes(), updates));
            Some(handle)
        }
        _ => None,
    };

    let shutdown = Shutdown::new();
    spawn_signal_handler(&shutdown);

    server.run(listener, shutdown.signalled()).await?;
    drain_sessions(&tracker, SHUTDOWN_GRACE).await;

    tracing::info!("Shutdown complete");
    Ok(())
}
