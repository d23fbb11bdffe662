//! ssemux Server
//!
//! Serves stream sessions over HTTP as server-sent events.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tracing::info;

use ssemux_core::SessionRegistry;
use ssemux_core::config::{Config, load_config};
use ssemux_core::tracing_init::{default_filter, init_tracing};
use ssemux_server::routes::{AppState, build_router};

#[derive(Parser, Debug)]
#[command(name = "ssemux-server")]
#[command(version, about = "ssemux server - multiplexed server-sent event streams")]
struct Args {
    /// Path to a JSON config file (merged over the global one).
    #[arg(long, env = "SSEMUX_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on.
    #[arg(long)]
    addr: Option<SocketAddr>,

    /// Unread writes buffered per session.
    #[arg(long)]
    channel_capacity: Option<usize>,

    /// Heartbeat interval in seconds (0 disables).
    #[arg(long)]
    heartbeat_secs: Option<u64>,

    /// Evict unattached sessions idle this many seconds (0 disables).
    #[arg(long)]
    idle_timeout_secs: Option<u64>,

    /// Log level for ssemux crates when `RUST_LOG` is not set.
    #[arg(long)]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long)]
    log_json: bool,
}

impl Args {
    /// CLI flags take precedence over every other config source.
    fn apply(&self, config: &mut Config) {
        if let Some(addr) = self.addr {
            config.server.addr = addr;
        }
        if let Some(n) = self.channel_capacity {
            config.session.channel_capacity = n;
        }
        if let Some(n) = self.heartbeat_secs {
            config.session.heartbeat_interval_secs = n;
        }
        if let Some(n) = self.idle_timeout_secs {
            config.session.idle_timeout_secs = n;
        }
        if let Some(level) = &self.log_level {
            config.server.log_level.clone_from(level);
        }
        if self.log_json {
            config.server.log_json = true;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate()?;

    init_tracing(
        &default_filter("ssemux_server", &config.server.log_level),
        config.server.log_json,
    );

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.server.addr,
        channel_capacity = config.session.channel_capacity,
        heartbeat_secs = config.session.heartbeat_interval_secs,
        idle_timeout_secs = config.session.idle_timeout_secs,
        "Starting ssemux-server"
    );

    let registry = SessionRegistry::new(config.session.clone());
    let state = AppState::new(registry.clone());
    let shutdown = state.shutdown.clone();
    let sweeper = registry.spawn_sweeper(shutdown.child_token());

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(config.server.addr).await?;
    info!(addr = %config.server.addr, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            info!("Received shutdown signal");
            // Open SSE bodies only end once their sessions are closed.
            shutdown.cancel();
            registry.shutdown().await;
        })
        .await?;

    let _ = sweeper.await;
    info!("Server stopped");
    Ok(())
}
