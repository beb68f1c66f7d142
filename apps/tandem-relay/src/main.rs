//! Tandem Relay — signaling hub for the relayed channel
//!
//! Serves the WebSocket relay, the liveness endpoint probed by clients and,
//! when a shared secret is configured, TURN REST credentials.
//!
//! ## Usage
//!
//! ```bash
//! # Listen on 0.0.0.0:8080
//! tandem-relay
//!
//! # Custom bind address, shared client token and TURN
//! TANDEM_BIND=127.0.0.1:9000 \
//! TANDEM_AUTH_TOKEN=letmein \
//! TANDEM_TURN_SECRET=s3cret TANDEM_TURN_URLS=turn:turn.example.org:3478 \
//! tandem-relay
//! ```

use anyhow::Result;
use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use tandem::server::{Hub, ServerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let config = ServerConfig::from_env()?;

    info!("Tandem Relay starting");
    info!("  Bind: {}", config.bind);
    info!(
        "  Auth: {}",
        if config.auth_token.is_some() { "shared token" } else { "any token" }
    );
    match &config.turn {
        Some(turn) => info!("  TURN: {} url(s), ttl {:?}", turn.urls.len(), turn.ttl),
        None => info!("  TURN: disabled (set TANDEM_TURN_SECRET to enable)"),
    }

    let hub = Hub::new();
    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();

    let server_hub = hub.clone();
    let server_cancel = cancel.clone();
    tracker.spawn(async move {
        if let Err(e) = tandem::server::start(server_hub, config, server_cancel.clone()).await {
            error!("Relay server error: {}", e);
            server_cancel.cancel();
        }
    });
    tracker.close();

    let mut stats_interval = interval(Duration::from_secs(30));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                cancel.cancel();
                break;
            }
            _ = cancel.cancelled() => break,
            _ = stats_interval.tick() => {
                let stats = hub.stats();
                info!(
                    "Stats: {} users, {} forwarded, {} rejected",
                    stats.users_connected, stats.frames_forwarded, stats.frames_rejected
                );
            }
        }
    }

    if tokio::time::timeout(Duration::from_secs(5), tracker.wait())
        .await
        .is_err()
    {
        warn!("Shutdown timed out after 5s");
    }
    Ok(())
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
