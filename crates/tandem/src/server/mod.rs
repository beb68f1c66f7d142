//! Relay server: axum HTTP + WebSocket.
//!
//! - `WS /relay` — relayed channel endpoint (see [`crate::relay::protocol`])
//! - `GET /health` — liveness probe target
//! - `GET /ice-servers?user=<id>` — TURN REST credentials
//! - `GET /api/status` — server status

pub mod hub;
pub mod turn;
pub mod ws;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

pub use hub::{Hub, HubStats, UserDetail};
pub use turn::TurnConfig;

/// Relay server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// Shared bearer token. When unset any non-empty token is accepted.
    pub auth_token: Option<String>,
    /// `None` disables `/ice-servers`
    pub turn: Option<TurnConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            auth_token: None,
            turn: None,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let bind = match var("TANDEM_BIND") {
            Some(s) => s
                .parse()
                .with_context(|| format!("TANDEM_BIND is not a socket address: {s}"))?,
            None => Self::default().bind,
        };

        let ttl = var("TANDEM_TURN_TTL")
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(86_400));

        let turn = var("TANDEM_TURN_SECRET").map(|secret| TurnConfig {
            secret,
            urls: var("TANDEM_TURN_URLS")
                .map(|s| {
                    s.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            ttl,
        });

        Ok(Self {
            bind,
            auth_token: var("TANDEM_AUTH_TOKEN"),
            turn,
        })
    }
}

/// Shared state for the HTTP handlers
struct ServerState {
    hub: Hub,
    config: ServerConfig,
    start_time: Instant,
}

/// Build the axum router around `hub`
pub fn router(hub: Hub, config: ServerConfig) -> Router {
    let state = Arc::new(ServerState {
        hub,
        config,
        start_time: Instant::now(),
    });

    Router::new()
        .route("/relay", get(ws_upgrade))
        .route("/health", get(health))
        .route("/ice-servers", get(ice_servers))
        .route("/api/status", get(api_status))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve on an already bound listener until `cancel` fires
pub async fn serve(
    listener: TcpListener,
    hub: Hub,
    config: ServerConfig,
    cancel: CancellationToken,
) -> Result<()> {
    let addr = listener.local_addr()?;
    info!("Relay listening on ws://{}/relay", addr);

    axum::serve(listener, router(hub, config))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("Relay server error")?;

    Ok(())
}

/// Bind `config.bind` and serve
pub async fn start(hub: Hub, config: ServerConfig, cancel: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(config.bind)
        .await
        .context(format!("Failed to bind to {}", config.bind))?;
    serve(listener, hub, config, cancel).await
}

/// WebSocket upgrade handler
async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ServerState>>,
) -> impl IntoResponse {
    let hub = state.hub.clone();
    let auth = state.config.auth_token.clone();
    ws.on_upgrade(move |socket| ws::handle_ws(socket, hub, auth))
}

/// GET /health
async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// GET /ice-servers?user=<id>
async fn ice_servers(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(turn) = &state.config.turn else {
        return (StatusCode::NOT_FOUND, "TURN not configured").into_response();
    };
    if let Some(expected) = &state.config.auth_token {
        let bearer = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        if bearer != Some(expected.as_str()) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }
    let Some(user) = params.get("user").filter(|u| !u.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "missing user").into_response();
    };
    Json(turn.mint(user)).into_response()
}

/// GET /api/status
async fn api_status(State(state): State<Arc<ServerState>>) -> Json<serde_json::Value> {
    let stats = state.hub.stats();
    Json(serde_json::json!({
        "users": stats.users_connected,
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "frames_forwarded": stats.frames_forwarded,
        "frames_rejected": stats.frames_rejected,
        "turn": state.config.turn.is_some(),
    }))
}
