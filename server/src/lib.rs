//! # Relay Server
//!
//! The public rendezvous point between a **LAN agent** (inside the private
//! network) and a **local proxy** (next to the browser). Each session name
//! pairs one connection per role; the relay routes frames between the two
//! and tracks outstanding request/tunnel ids so it can fail them cleanly
//! when either side disconnects.
//!
//! ```text
//! browser ──► local proxy ──WS/NDJSON──► Relay ──WS/NDJSON──► LAN agent ──► target
//! ```
//!
//! ## Modules
//!
//! - [`state`]    — session registry and per-role channels
//! - [`routing`]  — the frame routing state machine and disconnect cleanup
//! - [`handlers`] — WebSocket upgrade, handshake and heartbeat
//! - [`api`]      — HTTP surface: health, NDJSON stream, send endpoint

pub mod api;
pub mod handlers;
pub mod routing;
pub mod state;

use std::io;

use tower_http::cors::CorsLayer;
use tracing::info;

use crate::state::AppState;

/// Relay listen configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Where non-API requests are redirected; plain 404 when unset.
    pub homepage: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            homepage: None,
        }
    }
}

/// Builds the full relay router over the given state.
pub fn router(state: AppState) -> axum::Router {
    api::router(state).layer(CorsLayer::permissive())
}

/// Binds and serves the relay until the process is stopped.
pub async fn run(config: ServerConfig) -> io::Result<()> {
    let state = AppState::new(config.homepage.clone());
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("relay listening on {}", addr);

    axum::serve(listener, app).await
}
