//! # HTTP Surface
//!
//! Everything the relay serves besides the WebSocket upgrade:
//!
//! - `GET /health` — liveness probe
//! - `GET /api/stream/{session}?role=` — chunked NDJSON frame stream,
//!   the receive half of the long-poll transport
//! - `POST /api/send/{session}?role=` — the send half; accepts one frame
//!   or a batch
//! - anything else — 302 to the configured homepage, or 404

use std::convert::Infallible;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get, post},
    Json, Router,
};
use bytes::Bytes;
use futures::StreamExt;
use rwp_protocol::{Frame, Role};
use serde::Deserialize;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use crate::handlers;
use crate::routing;
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(handlers::ws_handler))
        .route("/api/stream/{session}", get(stream))
        .route("/api/send/{session}", post(send))
        .route("/api/{*rest}", any(api_not_found))
        .fallback(fallback)
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Deserialize)]
struct RoleQuery {
    role: Option<String>,
}

impl RoleQuery {
    fn parse(&self) -> Option<Role> {
        self.role.as_deref().and_then(|raw| raw.parse().ok())
    }
}

/// `GET /api/stream/{session}?role=` — attaches an NDJSON stream to the
/// role's channel. Queued frames flush first; the response then stays
/// open, one JSON frame per line, until the client goes away.
async fn stream(
    Path(session): Path<String>,
    Query(query): Query<RoleQuery>,
    State(state): State<AppState>,
) -> Response {
    let Some(role) = query.parse() else {
        return (StatusCode::BAD_REQUEST, "invalid role").into_response();
    };
    debug!(%session, %role, "stream attached");

    let handle = state.session(&session);
    let rx = handle.lock().await.attach_stream(role);
    let lines =
        UnboundedReceiverStream::new(rx).map(|frame| Ok::<Bytes, Infallible>(frame_line(&frame)));

    (
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(lines),
    )
        .into_response()
}

#[derive(Deserialize)]
struct SendBody {
    #[serde(default)]
    role: Option<Role>,
    message: OneOrMany,
}

/// `message` may be a single frame or a batch.
#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(Box<Frame>),
    Many(Vec<Frame>),
}

/// `POST /api/send/{session}?role=` — routes each carried frame as if it
/// had arrived on a socket of that role. Delivery is best-effort: the
/// response is `200 {}` whenever the role was valid.
async fn send(
    Path(session): Path<String>,
    Query(query): Query<RoleQuery>,
    State(state): State<AppState>,
    Json(body): Json<SendBody>,
) -> Response {
    let Some(role) = query.parse().or(body.role) else {
        return (StatusCode::BAD_REQUEST, "invalid role").into_response();
    };

    let frames = match body.message {
        OneOrMany::One(frame) => vec![*frame],
        OneOrMany::Many(frames) => frames,
    };

    let handle = state.session(&session);
    {
        let mut session = handle.lock().await;
        for frame in frames {
            routing::handle_send_frame(&mut session, role, frame);
        }
    }

    Json(serde_json::json!({})).into_response()
}

async fn api_not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// Non-API paths redirect to the configured homepage when one is set.
async fn fallback(State(state): State<AppState>) -> Response {
    match &state.homepage {
        Some(url) => (StatusCode::FOUND, [(header::LOCATION, url.clone())]).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

fn frame_line(frame: &Frame) -> Bytes {
    let mut line = serde_json::to_vec(frame).unwrap_or_default();
    line.push(b'\n');
    Bytes::from(line)
}
