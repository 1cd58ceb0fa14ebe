//! # WebSocket Handlers
//!
//! The persistent-socket transport: upgrading HTTP connections, running
//! the `hello` handshake, pumping frames between the socket and the
//! session channel, and enforcing the ping/pong heartbeat. Disconnects —
//! graceful, errored, missed-heartbeat, or displacement by a newer
//! `hello` — all funnel into the same routing cleanup.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use bytes::Bytes;
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use rwp_protocol::Frame;
use tokio::sync::{mpsc, Notify};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::routing;
use crate::state::{AppState, SocketHandle};

/// Ping cadence; a socket that produces no pong for a full interval after
/// a ping is terminated. The only liveness check the relay performs.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// How long a fresh connection may idle before its `hello` arrives.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// `GET /ws` — upgrades to the persistent-socket transport.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

/// Full lifecycle of one WebSocket connection: handshake, install into
/// the session channel, frame pump, cleanup.
async fn handle_connection(socket: WebSocket, state: AppState) {
    let conn_id = Uuid::new_v4();
    let (mut sink, mut stream) = socket.split();

    // ── Handshake ──
    // The first text frame must be a valid `hello`; anything else gets an
    // `error` frame and the connection is dropped before it touches any
    // session state.
    let first = match timeout(HANDSHAKE_TIMEOUT, read_text(&mut stream)).await {
        Ok(Some(text)) => text,
        _ => return,
    };
    let hello = match serde_json::from_str::<Frame>(&first) {
        Ok(frame) => frame,
        Err(err) => {
            let message = format!("malformed hello: {err}");
            send_frame(&mut sink, &Frame::Error { message }).await;
            return;
        }
    };
    let (role, session_name) = match routing::check_hello(&hello) {
        Ok(pair) => pair,
        Err(message) => {
            warn!(%conn_id, %message, "handshake rejected");
            send_frame(&mut sink, &Frame::Error { message }).await;
            return;
        }
    };
    info!(%conn_id, %role, session = %session_name, "socket registered");

    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    let replaced = Arc::new(Notify::new());
    let session = state.session(&session_name);
    {
        let mut session = session.lock().await;
        session.install_socket(
            role,
            SocketHandle {
                conn_id,
                tx: tx.clone(),
                replaced: replaced.clone(),
            },
            routing::hello_ack(role, &session_name),
        );
    }

    // ── Frame pump ──
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await; // the first tick fires immediately
    let mut alive = true;
    let mut close_reason: Option<&str> = None;

    loop {
        tokio::select! {
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<Frame>(text.as_str()) {
                        Ok(frame) => {
                            let reply = {
                                let mut session = session.lock().await;
                                routing::route_frame(&mut session, role, frame)
                            };
                            if let Some(reply) = reply {
                                let _ = tx.send(reply);
                            }
                        }
                        Err(err) => {
                            let _ = tx.send(Frame::Error {
                                message: format!("malformed frame: {err}"),
                            });
                        }
                    }
                }
                Some(Ok(Message::Pong(_))) => alive = true,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(%conn_id, %err, "socket read error");
                    break;
                }
            },
            outbound = rx.recv() => match outbound {
                Some(frame) => {
                    if !send_frame(&mut sink, &frame).await {
                        break;
                    }
                }
                None => break,
            },
            _ = replaced.notified() => {
                close_reason = Some("replaced");
                break;
            }
            _ = heartbeat.tick() => {
                if !alive {
                    debug!(%conn_id, "heartbeat missed; terminating");
                    break;
                }
                alive = false;
                if sink.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    if let Some(reason) = close_reason {
        let _ = sink
            .send(Message::Close(Some(CloseFrame {
                code: 1000,
                reason: reason.into(),
            })))
            .await;
    }

    // ── Cleanup ──
    {
        let mut session = session.lock().await;
        routing::on_socket_closed(&mut session, role, conn_id);
    }
    info!(%conn_id, %role, session = %session_name, "socket closed");
}

/// Reads the next text payload, skipping control frames.
async fn read_text(stream: &mut SplitStream<WebSocket>) -> Option<String> {
    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => return Some(text.as_str().to_string()),
            Message::Close(_) => return None,
            _ => {}
        }
    }
    None
}

/// Serializes and sends one frame; `false` means the socket is gone.
async fn send_frame(sink: &mut SplitSink<WebSocket, Message>, frame: &Frame) -> bool {
    let text = match serde_json::to_string(frame) {
        Ok(text) => text,
        Err(err) => {
            error!(%err, "failed to serialize frame");
            return true;
        }
    };
    sink.send(Message::Text(text.into())).await.is_ok()
}
