//! # Frame Routing
//!
//! The relay's core state machine. Frames from each role are
//! demultiplexed by source: the proxy originates requests and tunnels
//! (recording `id → origin` so replies can find their way back), the LAN
//! side answers them. The relay never parses request bodies or tunnel
//! payloads and never mints ids; it only records, forwards and — on
//! disconnect — synthesizes the terminal frames the surviving side needs.
//!
//! Routing maps ids to *roles*, not sockets: forwarding always re-reads
//! the target channel's current socket, so a reconnect never leaves a
//! reply pointed at a dead connection.

use rwp_protocol::{Frame, Role, PROTOCOL_VERSION};
use tracing::{debug, info};
use uuid::Uuid;

use crate::state::SessionState;

/// Validates a `hello` frame, returning its `(role, session)` on success
/// or the message for the `error` frame to answer with.
pub fn check_hello(frame: &Frame) -> Result<(Role, String), String> {
    match frame {
        Frame::Hello {
            role,
            session,
            protocol_version,
        } => {
            if session.is_empty() {
                return Err("hello is missing a session name".to_string());
            }
            if let Some(version) = protocol_version {
                if *version != PROTOCOL_VERSION {
                    return Err(format!(
                        "protocol version mismatch: client {version}, server {PROTOCOL_VERSION}"
                    ));
                }
            }
            Ok((*role, session.clone()))
        }
        other => Err(format!(
            "expected a hello frame, got {:?}",
            frame_name(other)
        )),
    }
}

/// The `hello-ack` answering a successful registration.
pub fn hello_ack(role: Role, session: &str) -> Frame {
    Frame::HelloAck {
        role,
        session: session.to_string(),
        protocol_version: PROTOCOL_VERSION,
    }
}

/// Routes one post-handshake frame from `from`. Returns a direct reply
/// (always an `error` frame) when the frame could not be routed; the
/// caller delivers it to the sender.
pub fn route_frame(session: &mut SessionState, from: Role, frame: Frame) -> Option<Frame> {
    match from {
        Role::Proxy => match &frame {
            Frame::HttpRequest { id, .. } => {
                session.requests.insert(id.clone(), from);
                session.respond(Role::Lan, frame);
                None
            }
            Frame::ConnectStart { id, host, port } => {
                debug!(%id, %host, %port, "tunnel requested");
                session.tunnels.insert(id.clone(), from);
                session.respond(Role::Lan, frame);
                None
            }
            Frame::ConnectData { .. } | Frame::ConnectEnd { .. } => {
                session.respond(Role::Lan, frame);
                None
            }
            _ => Some(unroutable(from, &frame)),
        },
        Role::Lan => match &frame {
            Frame::HttpResponse { id, .. } => {
                // Deliver only to the recorded originator; a response for
                // an id the relay no longer tracks is dropped.
                if session.requests.remove(id) == Some(Role::Proxy) {
                    session.respond(Role::Proxy, frame);
                }
                None
            }
            Frame::ConnectAck { id } | Frame::ConnectData { id, .. } => {
                if let Some(origin) = session.tunnels.get(id).copied() {
                    session.respond(origin, frame);
                }
                None
            }
            Frame::ConnectError { id, .. } | Frame::ConnectEnd { id } => {
                if let Some(origin) = session.tunnels.remove(id) {
                    session.respond(origin, frame);
                }
                None
            }
            _ => Some(unroutable(from, &frame)),
        },
    }
}

/// Cleanup when the socket `conn_id` for `role` drops. A no-op if a newer
/// socket has already taken over the `(session, role)` slot.
pub fn on_socket_closed(session: &mut SessionState, role: Role, conn_id: Uuid) {
    match &session.channel(role).socket {
        Some(current) if current.conn_id == conn_id => {}
        _ => return,
    }
    session.channel_mut(role).socket = None;

    match role {
        Role::Lan => {
            // Everything the proxy is still waiting on gets a terminal
            // frame immediately; the maps are emptied in the same step.
            let requests = std::mem::take(&mut session.requests);
            for (id, origin) in requests {
                if origin == Role::Proxy {
                    session.respond(
                        Role::Proxy,
                        Frame::http_error_response(id, "LAN disconnected"),
                    );
                }
            }
            let tunnels = std::mem::take(&mut session.tunnels);
            for (id, origin) in tunnels {
                if origin == Role::Proxy {
                    session.respond(
                        Role::Proxy,
                        Frame::ConnectError {
                            id,
                            message: "LAN disconnected".to_string(),
                        },
                    );
                }
            }
            info!("LAN socket closed; outstanding work failed over to proxy");
        }
        Role::Proxy => {
            // The proxy can no longer receive responses; tell the LAN
            // agent to release the target sockets of its tunnels.
            session.requests.retain(|_, origin| *origin != Role::Proxy);
            let tunnels = std::mem::take(&mut session.tunnels);
            for (id, origin) in tunnels {
                if origin == Role::Proxy {
                    session.respond(Role::Lan, Frame::ConnectEnd { id });
                }
            }
            info!("proxy socket closed; tunnels ended toward LAN");
        }
    }
}

/// Handles one frame arriving on the `POST /api/send` endpoint, where
/// `hello` registers the long-poll channel and every reply travels back
/// through the sender's own channel instead of a socket.
pub fn handle_send_frame(session: &mut SessionState, from: Role, frame: Frame) {
    if matches!(frame, Frame::Hello { .. }) {
        let reply = match check_hello(&frame) {
            Ok((role, name)) => hello_ack(role, &name),
            Err(message) => Frame::Error { message },
        };
        session.respond(from, reply);
        return;
    }
    if let Some(reply) = route_frame(session, from, frame) {
        session.respond(from, reply);
    }
}

fn unroutable(from: Role, frame: &Frame) -> Frame {
    Frame::Error {
        message: format!("cannot route {:?} frame from {from}", frame_name(frame)),
    }
}

fn frame_name(frame: &Frame) -> &'static str {
    match frame {
        Frame::Hello { .. } => "hello",
        Frame::HelloAck { .. } => "hello-ack",
        Frame::HttpRequest { .. } => "http-request",
        Frame::HttpResponse { .. } => "http-response",
        Frame::ConnectStart { .. } => "connect-start",
        Frame::ConnectAck { .. } => "connect-ack",
        Frame::ConnectError { .. } => "connect-error",
        Frame::ConnectData { .. } => "connect-data",
        Frame::ConnectEnd { .. } => "connect-end",
        Frame::Error { .. } => "error",
    }
}
