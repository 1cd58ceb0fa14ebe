//! Persistent-socket transport: one long-lived WebSocket per role.
//!
//! Each session dials the relay (optionally tunneling through the
//! server-reach proxy, optionally under TLS), sends `hello` as its first
//! frame, and pumps the outbox and the inbound stream until either side
//! drops. The caller decides what a dead session means — retry, or (for
//! `auto`) switch to the HTTP fallback when the socket never opened.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rwp_protocol::{Frame, PROTOCOL_VERSION, Role};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::connect::{self, BoxedIo};
use crate::options::ClientOptions;
use crate::tls;
use crate::transport::{EventSink, Outbox};

use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

/// How long the relay gets to answer `hello`.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, thiserror::Error)]
pub(crate) enum TransportError {
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Options(#[from] crate::options::OptionsError),
    #[error("{0}")]
    Proxy(#[from] connect::ProxyConnectError),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("handshake failed: {0}")]
    Handshake(String),
}

/// Why one socket session ended.
pub(crate) enum SessionEnd {
    /// The outbox closed: the owning engine is gone, stop entirely.
    Finished,
    /// Connect, upgrade or handshake failed — the socket never opened.
    NeverOpened(TransportError),
    /// The socket opened (hello-ack seen) and dropped later.
    Dropped,
}

/// Runs one connect-handshake-pump cycle.
pub(crate) async fn run_session(
    role: Role,
    options: &ClientOptions,
    outbox: &mut Outbox,
    events: &EventSink,
) -> SessionEnd {
    let stream = match dial(options).await {
        Ok(stream) => stream,
        Err(err) => return SessionEnd::NeverOpened(err),
    };
    let (socket, _response) =
        match tokio_tungstenite::client_async(options.ws_url().as_str(), stream).await {
            Ok(upgraded) => upgraded,
            Err(err) => return SessionEnd::NeverOpened(err.into()),
        };
    let (mut sink, mut reader) = socket.split();

    // `hello` is always the first frame on the wire.
    let hello = Frame::Hello {
        role,
        session: options.session.clone(),
        protocol_version: Some(PROTOCOL_VERSION),
    };
    if let Err(err) = send_frame(&mut sink, &hello).await {
        return SessionEnd::NeverOpened(err);
    }

    // Wait for `hello-ack`. The relay may flush a queued backlog right
    // behind it, so stray frames are buffered, not dropped.
    let mut early = Vec::new();
    match await_hello_ack(&mut reader, &mut early).await {
        Ok(()) => {}
        Err(err) => return SessionEnd::NeverOpened(err),
    }

    debug!(%role, session = %options.session, "relay socket open");
    events.connected();
    for frame in early {
        events.frame(frame);
    }

    let end = pump(&mut sink, &mut reader, outbox, events).await;
    events.disconnected();
    end
}

type WsSink = futures::stream::SplitSink<WebSocketStream<BoxedIo>, Message>;
type WsReader = futures::stream::SplitStream<WebSocketStream<BoxedIo>>;

/// Establishes the raw stream to the relay: direct or proxied TCP, then
/// TLS when the relay URL is `wss`.
async fn dial(options: &ClientOptions) -> Result<BoxedIo, TransportError> {
    let host = options.server_host()?;
    let port = options.server_port();

    let stream: BoxedIo = match &options.proxy {
        Some(proxy) => connect::via_proxy(proxy, &host, port, options.insecure).await?,
        None => Box::new(TcpStream::connect((host.as_str(), port)).await?),
    };

    Ok(if options.server_tls() {
        Box::new(tls::wrap(stream, &host, options.insecure).await?)
    } else {
        stream
    })
}

async fn await_hello_ack(
    reader: &mut WsReader,
    early: &mut Vec<Frame>,
) -> Result<(), TransportError> {
    loop {
        let message = match timeout(HANDSHAKE_TIMEOUT, reader.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(err))) => return Err(err.into()),
            Ok(None) => {
                return Err(TransportError::Handshake(
                    "socket closed before hello-ack".to_string(),
                ))
            }
            Err(_) => return Err(TransportError::Handshake("hello-ack timed out".to_string())),
        };
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => {
                return Err(TransportError::Handshake(
                    "socket closed before hello-ack".to_string(),
                ))
            }
            _ => continue,
        };
        match serde_json::from_str::<Frame>(text.as_str()) {
            Ok(Frame::HelloAck { .. }) => return Ok(()),
            Ok(Frame::Error { message }) => return Err(TransportError::Handshake(message)),
            Ok(frame) => early.push(frame),
            Err(err) => debug!(%err, "skipping malformed frame during handshake"),
        }
    }
}

/// The main loop: outbox frames go out, relay frames become events.
async fn pump(
    sink: &mut WsSink,
    reader: &mut WsReader,
    outbox: &mut Outbox,
    events: &EventSink,
) -> SessionEnd {
    loop {
        tokio::select! {
            inbound = reader.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<Frame>(text.as_str()) {
                        Ok(frame) => events.frame(frame),
                        Err(err) => warn!(%err, "dropping malformed frame"),
                    }
                }
                Some(Ok(Message::Close(_))) | None => return SessionEnd::Dropped,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(%err, "socket read error");
                    return SessionEnd::Dropped;
                }
            },
            outbound = outbox.next() => match outbound {
                Some(frame) => {
                    if let Err(returned) = send_frame_or_return(sink, frame).await {
                        outbox.push_front(returned);
                        return SessionEnd::Dropped;
                    }
                }
                None => return SessionEnd::Finished,
            },
        }
    }
}

async fn send_frame(sink: &mut WsSink, frame: &Frame) -> Result<(), TransportError> {
    let text = serde_json::to_string(frame)
        .map_err(|err| TransportError::Handshake(format!("cannot serialize frame: {err}")))?;
    sink.send(Message::Text(text.into())).await?;
    Ok(())
}

/// Sends one frame; on failure hands it back so it can return to the
/// outbox.
async fn send_frame_or_return(sink: &mut WsSink, frame: Frame) -> Result<(), Frame> {
    match send_frame(sink, &frame).await {
        Ok(()) => Ok(()),
        Err(err) => {
            debug!(%err, "socket write failed");
            Err(frame)
        }
    }
}
