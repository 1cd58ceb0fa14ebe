//! # Local Proxy Engine
//!
//! Terminates HTTP/1.1 from a browser (absolute-form requests and
//! CONNECT), frames each request with a fresh UUID, and splices the
//! answer or the raw tunnel byte stream back onto the client socket.
//!
//! Plain requests are fully buffered, sent as one `http-request`, and
//! answered exactly once: the real response, a `502` carrying the
//! upstream error, or a `504` when the 30 s timer fires first. CONNECT
//! sockets queue any bytes the client sends ahead of the tunnel ack —
//! the request-head leftover first, then arrival order — and flush them
//! as `connect-data` the moment the ack lands.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use rwp_protocol::{
    decode_base64, encode_base64, sanitize_headers, Frame, HeaderList, HttpRequestPayload, Role,
};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::options::ClientOptions;
use crate::transport::{self, EventRx, Transport, TransportEvent};

#[derive(Debug, Clone)]
pub struct ProxyOptions {
    pub client: ClientOptions,
    pub listen_host: String,
    pub listen_port: u16,
}

/// One answer per request, whichever comes first wins the race with the
/// timer.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Request heads larger than this are rejected outright.
const MAX_HEAD_BYTES: usize = 64 * 1024;

/// A decoded `http-response`, or the local failure standing in for one.
struct PendingResponse {
    status: Option<u16>,
    headers: HeaderList,
    body: Vec<u8>,
    error: Option<String>,
}

impl PendingResponse {
    fn error(message: impl Into<String>) -> Self {
        Self {
            status: None,
            headers: Vec::new(),
            body: Vec::new(),
            error: Some(message.into()),
        }
    }
}

/// What the event dispatcher feeds a CONNECT socket's task.
enum TunnelMsg {
    Ack,
    Data(Vec<u8>),
    /// Peer half-closed; stop writing, keep reading.
    End,
    /// Terminal failure: tunnel aborted, or the transport itself is gone.
    /// A tunnel that never saw its ack answers with the one-shot `502`.
    Error(String),
}

type PendingMap = Arc<RwLock<HashMap<String, oneshot::Sender<PendingResponse>>>>;
type TunnelMap = Arc<RwLock<HashMap<String, mpsc::UnboundedSender<TunnelMsg>>>>;

/// Binds the proxy listener and serves browser connections until the
/// process stops.
pub async fn run(options: ProxyOptions) -> io::Result<()> {
    let (transport, events) = transport::spawn(Role::Proxy, options.client.clone());
    let pending: PendingMap = Arc::new(RwLock::new(HashMap::new()));
    let tunnels: TunnelMap = Arc::new(RwLock::new(HashMap::new()));
    tokio::spawn(dispatch_events(events, pending.clone(), tunnels.clone()));

    let listener =
        TcpListener::bind((options.listen_host.as_str(), options.listen_port)).await?;
    info!(
        "HTTP proxy listening on {}:{}",
        options.listen_host, options.listen_port
    );

    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                let transport = transport.clone();
                let pending = pending.clone();
                let tunnels = tunnels.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_client(socket, transport, pending, tunnels).await {
                        debug!(%peer, %err, "client connection error");
                    }
                });
            }
            Err(err) => warn!(%err, "accept failed"),
        }
    }
}

// ─── Event dispatch ─────────────────────────────────────────────

/// Routes transport events to the pending request and tunnel that own
/// them. A response for an unknown id — typically one that already timed
/// out — is discarded silently.
async fn dispatch_events(mut events: EventRx, pending: PendingMap, tunnels: TunnelMap) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Connected => info!("connected to relay"),
            TransportEvent::Disconnected => {
                warn!("disconnected from relay");
                let dropped: Vec<_> = pending.write().await.drain().collect();
                for (_, reply) in dropped {
                    let _ = reply.send(PendingResponse::error("Server connection closed"));
                }
                let ended: Vec<_> = tunnels.write().await.drain().collect();
                for (_, tunnel) in ended {
                    let _ = tunnel.send(TunnelMsg::Error("Server connection closed".to_string()));
                }
            }
            TransportEvent::Frame(frame) => dispatch_frame(frame, &pending, &tunnels).await,
        }
    }
}

async fn dispatch_frame(frame: Frame, pending: &PendingMap, tunnels: &TunnelMap) {
    match frame {
        Frame::HttpResponse {
            id,
            status,
            headers,
            body_base64,
            error,
        } => {
            let Some(reply) = pending.write().await.remove(&id) else {
                debug!(%id, "late or unknown response discarded");
                return;
            };
            let response = match body_base64.as_deref().map(decode_base64).transpose() {
                Ok(body) => PendingResponse {
                    status,
                    headers: headers.unwrap_or_default(),
                    body: body.unwrap_or_default(),
                    error,
                },
                Err(err) => PendingResponse::error(format!("undecodable response body: {err}")),
            };
            let _ = reply.send(response);
        }
        Frame::ConnectAck { id } => {
            if let Some(tunnel) = tunnels.read().await.get(&id) {
                let _ = tunnel.send(TunnelMsg::Ack);
            }
        }
        Frame::ConnectData { id, data_base64 } => match decode_base64(&data_base64) {
            Ok(data) => {
                if let Some(tunnel) = tunnels.read().await.get(&id) {
                    let _ = tunnel.send(TunnelMsg::Data(data));
                }
            }
            Err(err) => warn!(%id, %err, "dropping undecodable tunnel data"),
        },
        Frame::ConnectEnd { id } => {
            if let Some(tunnel) = tunnels.read().await.get(&id) {
                let _ = tunnel.send(TunnelMsg::End);
            }
        }
        Frame::ConnectError { id, message } => {
            if let Some(tunnel) = tunnels.write().await.remove(&id) {
                let _ = tunnel.send(TunnelMsg::Error(message));
            }
        }
        Frame::HelloAck { session, .. } => debug!(%session, "registration acknowledged"),
        Frame::Error { message } => warn!(%message, "relay error"),
        other => debug!(?other, "ignoring unexpected frame"),
    }
}

// ─── Request-head parsing ───────────────────────────────────────

#[derive(Debug, PartialEq)]
pub(crate) struct RequestHead {
    pub method: String,
    pub target: String,
    pub headers: HeaderList,
}

/// Reads the request line and headers. `None` means the client went away
/// before sending anything.
pub(crate) async fn read_request_head<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> io::Result<Option<RequestHead>> {
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    let mut total = line.len();

    let request_line = line.trim_end();
    let mut parts = request_line.split_whitespace();
    let (method, target) = match (parts.next(), parts.next()) {
        (Some(method), Some(target)) => (method.to_string(), target.to_string()),
        _ => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("malformed request line: {request_line:?}"),
            ))
        }
    };

    let mut headers = Vec::new();
    loop {
        let mut header_line = String::new();
        let read = reader.read_line(&mut header_line).await?;
        if read == 0 {
            break;
        }
        total += read;
        if total > MAX_HEAD_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "request head too large",
            ));
        }
        let trimmed = header_line.trim_end();
        if trimmed.is_empty() {
            break;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Ok(Some(RequestHead {
        method,
        target,
        headers,
    }))
}

fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(header, _)| header.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

// ─── Connection handling ────────────────────────────────────────

async fn handle_client(
    socket: TcpStream,
    transport: Transport,
    pending: PendingMap,
    tunnels: TunnelMap,
) -> io::Result<()> {
    let mut reader = BufReader::new(socket);
    let Some(head) = read_request_head(&mut reader).await? else {
        return Ok(());
    };

    if head.method.eq_ignore_ascii_case("CONNECT") {
        handle_connect(reader, head, transport, tunnels).await
    } else {
        handle_http(reader, head, transport, pending).await
    }
}

/// Absolute-form (or path-only) request: buffer, frame, await the one
/// answer, close.
async fn handle_http(
    mut stream: BufReader<TcpStream>,
    head: RequestHead,
    transport: Transport,
    pending: PendingMap,
) -> io::Result<()> {
    let content_length = header_value(&head.headers, "content-length")
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = vec![0u8; content_length];
    if content_length > 0 {
        stream.read_exact(&mut body).await?;
    }

    let url = if head.target.starts_with("http://") || head.target.starts_with("https://") {
        head.target.clone()
    } else if head.target.starts_with('/') {
        // Some clients probe the proxy with a bare path; synthesize an
        // origin from the Host header.
        match header_value(&head.headers, "host") {
            Some(host) => format!("http://{}{}", host, head.target),
            None => {
                write_simple_response(&mut stream, 400, "Bad Request", "missing Host header")
                    .await?;
                return stream.shutdown().await;
            }
        }
    } else {
        write_simple_response(&mut stream, 400, "Bad Request", "unsupported request target")
            .await?;
        return stream.shutdown().await;
    };

    let id = Uuid::new_v4().to_string();
    debug!(%id, method = %head.method, %url, "forwarding request");
    let (reply_tx, reply_rx) = oneshot::channel();
    pending.write().await.insert(id.clone(), reply_tx);
    transport.send(Frame::HttpRequest {
        id: id.clone(),
        request: HttpRequestPayload {
            method: head.method.clone(),
            url,
            headers: sanitize_headers(&head.headers),
            body_base64: encode_base64(&body),
        },
    });

    match timeout(REQUEST_TIMEOUT, reply_rx).await {
        Ok(Ok(response)) => {
            if let Some(error) = &response.error {
                write_simple_response(&mut stream, 502, "Bad Gateway", error).await?;
            } else {
                write_response(&mut stream, &response).await?;
            }
        }
        Ok(Err(_)) => {
            write_simple_response(&mut stream, 502, "Bad Gateway", "Server connection closed")
                .await?;
        }
        Err(_) => {
            // Whatever arrives for this id from now on is discarded.
            pending.write().await.remove(&id);
            write_simple_response(&mut stream, 504, "Gateway Timeout", "Gateway Timeout").await?;
        }
    }
    stream.shutdown().await
}

/// CONNECT: hand the socket to a tunnel task keyed by a fresh id.
async fn handle_connect(
    mut reader: BufReader<TcpStream>,
    head: RequestHead,
    transport: Transport,
    tunnels: TunnelMap,
) -> io::Result<()> {
    if !transport.is_connected() {
        write_simple_response(&mut reader, 503, "Service Unavailable", "Service Unavailable")
            .await?;
        return reader.shutdown().await;
    }

    let Some((host, port)) = parse_authority(&head.target) else {
        write_simple_response(&mut reader, 400, "Bad Request", "invalid CONNECT target").await?;
        return reader.shutdown().await;
    };

    // Bytes the client pipelined behind the CONNECT head are already in
    // the buffer; they flush ahead of everything else once the ack lands.
    let head_bytes = reader.buffer().to_vec();
    let socket = reader.into_inner();

    let id = Uuid::new_v4().to_string();
    debug!(%id, %host, %port, "tunnel requested");
    let (msg_tx, msg_rx) = mpsc::unbounded_channel();
    tunnels.write().await.insert(id.clone(), msg_tx);
    transport.send(Frame::ConnectStart {
        id: id.clone(),
        host,
        port,
    });

    run_tunnel(socket, id.clone(), head_bytes, transport, msg_rx).await;
    tunnels.write().await.remove(&id);
    Ok(())
}

fn parse_authority(target: &str) -> Option<(String, u16)> {
    let (host, port) = target.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port))
}

/// Pumps one CONNECT socket against its tunnel until either side ends.
///
/// Until the ack, client bytes pile into the pre-ack queue. The ack
/// writes `200 Connection Established`, then flushes `head` followed by
/// the queue, in arrival order. A tunnel error before the ack turns into
/// the one-shot `502`; after the ack the socket just closes.
async fn run_tunnel<S: AsyncRead + AsyncWrite + Unpin>(
    socket: S,
    id: String,
    head: Vec<u8>,
    transport: Transport,
    mut msgs: mpsc::UnboundedReceiver<TunnelMsg>,
) {
    let (mut read_half, mut write_half) = tokio::io::split(socket);
    let mut head = head;
    let mut pre_ack: Vec<Vec<u8>> = Vec::new();
    let mut acked = false;
    let mut buf = vec![0u8; 8192];

    loop {
        tokio::select! {
            read = read_half.read(&mut buf) => match read {
                Ok(0) | Err(_) => {
                    transport.send(Frame::ConnectEnd { id: id.clone() });
                    break;
                }
                Ok(n) => {
                    let chunk = buf[..n].to_vec();
                    if acked {
                        transport.send(Frame::ConnectData {
                            id: id.clone(),
                            data_base64: encode_base64(&chunk),
                        });
                    } else {
                        pre_ack.push(chunk);
                    }
                }
            },
            msg = msgs.recv() => match msg {
                None => break,
                Some(TunnelMsg::Ack) => {
                    if acked {
                        continue;
                    }
                    if write_half
                        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                        .await
                        .is_err()
                    {
                        transport.send(Frame::ConnectEnd { id: id.clone() });
                        break;
                    }
                    acked = true;
                    let head_bytes = std::mem::take(&mut head);
                    if !head_bytes.is_empty() {
                        transport.send(Frame::ConnectData {
                            id: id.clone(),
                            data_base64: encode_base64(&head_bytes),
                        });
                    }
                    for chunk in pre_ack.drain(..) {
                        transport.send(Frame::ConnectData {
                            id: id.clone(),
                            data_base64: encode_base64(&chunk),
                        });
                    }
                }
                Some(TunnelMsg::Data(bytes)) => {
                    if write_half.write_all(&bytes).await.is_err() {
                        transport.send(Frame::ConnectEnd { id: id.clone() });
                        break;
                    }
                }
                Some(TunnelMsg::End) => {
                    let _ = write_half.shutdown().await;
                }
                Some(TunnelMsg::Error(message)) => {
                    if !acked {
                        let _ = write_simple_response(
                            &mut write_half,
                            502,
                            "Bad Gateway",
                            &message,
                        )
                        .await;
                    }
                    break;
                }
            },
        }
    }
}

// ─── Response writing ───────────────────────────────────────────

async fn write_response<W: AsyncWrite + Unpin>(
    stream: &mut W,
    response: &PendingResponse,
) -> io::Result<()> {
    let status = response.status.unwrap_or(502);
    let reason = reqwest::StatusCode::from_u16(status)
        .ok()
        .and_then(|code| code.canonical_reason())
        .unwrap_or("");

    let mut head = format!("HTTP/1.1 {status} {reason}\r\n");
    for (name, value) in &response.headers {
        // the body arrives fully decoded; length and connection handling
        // are this proxy's to set
        if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("connection") {
            continue;
        }
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str(&format!("content-length: {}\r\n", response.body.len()));
    head.push_str("connection: close\r\n\r\n");

    stream.write_all(head.as_bytes()).await?;
    stream.write_all(&response.body).await?;
    stream.flush().await
}

async fn write_simple_response<W: AsyncWrite + Unpin>(
    stream: &mut W,
    status: u16,
    reason: &str,
    body: &str,
) -> io::Result<()> {
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\ncontent-type: text/plain\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(raw: &[(&str, &str)]) -> HeaderList {
        raw.iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn parses_absolute_form_head() {
        let raw = b"GET http://example.test/x HTTP/1.1\r\nHost: example.test\r\nAccept: */*\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);
        let head = read_request_head(&mut reader).await.unwrap().unwrap();
        assert_eq!(
            head,
            RequestHead {
                method: "GET".into(),
                target: "http://example.test/x".into(),
                headers: pairs(&[("Host", "example.test"), ("Accept", "*/*")]),
            }
        );
    }

    #[tokio::test]
    async fn parses_connect_head_and_leaves_early_bytes_buffered() {
        let raw = b"CONNECT example.test:443 HTTP/1.1\r\nHost: example.test:443\r\n\r\nABCDE";
        let mut reader = BufReader::new(&raw[..]);
        let head = read_request_head(&mut reader).await.unwrap().unwrap();
        assert_eq!(head.method, "CONNECT");
        assert_eq!(head.target, "example.test:443");
        assert_eq!(reader.buffer(), b"ABCDE");
    }

    #[tokio::test]
    async fn eof_before_request_is_none() {
        let mut reader = BufReader::new(&b""[..]);
        assert!(read_request_head(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn malformed_request_line_is_an_error() {
        let mut reader = BufReader::new(&b"NONSENSE\r\n\r\n"[..]);
        assert!(read_request_head(&mut reader).await.is_err());
    }

    #[test]
    fn authority_parsing() {
        assert_eq!(
            parse_authority("example.test:443"),
            Some(("example.test".into(), 443))
        );
        assert_eq!(parse_authority("[::1]:8080"), Some(("::1".into(), 8080)));
        assert_eq!(parse_authority("example.test"), None);
        assert_eq!(parse_authority("example.test:notaport"), None);
        assert_eq!(parse_authority(":443"), None);
    }

    fn data_frame(id: &str, bytes: &[u8]) -> Frame {
        Frame::ConnectData {
            id: id.into(),
            data_base64: encode_base64(bytes),
        }
    }

    #[tokio::test]
    async fn tunnel_flushes_head_then_pre_ack_queue_in_order() {
        let (mut client, socket) = tokio::io::duplex(64 * 1024);
        let (transport, mut outbox) = Transport::new();
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let tunnel = tokio::spawn(run_tunnel(
            socket,
            "t1".into(),
            b"HEAD!".to_vec(),
            transport,
            msg_rx,
        ));

        // Bytes sent before the ack queue up.
        client.write_all(b"ABCDE").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        msg_tx.send(TunnelMsg::Ack).unwrap();

        // The client sees the 200 line.
        let mut established = vec![0u8; b"HTTP/1.1 200 Connection Established\r\n\r\n".len()];
        client.read_exact(&mut established).await.unwrap();
        assert!(established.starts_with(b"HTTP/1.1 200"));

        // Head bytes flush first, then the queued client bytes.
        assert_eq!(outbox.recv().await.unwrap(), data_frame("t1", b"HEAD!"));
        assert_eq!(outbox.recv().await.unwrap(), data_frame("t1", b"ABCDE"));

        // Post-ack bytes flow straight through.
        client.write_all(b"FGHIJKL").await.unwrap();
        assert_eq!(outbox.recv().await.unwrap(), data_frame("t1", b"FGHIJKL"));

        // Inbound data reaches the client verbatim.
        msg_tx.send(TunnelMsg::Data(b"pong".to_vec())).unwrap();
        let mut pong = [0u8; 4];
        client.read_exact(&mut pong).await.unwrap();
        assert_eq!(&pong, b"pong");

        // Client EOF ends the tunnel.
        drop(client);
        assert_eq!(
            outbox.recv().await.unwrap(),
            Frame::ConnectEnd { id: "t1".into() }
        );
        tunnel.await.unwrap();
    }

    #[tokio::test]
    async fn tunnel_error_before_ack_writes_single_502() {
        let (mut client, socket) = tokio::io::duplex(1024);
        let (transport, _outbox) = Transport::new();
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let tunnel = tokio::spawn(run_tunnel(socket, "t2".into(), Vec::new(), transport, msg_rx));

        msg_tx
            .send(TunnelMsg::Error("LAN disconnected".into()))
            .unwrap();
        tunnel.await.unwrap();

        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
        assert!(response.ends_with("LAN disconnected"));
        assert_eq!(response.matches("HTTP/1.1").count(), 1);
    }

    #[tokio::test]
    async fn transport_disconnect_before_ack_writes_single_502() {
        let (mut client, socket) = tokio::io::duplex(1024);
        let (transport, _outbox) = Transport::new();
        let pending: PendingMap = Arc::new(RwLock::new(HashMap::new()));
        let tunnels: TunnelMap = Arc::new(RwLock::new(HashMap::new()));

        let (reply_tx, reply_rx) = oneshot::channel();
        pending.write().await.insert("r1".into(), reply_tx);
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        tunnels.write().await.insert("t5".into(), msg_tx);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch_events(event_rx, pending.clone(), tunnels.clone()));
        let tunnel = tokio::spawn(run_tunnel(socket, "t5".into(), Vec::new(), transport, msg_rx));

        event_tx.send(TransportEvent::Disconnected).unwrap();

        // The un-acked CONNECT gets the one-shot 502, never a bare close.
        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
        assert!(response.ends_with("Server connection closed"));
        assert_eq!(response.matches("HTTP/1.1").count(), 1);
        tunnel.await.unwrap();

        // The pending HTTP request fails the same way.
        let failed = reply_rx.await.unwrap();
        assert_eq!(failed.error.as_deref(), Some("Server connection closed"));
        assert!(pending.read().await.is_empty());
        assert!(tunnels.read().await.is_empty());
    }

    #[tokio::test]
    async fn tunnel_error_after_ack_closes_without_status() {
        let (mut client, socket) = tokio::io::duplex(1024);
        let (transport, _outbox) = Transport::new();
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let tunnel = tokio::spawn(run_tunnel(socket, "t3".into(), Vec::new(), transport, msg_rx));

        msg_tx.send(TunnelMsg::Ack).unwrap();
        let mut established = vec![0u8; b"HTTP/1.1 200 Connection Established\r\n\r\n".len()];
        client.read_exact(&mut established).await.unwrap();

        msg_tx.send(TunnelMsg::Error("target reset".into())).unwrap();
        tunnel.await.unwrap();

        // Nothing but EOF after the 200: never two status lines.
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn tunnel_end_half_closes_but_keeps_reading() {
        let (mut client, socket) = tokio::io::duplex(1024);
        let (transport, mut outbox) = Transport::new();
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let tunnel = tokio::spawn(run_tunnel(socket, "t4".into(), Vec::new(), transport, msg_rx));

        msg_tx.send(TunnelMsg::Ack).unwrap();
        let mut established = vec![0u8; b"HTTP/1.1 200 Connection Established\r\n\r\n".len()];
        client.read_exact(&mut established).await.unwrap();

        msg_tx.send(TunnelMsg::End).unwrap();

        // The write side is closed toward the client...
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        // ...while client bytes still flow out as frames.
        client.write_all(b"late").await.unwrap();
        assert_eq!(outbox.recv().await.unwrap(), data_frame("t4", b"late"));

        drop(client);
        assert_eq!(
            outbox.recv().await.unwrap(),
            Frame::ConnectEnd { id: "t4".into() }
        );
        tunnel.await.unwrap();
    }

    #[tokio::test]
    async fn header_lookup_is_case_insensitive() {
        let headers = pairs(&[("Host", "example.test"), ("Content-Length", "5")]);
        assert_eq!(header_value(&headers, "host"), Some("example.test"));
        assert_eq!(header_value(&headers, "content-length"), Some("5"));
        assert_eq!(header_value(&headers, "accept"), None);
    }
}
