//! # LAN Agent Engine
//!
//! Runs inside the private network and does the actual work: executes
//! `http-request` frames against their targets and services CONNECT
//! tunnels by opening TCP sockets (directly or through a configured
//! tunnel-proxy) and pumping bytes both ways.
//!
//! Each tunnel's data channel is registered *before* the target socket
//! exists, so bytes arriving from the proxy while the connect is still
//! in flight are buffered instead of lost.

use std::collections::HashMap;
use std::sync::Arc;

use rwp_protocol::{
    decode_base64, encode_base64, sanitize_headers, Frame, HeaderList, HttpRequestPayload, Role,
};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::connect::{self, BoxedIo, ProxyConnectError};
use crate::options::ClientOptions;
use crate::transport::{self, Transport, TransportEvent};

#[derive(Debug, Clone)]
pub struct LanOptions {
    pub client: ClientOptions,
    /// When set, every tunnel target is reached by issuing CONNECT
    /// against this proxy instead of dialing directly.
    pub tunnel_proxy: Option<Url>,
}

/// Commands for a tunnel's writer task.
enum TunnelCmd {
    Data(Vec<u8>),
    /// Half-close: shut down the write side, keep reading.
    Shutdown,
}

struct TunnelHandle {
    data_tx: mpsc::UnboundedSender<TunnelCmd>,
    tasks: Vec<JoinHandle<()>>,
}

impl TunnelHandle {
    fn abort(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

type TunnelMap = Arc<RwLock<HashMap<String, TunnelHandle>>>;

/// Connects to the relay and serves frames until the process stops.
pub async fn run(options: LanOptions) {
    let (transport, mut events) = transport::spawn(Role::Lan, options.client.clone());
    let fetch = build_fetch_client(options.client.insecure);
    let tunnels: TunnelMap = Arc::new(RwLock::new(HashMap::new()));

    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Connected => info!("connected to relay"),
            TransportEvent::Disconnected => {
                warn!("disconnected from relay");
                let mut map = tunnels.write().await;
                for (id, handle) in map.drain() {
                    debug!(%id, "tunnel dropped on disconnect");
                    handle.abort();
                }
            }
            TransportEvent::Frame(frame) => {
                handle_frame(frame, &transport, &fetch, &tunnels, &options).await;
            }
        }
    }
}

async fn handle_frame(
    frame: Frame,
    transport: &Transport,
    fetch: &reqwest::Client,
    tunnels: &TunnelMap,
    options: &LanOptions,
) {
    match frame {
        Frame::HttpRequest { id, request } => {
            tokio::spawn(execute_request(fetch.clone(), transport.clone(), id, request));
        }
        Frame::ConnectStart { id, host, port } => {
            // Register the data channel first; inbound bytes buffer here
            // while the target connect is still in flight.
            let (data_tx, data_rx) = mpsc::unbounded_channel();
            tunnels.write().await.insert(
                id.clone(),
                TunnelHandle {
                    data_tx,
                    tasks: Vec::new(),
                },
            );
            let task = tokio::spawn(open_tunnel(
                transport.clone(),
                tunnels.clone(),
                options.tunnel_proxy.clone(),
                options.client.insecure,
                id.clone(),
                host,
                port,
                data_rx,
            ));
            if let Some(handle) = tunnels.write().await.get_mut(&id) {
                handle.tasks.push(task);
            } else {
                task.abort();
            }
        }
        Frame::ConnectData { id, data_base64 } => match decode_base64(&data_base64) {
            Ok(data) => {
                if let Some(handle) = tunnels.read().await.get(&id) {
                    let _ = handle.data_tx.send(TunnelCmd::Data(data));
                }
            }
            Err(err) => warn!(%id, %err, "dropping undecodable tunnel data"),
        },
        Frame::ConnectEnd { id } => {
            if let Some(handle) = tunnels.read().await.get(&id) {
                let _ = handle.data_tx.send(TunnelCmd::Shutdown);
            }
        }
        Frame::ConnectError { id, message } => {
            debug!(%id, %message, "tunnel aborted by peer");
            if let Some(handle) = tunnels.write().await.remove(&id) {
                handle.abort();
            }
        }
        Frame::HelloAck { session, .. } => debug!(%session, "registration acknowledged"),
        Frame::Error { message } => warn!(%message, "relay error"),
        other => debug!(?other, "ignoring unexpected frame"),
    }
}

// ─── HTTP execution ─────────────────────────────────────────────

fn build_fetch_client(insecure: bool) -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .danger_accept_invalid_certs(insecure)
        .no_proxy()
        .build()
        .unwrap_or_else(|err| {
            warn!(%err, "falling back to a default HTTP client");
            reqwest::Client::new()
        })
}

async fn execute_request(
    client: reqwest::Client,
    transport: Transport,
    id: String,
    request: HttpRequestPayload,
) {
    debug!(%id, method = %request.method, url = %request.url, "executing request");
    let frame = match perform_request(&client, request).await {
        Ok((status, headers, body)) => Frame::HttpResponse {
            id,
            status: Some(status),
            headers: Some(headers),
            body_base64: Some(encode_base64(&body)),
            error: None,
        },
        Err(err) => {
            warn!(%err, "request failed");
            Frame::http_error_response(id, err)
        }
    };
    transport.send(frame);
}

async fn perform_request(
    client: &reqwest::Client,
    request: HttpRequestPayload,
) -> Result<(u16, HeaderList, bytes::Bytes), String> {
    let method = reqwest::Method::from_bytes(request.method.as_bytes())
        .map_err(|_| format!("invalid method {:?}", request.method))?;
    let body = decode_base64(&request.body_base64).map_err(|err| err.to_string())?;

    let mut builder = client.request(method, &request.url);
    for (name, value) in sanitize_headers(&request.headers) {
        // reqwest derives these from the URL and the body
        if name.eq_ignore_ascii_case("host") || name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        builder = builder.header(name, value);
    }
    if !body.is_empty() {
        builder = builder.body(body);
    }

    let response = builder.send().await.map_err(|err| err.to_string())?;
    let status = response.status().as_u16();
    let raw: HeaderList = response
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();
    let headers = sanitize_headers(&raw);
    let body = response.bytes().await.map_err(|err| err.to_string())?;
    Ok((status, headers, body))
}

// ─── TCP tunneling ──────────────────────────────────────────────

async fn dial_target(
    tunnel_proxy: Option<&Url>,
    host: &str,
    port: u16,
    insecure: bool,
) -> Result<BoxedIo, ProxyConnectError> {
    match tunnel_proxy {
        Some(proxy) => connect::via_proxy(proxy, host, port, insecure).await,
        None => Ok(Box::new(TcpStream::connect((host, port)).await?)),
    }
}

#[allow(clippy::too_many_arguments)]
async fn open_tunnel(
    transport: Transport,
    tunnels: TunnelMap,
    tunnel_proxy: Option<Url>,
    insecure: bool,
    id: String,
    host: String,
    port: u16,
    data_rx: mpsc::UnboundedReceiver<TunnelCmd>,
) {
    let stream = match dial_target(tunnel_proxy.as_ref(), &host, port, insecure).await {
        Ok(stream) => stream,
        Err(err) => {
            warn!(%id, %host, %port, %err, "tunnel open failed");
            tunnels.write().await.remove(&id);
            transport.send(Frame::ConnectError {
                id,
                message: err.to_string(),
            });
            return;
        }
    };
    info!(%id, %host, %port, "tunnel open");
    transport.send(Frame::ConnectAck { id: id.clone() });

    let (mut read_half, write_half) = tokio::io::split(stream);
    let writer = tokio::spawn(tunnel_writer(write_half, data_rx));
    match tunnels.write().await.get_mut(&id) {
        Some(handle) => handle.tasks.push(writer),
        None => {
            // The tunnel was torn down while we were connecting.
            writer.abort();
            return;
        }
    }

    // Target → relay. EOF and errors are terminal and release the entry.
    let mut buf = vec![0u8; 8192];
    let terminal = loop {
        match read_half.read(&mut buf).await {
            Ok(0) => break Frame::ConnectEnd { id: id.clone() },
            Ok(n) => transport.send(Frame::ConnectData {
                id: id.clone(),
                data_base64: encode_base64(&buf[..n]),
            }),
            Err(err) => {
                break Frame::ConnectError {
                    id: id.clone(),
                    message: err.to_string(),
                }
            }
        }
    };
    transport.send(terminal);
    if let Some(handle) = tunnels.write().await.remove(&id) {
        handle.abort();
    }
}

/// Relay → target. A `Shutdown` half-closes the socket and ends the task;
/// the read direction stays alive until the target hangs up.
async fn tunnel_writer(
    mut write_half: impl AsyncWrite + Unpin,
    mut data_rx: mpsc::UnboundedReceiver<TunnelCmd>,
) {
    while let Some(cmd) = data_rx.recv().await {
        match cmd {
            TunnelCmd::Data(bytes) => {
                if write_half.write_all(&bytes).await.is_err() {
                    break;
                }
            }
            TunnelCmd::Shutdown => {
                let _ = write_half.shutdown().await;
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tunnel_writer_writes_then_half_closes() {
        let (mut near, far) = tokio::io::duplex(1024);
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(tunnel_writer(far, rx));

        tx.send(TunnelCmd::Data(b"hello ".to_vec())).unwrap();
        tx.send(TunnelCmd::Data(b"world".to_vec())).unwrap();
        tx.send(TunnelCmd::Shutdown).unwrap();

        let mut received = Vec::new();
        near.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"hello world");
        task.await.unwrap();
    }

    #[tokio::test]
    async fn tunnel_writer_stops_on_dropped_channel() {
        let (_near, far) = tokio::io::duplex(1024);
        let (tx, rx) = mpsc::unbounded_channel::<TunnelCmd>();
        let task = tokio::spawn(tunnel_writer(far, rx));
        drop(tx);
        task.await.unwrap();
    }
}
