//! End-to-end relay tests over real sockets: a relay bound to an
//! ephemeral port, driven through the long-poll HTTP surface and the
//! WebSocket transport.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, Stream, StreamExt};
use rwp_protocol::{Frame, HttpRequestPayload, Role, PROTOCOL_VERSION};
use rwp_server::state::AppState;
use serde_json::json;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

const WAIT: Duration = Duration::from_secs(5);

async fn start_relay() -> SocketAddr {
    let app = rwp_server::router(AppState::new(None));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn hello(role: Role) -> Frame {
    Frame::Hello {
        role,
        session: "itest".into(),
        protocol_version: Some(PROTOCOL_VERSION),
    }
}

async fn post_send(addr: SocketAddr, role: Role, frame: &Frame) {
    let client = reqwest::Client::new();
    let status = client
        .post(format!("http://{addr}/api/send/itest?role={role}"))
        .json(&json!({ "role": role, "message": frame }))
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status, 200);
}

async fn open_stream(
    addr: SocketAddr,
    role: Role,
) -> impl Stream<Item = reqwest::Result<Bytes>> + Unpin {
    let response = reqwest::Client::new()
        .get(format!("http://{addr}/api/stream/itest?role={role}"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "application/x-ndjson"
    );
    response.bytes_stream()
}

async fn next_frame(
    stream: &mut (impl Stream<Item = reqwest::Result<Bytes>> + Unpin),
    buf: &mut Vec<u8>,
) -> Frame {
    loop {
        if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buf.drain(..=pos).collect();
            return serde_json::from_slice(&line[..line.len() - 1]).unwrap();
        }
        let chunk = timeout(WAIT, stream.next())
            .await
            .expect("stream produced no line in time")
            .expect("stream ended")
            .unwrap();
        buf.extend_from_slice(&chunk);
    }
}

async fn ws_connect(
    addr: SocketAddr,
) -> tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>> {
    let (socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .unwrap();
    socket
}

async fn ws_send(
    socket: &mut tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    frame: &Frame,
) {
    socket
        .send(Message::Text(serde_json::to_string(frame).unwrap().into()))
        .await
        .unwrap();
}

async fn ws_next_frame(
    socket: &mut tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
) -> Frame {
    loop {
        let message = timeout(WAIT, socket.next())
            .await
            .expect("no frame in time")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = message {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

#[tokio::test]
async fn health_endpoint() {
    let addr = start_relay().await;
    let response = reqwest::get(format!("http://{addr}/health")).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "ok");
}

#[tokio::test]
async fn unknown_api_path_is_404_and_other_paths_404_without_homepage() {
    let addr = start_relay().await;
    assert_eq!(
        reqwest::get(format!("http://{addr}/api/nope")).await.unwrap().status(),
        404
    );
    assert_eq!(
        reqwest::get(format!("http://{addr}/somewhere")).await.unwrap().status(),
        404
    );
}

#[tokio::test]
async fn stream_rejects_invalid_role() {
    let addr = start_relay().await;
    let response = reqwest::get(format!("http://{addr}/api/stream/itest?role=controller"))
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn long_poll_round_trip() {
    let addr = start_relay().await;

    // Proxy registers over the send endpoint and gets its ack on the stream.
    post_send(addr, Role::Proxy, &hello(Role::Proxy)).await;
    let mut proxy_stream = open_stream(addr, Role::Proxy).await;
    let mut proxy_buf = Vec::new();
    assert_eq!(
        next_frame(&mut proxy_stream, &mut proxy_buf).await,
        Frame::HelloAck {
            role: Role::Proxy,
            session: "itest".into(),
            protocol_version: PROTOCOL_VERSION,
        }
    );

    // A request posted while the LAN side is absent is queued, then
    // drained when the LAN stream attaches.
    let request = Frame::HttpRequest {
        id: "r1".into(),
        request: HttpRequestPayload {
            method: "GET".into(),
            url: "http://example.test/x".into(),
            headers: vec![("host".into(), "example.test".into())],
            body_base64: String::new(),
        },
    };
    post_send(addr, Role::Proxy, &request).await;

    let mut lan_stream = open_stream(addr, Role::Lan).await;
    let mut lan_buf = Vec::new();
    assert_eq!(next_frame(&mut lan_stream, &mut lan_buf).await, request);

    // The LAN answer comes back on the proxy stream.
    let response = Frame::HttpResponse {
        id: "r1".into(),
        status: Some(200),
        headers: Some(vec![("content-type".into(), "text/plain".into())]),
        body_base64: Some("aGk=".into()),
        error: None,
    };
    post_send(addr, Role::Lan, &response).await;
    assert_eq!(next_frame(&mut proxy_stream, &mut proxy_buf).await, response);
}

#[tokio::test]
async fn ws_handshake_and_replace() {
    let addr = start_relay().await;

    let mut first = ws_connect(addr).await;
    ws_send(&mut first, &hello(Role::Lan)).await;
    assert!(matches!(ws_next_frame(&mut first).await, Frame::HelloAck { role: Role::Lan, .. }));

    // A second hello for the same (session, role) displaces the first
    // socket, which is closed with a "replaced" reason.
    let mut second = ws_connect(addr).await;
    ws_send(&mut second, &hello(Role::Lan)).await;
    assert!(matches!(ws_next_frame(&mut second).await, Frame::HelloAck { role: Role::Lan, .. }));

    let closed = loop {
        match timeout(WAIT, first.next()).await.expect("no close in time") {
            Some(Ok(Message::Close(frame))) => break frame,
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => break None,
        }
    };
    if let Some(frame) = closed {
        assert_eq!(frame.reason.as_str(), "replaced");
    }
}

#[tokio::test]
async fn ws_rejects_version_mismatch() {
    let addr = start_relay().await;
    let mut socket = ws_connect(addr).await;
    ws_send(
        &mut socket,
        &Frame::Hello {
            role: Role::Lan,
            session: "itest".into(),
            protocol_version: Some(PROTOCOL_VERSION + 1),
        },
    )
    .await;
    match ws_next_frame(&mut socket).await {
        Frame::Error { message } => assert!(message.contains("version")),
        other => panic!("expected error frame, got {other:?}"),
    }
}

#[tokio::test]
async fn lan_ws_disconnect_fails_pending_request_to_proxy_stream() {
    let addr = start_relay().await;

    let mut lan = ws_connect(addr).await;
    ws_send(&mut lan, &hello(Role::Lan)).await;
    assert!(matches!(ws_next_frame(&mut lan).await, Frame::HelloAck { .. }));

    post_send(addr, Role::Proxy, &hello(Role::Proxy)).await;
    let mut proxy_stream = open_stream(addr, Role::Proxy).await;
    let mut proxy_buf = Vec::new();
    assert!(matches!(
        next_frame(&mut proxy_stream, &mut proxy_buf).await,
        Frame::HelloAck { .. }
    ));

    let request = Frame::HttpRequest {
        id: "r9".into(),
        request: HttpRequestPayload {
            method: "GET".into(),
            url: "http://example.test/".into(),
            headers: vec![],
            body_base64: String::new(),
        },
    };
    post_send(addr, Role::Proxy, &request).await;
    assert_eq!(ws_next_frame(&mut lan).await, request);

    // The LAN socket drops with the request still outstanding.
    lan.close(None).await.unwrap();

    match next_frame(&mut proxy_stream, &mut proxy_buf).await {
        Frame::HttpResponse { id, error, .. } => {
            assert_eq!(id, "r9");
            assert_eq!(error.as_deref(), Some("LAN disconnected"));
        }
        other => panic!("expected synthesized http-response, got {other:?}"),
    }
}
