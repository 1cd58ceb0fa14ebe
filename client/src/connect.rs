//! Dialing targets through an HTTP proxy with `CONNECT`.
//!
//! Used in two places: reaching the relay itself through a server-reach
//! proxy, and — on the LAN side — reaching tunnel targets through a
//! configured tunnel-proxy. The handshake writes one `CONNECT` request,
//! buffers the response until `\r\n\r\n`, and accepts only a `200`
//! status on the first line.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use url::Url;

use crate::tls;

/// Any bidirectional byte stream the engines can own: plain TCP, TLS, or
/// TLS-over-proxy.
pub(crate) trait Io: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

pub(crate) type BoxedIo = Box<dyn Io>;

/// Proxy response heads larger than this abort the handshake.
const MAX_RESPONSE_HEAD: usize = 8 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ProxyConnectError {
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("proxy URL has no host")]
    MissingHost,
    #[error("proxy closed before completing CONNECT")]
    UnexpectedEof,
    #[error("proxy response head too large")]
    OversizedHead,
    #[error("proxy refused CONNECT: {0}")]
    Refused(String),
}

/// Opens a connection to `host:port` through `proxy` (TLS to the proxy
/// itself when its URL is `https`).
pub(crate) async fn via_proxy(
    proxy: &Url,
    host: &str,
    port: u16,
    insecure: bool,
) -> Result<BoxedIo, ProxyConnectError> {
    let proxy_host = proxy.host_str().ok_or(ProxyConnectError::MissingHost)?;
    let proxy_tls = proxy.scheme() == "https";
    let proxy_port = proxy
        .port_or_known_default()
        .unwrap_or(if proxy_tls { 443 } else { 80 });

    let tcp = TcpStream::connect((proxy_host, proxy_port)).await?;
    let mut stream: BoxedIo = if proxy_tls {
        Box::new(tls::wrap(Box::new(tcp), proxy_host, insecure).await?)
    } else {
        Box::new(tcp)
    };

    handshake(&mut stream, host, port).await?;
    Ok(stream)
}

/// Runs the `CONNECT` exchange over an already-established stream.
pub(crate) async fn handshake<S>(
    stream: &mut S,
    host: &str,
    port: u16,
) -> Result<(), ProxyConnectError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = format!(
        "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\nProxy-Connection: Keep-Alive\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await?;

    let head = read_response_head(stream).await?;
    let status_line = head.lines().next().unwrap_or("").trim().to_string();
    match parse_status(&status_line) {
        Some(200) => Ok(()),
        _ => Err(ProxyConnectError::Refused(status_line)),
    }
}

/// Reads byte-by-byte up to the blank line so nothing past the response
/// head is consumed.
async fn read_response_head<S: AsyncRead + Unpin>(
    stream: &mut S,
) -> Result<String, ProxyConnectError> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_RESPONSE_HEAD {
            return Err(ProxyConnectError::OversizedHead);
        }
        if stream.read(&mut byte).await? == 0 {
            return Err(ProxyConnectError::UnexpectedEof);
        }
        head.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&head).into_owned())
}

fn parse_status(line: &str) -> Option<u16> {
    line.split_whitespace().nth(1)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fake_proxy(
        response: &'static [u8],
    ) -> (tokio::io::DuplexStream, tokio::task::JoinHandle<String>) {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(async move {
            let mut seen = Vec::new();
            let mut byte = [0u8; 1];
            while !seen.ends_with(b"\r\n\r\n") {
                server.read_exact(&mut byte).await.unwrap();
                seen.push(byte[0]);
            }
            server.write_all(response).await.unwrap();
            String::from_utf8(seen).unwrap()
        });
        (client, task)
    }

    #[tokio::test]
    async fn accepts_200_and_sends_well_formed_connect() {
        let (mut client, task) =
            fake_proxy(b"HTTP/1.1 200 Connection established\r\n\r\n").await;
        handshake(&mut client, "example.test", 443).await.unwrap();

        let request = task.await.unwrap();
        assert!(request.starts_with("CONNECT example.test:443 HTTP/1.1\r\n"));
        assert!(request.contains("Host: example.test:443\r\n"));
        assert!(request.contains("Proxy-Connection: Keep-Alive\r\n"));
    }

    #[tokio::test]
    async fn rejects_non_200_with_status_line() {
        let (mut client, _task) =
            fake_proxy(b"HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic\r\n\r\n")
                .await;
        match handshake(&mut client, "example.test", 443).await {
            Err(ProxyConnectError::Refused(line)) => {
                assert_eq!(line, "HTTP/1.1 407 Proxy Authentication Required");
            }
            other => panic!("expected refusal, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_before_headers_is_unexpected_eof() {
        let (mut client, server) = tokio::io::duplex(1024);
        drop(server);
        match handshake(&mut client, "example.test", 443).await {
            Err(ProxyConnectError::UnexpectedEof) | Err(ProxyConnectError::Io(_)) => {}
            other => panic!("expected eof error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn does_not_consume_bytes_past_the_head() {
        let (mut client, _task) =
            fake_proxy(b"HTTP/1.1 200 Connection established\r\n\r\nEXTRA").await;
        handshake(&mut client, "example.test", 443).await.unwrap();

        let mut extra = [0u8; 5];
        client.read_exact(&mut extra).await.unwrap();
        assert_eq!(&extra, b"EXTRA");
    }
}
