//! # Client Options
//!
//! Shared configuration for both engines: which relay to dial, as which
//! session, over which transport, and through which outbound proxy.
//!
//! A relay may be given either as a bare session name plus a server URL,
//! or as a single URL carrying the session as its trailing path segment
//! (`wss://relay.example/office`). The session always canonicalizes to
//! the last non-empty, percent-decoded path segment. `http(s)` schemes
//! are interchangeable with `ws(s)`.

use std::fmt;
use std::str::FromStr;

use url::Url;

/// Which transport carries the frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportMode {
    /// Try the persistent socket once; fall back to HTTP permanently if
    /// it never reaches open.
    #[default]
    Auto,
    /// Persistent WebSocket only.
    Ws,
    /// Long-poll NDJSON only.
    Http,
}

impl FromStr for TransportMode {
    type Err = OptionsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(TransportMode::Auto),
            "ws" => Ok(TransportMode::Ws),
            "http" => Ok(TransportMode::Http),
            other => Err(OptionsError::InvalidTransport(other.to_string())),
        }
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransportMode::Auto => "auto",
            TransportMode::Ws => "ws",
            TransportMode::Http => "http",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OptionsError {
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("unsupported scheme {0:?} (expected ws, wss, http or https)")]
    UnsupportedScheme(String),
    #[error("URL has no host")]
    MissingHost,
    #[error("no session name: pass one explicitly or as the server URL's trailing path segment")]
    MissingSession,
    #[error("no server URL given")]
    MissingServer,
    #[error("invalid transport {0:?} (expected auto, ws or http)")]
    InvalidTransport(String),
}

/// Everything the transport needs to reach the relay.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Normalized relay base: `ws(s)://host[:port]/`.
    pub server: Url,
    pub session: String,
    pub transport: TransportMode,
    /// Proxy used to *reach the relay* (CONNECT for the socket transport,
    /// plain HTTP proxying for the fallback).
    pub proxy: Option<Url>,
    /// Disables certificate verification on every outbound TLS.
    pub insecure: bool,
}

impl ClientOptions {
    /// The WebSocket upgrade endpoint.
    pub fn ws_url(&self) -> Url {
        let mut url = self.server.clone();
        url.set_path("/ws");
        url
    }

    /// The relay base with an `http(s)` scheme, for the fallback
    /// transport's `/api/...` calls.
    pub fn http_base(&self) -> Url {
        let mut url = self.server.clone();
        let scheme = if self.server_tls() { "https" } else { "http" };
        // both schemes are "special", so this cannot fail
        let _ = url.set_scheme(scheme);
        url.set_path("/");
        url
    }

    pub fn server_tls(&self) -> bool {
        self.server.scheme() == "wss"
    }

    pub fn server_host(&self) -> Result<String, OptionsError> {
        self.server
            .host_str()
            .map(str::to_string)
            .ok_or(OptionsError::MissingHost)
    }

    pub fn server_port(&self) -> u16 {
        self.server
            .port_or_known_default()
            .unwrap_or(if self.server_tls() { 443 } else { 80 })
    }
}

/// Resolves the `<session-or-url> [server-url]` positional pair both
/// subcommands take into a normalized relay base and a session name.
pub fn parse_target(
    session_or_url: &str,
    server_url: Option<&str>,
) -> Result<(Url, String), OptionsError> {
    if session_or_url.contains("://") {
        let url = normalize_server_url(session_or_url)?;
        let session = last_path_segment(&url).ok_or(OptionsError::MissingSession)?;
        return Ok((strip_path(url), session));
    }
    let server = server_url.ok_or(OptionsError::MissingServer)?;
    let url = normalize_server_url(server)?;
    Ok((strip_path(url), session_or_url.to_string()))
}

/// Parses a relay URL and maps `http(s)` onto `ws(s)`.
pub fn normalize_server_url(raw: &str) -> Result<Url, OptionsError> {
    let mut url = Url::parse(raw)?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => return Err(OptionsError::UnsupportedScheme(other.to_string())),
    };
    url.set_scheme(scheme)
        .map_err(|_| OptionsError::UnsupportedScheme(url.scheme().to_string()))?;
    if url.host_str().is_none() {
        return Err(OptionsError::MissingHost);
    }
    Ok(url)
}

/// The last non-empty path segment, percent-decoded.
fn last_path_segment(url: &Url) -> Option<String> {
    let segment = url.path_segments()?.filter(|s| !s.is_empty()).next_back()?;
    Some(
        urlencoding::decode(segment)
            .map(|decoded| decoded.into_owned())
            .unwrap_or_else(|_| segment.to_string()),
    )
}

fn strip_path(mut url: Url) -> Url {
    url.set_path("/");
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_carries_session_as_trailing_segment() {
        let (server, session) = parse_target("wss://relay.example/office", None).unwrap();
        assert_eq!(server.as_str(), "wss://relay.example/");
        assert_eq!(session, "office");
    }

    #[test]
    fn last_non_empty_segment_wins() {
        let (_, session) = parse_target("ws://relay.example/a/b/c/", None).unwrap();
        assert_eq!(session, "c");
    }

    #[test]
    fn session_segments_are_percent_decoded() {
        let (_, session) = parse_target("ws://relay.example/my%20office", None).unwrap();
        assert_eq!(session, "my office");
    }

    #[test]
    fn http_schemes_map_to_ws() {
        let (server, _) = parse_target("https://relay.example/office", None).unwrap();
        assert_eq!(server.scheme(), "wss");
        let (server, _) = parse_target("http://relay.example:8080/office", None).unwrap();
        assert_eq!(server.as_str(), "ws://relay.example:8080/");
    }

    #[test]
    fn bare_session_needs_a_server() {
        let (server, session) =
            parse_target("office", Some("http://relay.example:8080")).unwrap();
        assert_eq!(server.as_str(), "ws://relay.example:8080/");
        assert_eq!(session, "office");

        assert!(matches!(
            parse_target("office", None),
            Err(OptionsError::MissingServer)
        ));
    }

    #[test]
    fn explicit_session_wins_over_server_path() {
        let (server, session) =
            parse_target("office", Some("ws://relay.example/other")).unwrap();
        assert_eq!(server.as_str(), "ws://relay.example/");
        assert_eq!(session, "office");
    }

    #[test]
    fn url_without_session_segment_is_rejected() {
        assert!(matches!(
            parse_target("wss://relay.example", None),
            Err(OptionsError::MissingSession)
        ));
    }

    #[test]
    fn derived_endpoints() {
        let (server, session) = parse_target("wss://relay.example/office", None).unwrap();
        let options = ClientOptions {
            server,
            session,
            transport: TransportMode::Auto,
            proxy: None,
            insecure: false,
        };
        assert_eq!(options.ws_url().as_str(), "wss://relay.example/ws");
        assert_eq!(options.http_base().as_str(), "https://relay.example/");
        assert_eq!(options.server_port(), 443);
        assert!(options.server_tls());
    }

    #[test]
    fn transport_mode_parsing() {
        assert_eq!("auto".parse::<TransportMode>().unwrap(), TransportMode::Auto);
        assert_eq!("ws".parse::<TransportMode>().unwrap(), TransportMode::Ws);
        assert_eq!("http".parse::<TransportMode>().unwrap(), TransportMode::Http);
        assert!("quic".parse::<TransportMode>().is_err());
    }
}
