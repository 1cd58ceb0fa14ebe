//! # Protocol Frames
//!
//! All messages exchanged between the relay server, the LAN agent and the
//! local proxy. Each frame is one JSON object with a `"type"` field whose
//! value is the kebab-case variant name; payload fields use camelCase on
//! the wire. For example, `Frame::ConnectStart` serializes to
//! `{"type": "connect-start", "id": "...", "host": "...", "port": 443}`.
//!
//! Binary payloads (`bodyBase64` / `dataBase64`) are base64-encoded
//! strings so every frame stays valid UTF-8 text.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::headers::HeaderList;

/// The protocol revision both sides must agree on. A `hello` carrying a
/// different version is rejected with an `error` frame before any routing
/// happens.
pub const PROTOCOL_VERSION: u32 = 1;

/// The two client roles a connection can register as.
///
/// The relay keeps one channel per `(session, role)` pair and forwards
/// frames from each role to its counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Runs inside the private network; executes HTTP requests and opens
    /// TCP sockets toward the real targets.
    Lan,
    /// Runs next to the browser; terminates HTTP/1.1 proxy traffic and
    /// originates every request and tunnel id.
    Proxy,
}

impl Role {
    /// The role frames from this role are routed to.
    pub fn counterpart(self) -> Role {
        match self {
            Role::Lan => Role::Proxy,
            Role::Proxy => Role::Lan,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Lan => "lan",
            Role::Proxy => "proxy",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid role: {0:?} (expected \"lan\" or \"proxy\")")]
pub struct RoleParseError(pub String);

impl FromStr for Role {
    type Err = RoleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lan" => Ok(Role::Lan),
            "proxy" => Ok(Role::Proxy),
            other => Err(RoleParseError(other.to_string())),
        }
    }
}

/// The HTTP request carried inside an `http-request` frame.
///
/// Headers travel as an ordered list of `[name, value]` pairs so
/// multi-value headers survive the relay verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequestPayload {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: HeaderList,
    #[serde(default)]
    pub body_base64: String,
}

/// All frames in the relay protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum Frame {
    // ── Registration ──────────────────────────────────────────────
    /// First frame a client sends: identifies its role and session.
    Hello {
        role: Role,
        session: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        protocol_version: Option<u32>,
    },

    /// Relay's acknowledgment that the registration was accepted.
    HelloAck {
        role: Role,
        session: String,
        protocol_version: u32,
    },

    // ── HTTP request/response ─────────────────────────────────────
    /// Proxy → LAN: perform one HTTP request. `id` is a UUID minted by
    /// the proxy; the relay and the LAN agent only ever echo it.
    HttpRequest { id: String, request: HttpRequestPayload },

    /// LAN → proxy: the terminal answer to an `http-request`. Either the
    /// `status`/`headers`/`bodyBase64` triple or `error` is populated.
    HttpResponse {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        headers: Option<HeaderList>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body_base64: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    // ── CONNECT tunnels ───────────────────────────────────────────
    /// Proxy → LAN: open a raw TCP tunnel to `host:port`.
    ConnectStart { id: String, host: String, port: u16 },

    /// LAN → proxy: the tunnel socket is open; raw bytes may flow.
    ConnectAck { id: String },

    /// Tunnel failed to open or was aborted (also synthesized by the
    /// relay when the LAN side disconnects).
    ConnectError { id: String, message: String },

    /// Raw tunnel bytes, either direction.
    ConnectData { id: String, data_base64: String },

    /// Half-close / close of a tunnel, either direction.
    ConnectEnd { id: String },

    // ── Errors ────────────────────────────────────────────────────
    /// Protocol-level error notification.
    Error { message: String },
}

impl Frame {
    /// Shorthand for the error-carrying `http-response` the relay and the
    /// proxy both synthesize.
    pub fn http_error_response(id: String, error: impl Into<String>) -> Frame {
        Frame::HttpResponse {
            id,
            status: None,
            headers: None,
            body_base64: None,
            error: Some(error.into()),
        }
    }
}
