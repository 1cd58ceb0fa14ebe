//! # Relay Protocol
//!
//! Defines the frame set exchanged between the three relay roles
//! (relay server, LAN agent, local proxy), plus the payload helpers
//! both sides need: base64 body encoding and hop-by-hop header
//! stripping. Frames are serialized as JSON text using serde's
//! internally-tagged representation (`"type": "..."` field), identically
//! on the persistent socket and on the NDJSON fallback stream.

mod frames;
mod headers;
mod payload;

pub use frames::{Frame, HttpRequestPayload, Role, RoleParseError, PROTOCOL_VERSION};
pub use headers::{is_hop_by_hop, sanitize_headers, HeaderList};
pub use payload::{decode_base64, encode_base64, PayloadError};
