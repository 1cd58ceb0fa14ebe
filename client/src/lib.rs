//! # Relay Clients
//!
//! The two client-side engines of the relay system and the transport
//! they share:
//!
//! - [`lan`]       — runs inside the private network; executes HTTP
//!   requests and opens TCP tunnels toward the real targets
//! - [`proxy`]     — runs next to the browser; terminates HTTP/1.1 proxy
//!   traffic (absolute-form requests and CONNECT) and originates every id
//! - [`transport`] — one frame pipe, two implementations: a persistent
//!   WebSocket and a long-poll NDJSON fallback, with an outbox that
//!   survives reconnects
//! - [`options`]   — server URL / session parsing shared by both engines

mod connect;
mod tls;

pub mod lan;
pub mod options;
pub mod proxy;
pub mod transport;
