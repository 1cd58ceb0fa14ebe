//! # Server State
//!
//! The relay's shared state: a lazily-created [`SessionState`] per session
//! name, each holding one [`Channel`] per role. A channel owns the
//! currently connected socket (if any), the FIFO queue of frames waiting
//! for that role, and the NDJSON streams attached by the long-poll
//! transport.
//!
//! The session registry is a [`DashMap`] so independent sessions never
//! contend; every mutation *within* one session happens under that
//! session's own mutex.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use dashmap::DashMap;
use rwp_protocol::{Frame, Role};
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::debug;
use uuid::Uuid;

/// Sender half of a connection's (or attached stream's) outbound queue.
pub type FrameTx = mpsc::UnboundedSender<Frame>;

/// The live socket currently installed for a `(session, role)` pair.
#[derive(Debug, Clone)]
pub struct SocketHandle {
    /// Identifies the connection so a stale disconnect can't clean up a
    /// replacement socket installed in the meantime.
    pub conn_id: Uuid,
    /// Pushes frames to the connection's outbound sender task.
    pub tx: FrameTx,
    /// Fired when a newer `hello` displaces this socket; the connection
    /// task closes with a "replaced" reason.
    pub replaced: Arc<Notify>,
}

/// Per-role mailbox: current socket, queued frames, attached streams.
#[derive(Debug, Default)]
pub struct Channel {
    pub socket: Option<SocketHandle>,
    pub queue: VecDeque<Frame>,
    pub streams: Vec<FrameTx>,
}

impl Channel {
    /// Delivers a frame to this channel: live socket first, else the first
    /// live attached stream, else the queue. Dead sockets and streams are
    /// pruned along the way.
    pub fn respond(&mut self, frame: Frame) {
        let mut frame = frame;
        if let Some(socket) = &self.socket {
            match socket.tx.send(frame) {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned)) => {
                    frame = returned;
                    self.socket = None;
                }
            }
        }
        while !self.streams.is_empty() {
            match self.streams[0].send(frame) {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned)) => {
                    frame = returned;
                    self.streams.remove(0);
                }
            }
        }
        self.queue.push_back(frame);
    }
}

/// Everything the relay tracks for one session name.
///
/// A session is created on first contact and survives disconnects of
/// either side; only the sockets come and go.
#[derive(Debug, Default)]
pub struct SessionState {
    pub lan: Channel,
    pub proxy: Channel,
    /// Outstanding `http-request` ids → originating role.
    pub requests: HashMap<String, Role>,
    /// Active CONNECT tunnel ids → originating role.
    pub tunnels: HashMap<String, Role>,
}

impl SessionState {
    pub fn channel(&self, role: Role) -> &Channel {
        match role {
            Role::Lan => &self.lan,
            Role::Proxy => &self.proxy,
        }
    }

    pub fn channel_mut(&mut self, role: Role) -> &mut Channel {
        match role {
            Role::Lan => &mut self.lan,
            Role::Proxy => &mut self.proxy,
        }
    }

    /// Delivers `frame` to the channel of `role` (socket → stream → queue).
    pub fn respond(&mut self, role: Role, frame: Frame) {
        self.channel_mut(role).respond(frame);
    }

    /// Installs a freshly-handshaken socket, displacing any prior one,
    /// sends it `ack`, then drains the queued backlog in FIFO order before
    /// any new input for that role is processed.
    pub fn install_socket(&mut self, role: Role, handle: SocketHandle, ack: Frame) {
        let channel = self.channel_mut(role);
        if let Some(old) = channel.socket.take() {
            debug!(%role, old = %old.conn_id, new = %handle.conn_id, "replacing live socket");
            old.replaced.notify_one();
        }
        let _ = handle.tx.send(ack);
        while let Some(frame) = channel.queue.pop_front() {
            if handle.tx.send(frame).is_err() {
                break;
            }
        }
        channel.socket = Some(handle);
    }

    /// Attaches an NDJSON stream to `role`'s channel. Queued frames drain
    /// into the stream, FIFO, before any newly arriving frame reaches it.
    pub fn attach_stream(&mut self, role: Role) -> mpsc::UnboundedReceiver<Frame> {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = self.channel_mut(role);
        while let Some(frame) = channel.queue.pop_front() {
            if tx.send(frame).is_err() {
                break;
            }
        }
        channel.streams.push(tx);
        rx
    }
}

/// Shared application state, cloned into each request handler.
#[derive(Clone)]
pub struct AppState {
    /// Session registry, keyed by session name. Entries are created
    /// lazily and never removed; an empty session is just two idle
    /// channels.
    pub sessions: Arc<DashMap<String, Arc<Mutex<SessionState>>>>,
    /// Redirect target for non-API requests.
    pub homepage: Option<String>,
}

impl AppState {
    pub fn new(homepage: Option<String>) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            homepage,
        }
    }

    /// The state for `name`, created on first use.
    pub fn session(&self, name: &str) -> Arc<Mutex<SessionState>> {
        self.sessions.entry(name.to_string()).or_default().clone()
    }
}
