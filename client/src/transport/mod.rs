//! # Transport Abstraction
//!
//! One frame pipe between an engine and the relay, with two carriers:
//! the persistent WebSocket ([`ws`]) and the long-poll NDJSON fallback
//! ([`http`]). Both deliver the same events and drain the same outbox,
//! so the engines never know which one is underneath.
//!
//! The outbox absorbs sends while the transport is down and flushes in
//! FIFO order on (re)connect; it is bounded only by memory. Under
//! `auto`, the socket gets one attempt — if it never reaches open, the
//! session switches to the fallback and stays there.

pub(crate) mod http;
pub(crate) mod ws;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rwp_protocol::{Frame, Role};
use tokio::sync::mpsc;
use tracing::info;

use crate::options::{ClientOptions, TransportMode};

/// Pause between reconnect attempts of the persistent socket.
const RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// What the engines see from the transport.
#[derive(Debug, PartialEq)]
pub enum TransportEvent {
    /// The transport reached open (handshake complete); queued outbound
    /// frames are flushing.
    Connected,
    /// The transport dropped; every in-flight piece of work owned by the
    /// local role must be failed.
    Disconnected,
    /// A frame arrived from the relay.
    Frame(Frame),
}

pub type EventRx = mpsc::UnboundedReceiver<TransportEvent>;

/// Cloneable handle the engines use to push frames toward the relay.
#[derive(Clone)]
pub struct Transport {
    outbox_tx: mpsc::UnboundedSender<Frame>,
    connected: Arc<AtomicBool>,
}

impl Transport {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        (
            Self {
                outbox_tx,
                connected: Arc::new(AtomicBool::new(false)),
            },
            outbox_rx,
        )
    }

    /// Enqueues a frame. Never blocks and never fails: while the
    /// transport is down the frame waits in the outbox.
    pub fn send(&self, frame: Frame) {
        let _ = self.outbox_tx.send(frame);
    }

    /// Whether the transport currently has a live connection. The proxy
    /// engine gates CONNECT on this (503 when down).
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Sender half of the event pipe plus the shared connected flag.
#[derive(Clone)]
pub(crate) struct EventSink {
    tx: mpsc::UnboundedSender<TransportEvent>,
    connected: Arc<AtomicBool>,
}

impl EventSink {
    pub(crate) fn connected(&self) {
        self.connected.store(true, Ordering::SeqCst);
        let _ = self.tx.send(TransportEvent::Connected);
    }

    pub(crate) fn disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.tx.send(TransportEvent::Disconnected);
    }

    pub(crate) fn frame(&self, frame: Frame) {
        let _ = self.tx.send(TransportEvent::Frame(frame));
    }
}

/// FIFO of outbound frames, fed by [`Transport::send`] and drained by
/// whichever carrier is live. Frames a carrier could not deliver are
/// pushed back to the front so nothing is lost across a reconnect or the
/// auto-fallback switch.
pub(crate) struct Outbox {
    rx: mpsc::UnboundedReceiver<Frame>,
    buf: VecDeque<Frame>,
}

impl Outbox {
    fn new(rx: mpsc::UnboundedReceiver<Frame>) -> Self {
        Self {
            rx,
            buf: VecDeque::new(),
        }
    }

    /// The next frame to deliver; `None` once every [`Transport`] handle
    /// is gone and the buffer is dry.
    pub(crate) async fn next(&mut self) -> Option<Frame> {
        if let Some(frame) = self.buf.pop_front() {
            return Some(frame);
        }
        self.rx.recv().await
    }

    pub(crate) fn push_front(&mut self, frame: Frame) {
        self.buf.push_front(frame);
    }

    /// Re-queues a failed batch ahead of everything else, original order
    /// preserved.
    pub(crate) fn push_front_batch(&mut self, frames: Vec<Frame>) {
        for frame in frames.into_iter().rev() {
            self.buf.push_front(frame);
        }
    }
}

/// Starts the transport task for `role` and hands back the send handle
/// plus the event stream.
pub fn spawn(role: Role, options: ClientOptions) -> (Transport, EventRx) {
    let (transport, outbox_rx) = Transport::new();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let events = EventSink {
        tx: event_tx,
        connected: transport.connected.clone(),
    };
    tokio::spawn(drive(role, options, Outbox::new(outbox_rx), events));
    (transport, event_rx)
}

async fn drive(role: Role, options: ClientOptions, mut outbox: Outbox, events: EventSink) {
    match options.transport {
        TransportMode::Http => http::run(role, &options, &mut outbox, &events).await,
        TransportMode::Ws => loop {
            match ws::run_session(role, &options, &mut outbox, &events).await {
                ws::SessionEnd::Finished => return,
                ws::SessionEnd::NeverOpened(err) => {
                    info!(%err, "relay socket unavailable; retrying");
                }
                ws::SessionEnd::Dropped => {}
            }
            tokio::time::sleep(RECONNECT_DELAY).await;
        },
        TransportMode::Auto => {
            // One shot at the socket; never reaching open switches the
            // session to the fallback for good.
            match ws::run_session(role, &options, &mut outbox, &events).await {
                ws::SessionEnd::Finished => return,
                ws::SessionEnd::NeverOpened(err) => {
                    info!(%err, "relay socket unavailable; switching to HTTP transport");
                    http::run(role, &options, &mut outbox, &events).await;
                }
                ws::SessionEnd::Dropped => loop {
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    match ws::run_session(role, &options, &mut outbox, &events).await {
                        ws::SessionEnd::Finished => return,
                        ws::SessionEnd::NeverOpened(err) => {
                            info!(%err, "relay socket unavailable; retrying");
                        }
                        ws::SessionEnd::Dropped => {}
                    }
                },
            }
        }
    }
}
