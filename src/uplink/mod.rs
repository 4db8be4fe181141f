//! Uplinks: how new request ids reach the client
//!
//! Two interchangeable delivery strategies behind one closed set: a pull-style
//! WebSocket streaming poller and a push-style encrypted-delivery receiver.
//! Which one runs is a static configuration choice, so this is an enum, not a
//! trait object.

pub mod push;
pub mod stream;

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::api::ApiError;
use crate::backlog::Backlog;
use crate::config::{Config, UplinkKind};
use crate::proto::ApproveResponse;

pub use push::{PushPayload, PushUplink};
pub use stream::StreamUplink;

/// Fetch worker pool size for the streaming uplink.
pub(crate) const FETCH_WORKERS: usize = 4;
/// Capacity of the fetch queue. A full queue backpressures the stream
/// reader instead of spawning unbounded work.
pub(crate) const FETCH_QUEUE: usize = 16;

#[derive(Debug, Error)]
pub enum UplinkError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("payload decryption failed")]
    Decrypt,

    #[error("cloud reply endpoint returned {0}")]
    CloudStatus(reqwest::StatusCode),

    #[error("cloud reply failed: {0}")]
    CloudTransport(#[from] reqwest::Error),
}

/// Coarse connection state, rendered as the status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UplinkStatus {
    Starting,
    Connected,
    Disconnected,
    Idle,
}

impl fmt::Display for UplinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UplinkStatus::Starting => write!(f, "poller starting"),
            UplinkStatus::Connected => write!(f, "connected and waiting"),
            UplinkStatus::Disconnected => write!(f, "poller disconnected"),
            UplinkStatus::Idle => write!(f, "idle"),
        }
    }
}

/// Events the core sends to the frontend.
#[derive(Debug, Clone)]
pub enum UplinkEvent {
    /// A request was added to (or removed from) the backlog; redraw the head.
    BacklogChanged,
    Status(UplinkStatus),
    /// User-visible, non-fatal failure.
    Error(String),
}

/// The configured delivery strategy.
pub enum Uplink {
    Stream(StreamUplink),
    Push(PushUplink),
}

impl Uplink {
    /// Build the uplink selected in the config, wiring it to the shared
    /// backlog and event channel. For the push variant the returned sender is
    /// where the external push service delivers payloads.
    pub fn build(
        cfg: &Config,
        backlog: Arc<Backlog>,
        events: broadcast::Sender<UplinkEvent>,
    ) -> (Self, Option<mpsc::Sender<PushPayload>>) {
        match cfg.uplink {
            UplinkKind::Stream => (
                Uplink::Stream(StreamUplink::new(cfg, backlog, events)),
                None,
            ),
            UplinkKind::Push => {
                let (uplink, tx) = PushUplink::new(cfg, backlog, events);
                (Uplink::Push(uplink), Some(tx))
            }
        }
    }

    /// One-time init hook, run at process start.
    pub fn init(&self) {
        match self {
            Uplink::Stream(u) => u.init(),
            Uplink::Push(u) => u.init(),
        }
    }

    /// Begin accepting / requesting new items.
    pub fn start(&self) {
        match self {
            Uplink::Stream(u) => u.start(),
            Uplink::Push(u) => u.start(),
        }
    }

    /// Cease accepting; the streaming variant also tears down the socket and
    /// clears the backlog.
    pub fn stop(&self) {
        match self {
            Uplink::Stream(u) => u.stop(),
            Uplink::Push(u) => u.stop(),
        }
    }

    /// Transmit a decision. Fire-and-forget from the caller's point of view:
    /// a failure is surfaced but the item stays popped.
    pub async fn reply(&self, decision: &ApproveResponse) -> Result<(), UplinkError> {
        match self {
            Uplink::Stream(u) => u.reply(decision).await,
            Uplink::Push(u) => u.reply(decision).await,
        }
    }
}
