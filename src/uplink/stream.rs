//! Streaming poller uplink
//!
//! Holds a persistent WebSocket to `<base>/stream` and reads one request id
//! per text frame. Each id is handed to a bounded pool of fetch workers that
//! resolve it into a full request and enqueue it. The receive loop is owned
//! by a generation-counted session: stop/restart supersedes the generation
//! and fires the shutdown signal so a blocked read unwinds promptly.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use rand::Rng;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};

use super::{UplinkError, UplinkEvent, UplinkStatus, FETCH_QUEUE, FETCH_WORKERS};
use crate::api::{ApiError, SimClient};
use crate::backlog::Backlog;
use crate::config::Config;
use crate::proto::ApproveResponse;
use crate::session::{GenerationToken, SessionController};

/// Why one run of the inner receive loop ended.
enum StreamEnd {
    /// Clean server-initiated close; reconnect immediately.
    ServerClosed,
    /// Generation superseded or shutdown fired; do not reconnect.
    Superseded,
}

/// Reconnect delay policy: exponential with a cap, plus random jitter.
/// Reset after every successful connect.
pub(crate) struct Backoff {
    base_ms: u64,
    max_ms: u64,
    jitter_ms: u64,
    attempt: u32,
}

impl Backoff {
    fn reset(&mut self) {
        self.attempt = 0;
    }

    fn next_delay(&mut self) -> Duration {
        self.attempt += 1;
        let raw = (self.base_ms as f64) * 2_f64.powi(self.attempt as i32 - 1);
        let capped = raw.min(self.max_ms as f64) as u64;
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        };
        Duration::from_millis(capped + jitter)
    }
}

#[derive(Clone)]
pub struct StreamUplink {
    stream_url: String,
    pin: String,
    user_agent: String,
    client: SimClient,
    backlog: Arc<Backlog>,
    session: SessionController,
    events: broadcast::Sender<UplinkEvent>,
    fetch_tx: mpsc::Sender<String>,
    backoff_cfg: (u64, u64, u64),
}

impl StreamUplink {
    pub fn new(
        cfg: &Config,
        backlog: Arc<Backlog>,
        events: broadcast::Sender<UplinkEvent>,
    ) -> Self {
        Self::with_endpoints(cfg.stream_url(), SimClient::new(cfg), cfg, backlog, events)
    }

    /// Like [`StreamUplink::new`] with explicit endpoints. Tests point these
    /// at local servers.
    pub fn with_endpoints(
        stream_url: String,
        client: SimClient,
        cfg: &Config,
        backlog: Arc<Backlog>,
        events: broadcast::Sender<UplinkEvent>,
    ) -> Self {
        let (fetch_tx, fetch_rx) = mpsc::channel::<String>(FETCH_QUEUE);
        let uplink = Self {
            stream_url,
            pin: cfg.pin.clone(),
            user_agent: cfg.user_agent(),
            client,
            backlog,
            session: SessionController::new(),
            events,
            fetch_tx,
            backoff_cfg: (
                cfg.reconnect_base_ms,
                cfg.reconnect_max_ms,
                cfg.reconnect_jitter_ms,
            ),
        };
        uplink.spawn_fetch_workers(fetch_rx);
        uplink
    }

    pub fn init(&self) {
        tracing::debug!("Stream uplink for {}", self.stream_url);
    }

    /// Launch (or relaunch) the receive loop under a fresh generation. Safe
    /// to call while a loop is running; the old one exits at its next
    /// boundary check.
    pub fn start(&self) {
        let (token, shutdown_rx) = self.session.begin();
        tracing::info!(
            "Starting stream poller, generation {}",
            token.generation()
        );
        let _ = self.events.send(UplinkEvent::Status(UplinkStatus::Starting));
        let this = self.clone();
        tokio::spawn(async move { this.run(token, shutdown_rx).await });
    }

    /// Invalidate the running loop, force the socket closed, and discard
    /// anything not yet decided.
    pub fn stop(&self) {
        tracing::info!("Stopping stream poller");
        self.session.stop();
        self.backlog.clear();
        let _ = self.events.send(UplinkEvent::BacklogChanged);
        let _ = self.events.send(UplinkEvent::Status(UplinkStatus::Idle));
    }

    pub async fn reply(&self, decision: &ApproveResponse) -> Result<(), UplinkError> {
        self.client.reply(decision).await?;
        Ok(())
    }

    pub fn current_generation(&self) -> u64 {
        self.session.current_generation()
    }

    /// Outer loop: connect, read, and reconnect until superseded.
    async fn run(&self, token: GenerationToken, mut shutdown_rx: watch::Receiver<bool>) {
        let mut backoff = Backoff {
            base_ms: self.backoff_cfg.0,
            max_ms: self.backoff_cfg.1,
            jitter_ms: self.backoff_cfg.2,
            attempt: 0,
        };

        while token.is_current() {
            match self.poll_stream(&token, &mut shutdown_rx, &mut backoff).await {
                Ok(StreamEnd::Superseded) => {
                    tracing::debug!("Poller generation {} shutting down", token.generation());
                    break;
                }
                Ok(StreamEnd::ServerClosed) => {
                    tracing::info!("Stream closed by server, restarting");
                    let _ = self
                        .events
                        .send(UplinkEvent::Status(UplinkStatus::Disconnected));
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!("Stream error, reconnecting in {:?}: {}", delay, e);
                    let _ = self
                        .events
                        .send(UplinkEvent::Status(UplinkStatus::Disconnected));
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown_rx.changed() => break,
                    }
                }
            }
        }
        tracing::debug!("Poller generation {} exited", token.generation());
    }

    /// One connection's worth of frames.
    async fn poll_stream(
        &self,
        token: &GenerationToken,
        shutdown_rx: &mut watch::Receiver<bool>,
        backoff: &mut Backoff,
    ) -> Result<StreamEnd, UplinkError> {
        let mut request = self
            .stream_url
            .as_str()
            .into_client_request()?;
        let headers = request.headers_mut();
        headers.insert(
            "x-sim-pin",
            HeaderValue::from_str(&self.pin)
                .map_err(|e| tungstenite::Error::HttpFormat(e.into()))?,
        );
        headers.insert(
            "user-agent",
            HeaderValue::from_str(&self.user_agent)
                .map_err(|e| tungstenite::Error::HttpFormat(e.into()))?,
        );

        let (ws, _) = connect_async(request).await?;
        backoff.reset();
        tracing::debug!("WebSocket connected: {}", self.stream_url);
        let _ = self.events.send(UplinkEvent::Status(UplinkStatus::Connected));

        let (_write, mut read) = ws.split();
        loop {
            let frame = tokio::select! {
                _ = shutdown_rx.changed() => return Ok(StreamEnd::Superseded),
                frame = read.next() => frame,
            };
            match frame {
                None | Some(Ok(Message::Close(_))) => return Ok(StreamEnd::ServerClosed),
                Some(Ok(Message::Text(id))) => {
                    // Re-check before dispatching: frames may already be
                    // buffered when the user hits stop.
                    if !token.is_current() {
                        return Ok(StreamEnd::Superseded);
                    }
                    let id = id.trim().to_string();
                    if id.is_empty() {
                        continue;
                    }
                    tracing::debug!("Got streamed id: {}", id);
                    if self.fetch_tx.send(id).await.is_err() {
                        // Workers only die when the process is shutting down.
                        return Ok(StreamEnd::Superseded);
                    }
                }
                Some(Ok(_)) => {} // ping/pong/binary frames are not ids
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    /// Bounded worker pool resolving streamed ids into full requests.
    fn spawn_fetch_workers(&self, fetch_rx: mpsc::Receiver<String>) {
        let fetch_rx = Arc::new(tokio::sync::Mutex::new(fetch_rx));
        for worker in 0..FETCH_WORKERS {
            let rx = fetch_rx.clone();
            let client = self.client.clone();
            let backlog = self.backlog.clone();
            let events = self.events.clone();
            tokio::spawn(async move {
                loop {
                    let id = {
                        let mut rx = rx.lock().await;
                        rx.recv().await
                    };
                    let Some(id) = id else {
                        tracing::debug!("Fetch worker {} exiting", worker);
                        return;
                    };
                    fetch_one(&client, &backlog, &events, &id).await;
                }
            });
        }
    }
}

/// Resolve one id and enqueue the result. Failures degrade per kind: decode
/// noise is dropped, expired ids get a specific message, the rest a generic
/// non-fatal notification.
pub(crate) async fn fetch_one(
    client: &SimClient,
    backlog: &Backlog,
    events: &broadcast::Sender<UplinkEvent>,
    id: &str,
) {
    match client.fetch(id).await {
        Ok(req) => {
            if backlog.add(req) {
                let _ = events.send(UplinkEvent::BacklogChanged);
            } else {
                tracing::debug!("Duplicate delivery of id {}", id);
            }
        }
        Err(ApiError::Decode(e)) => {
            tracing::warn!("Dropping malformed request {}: {}", id, e);
        }
        Err(ApiError::NotFound) => {
            let _ = events.send(UplinkEvent::Error(format!(
                "Command {id} no longer exists"
            )));
        }
        Err(e) => {
            let _ = events.send(UplinkEvent::Error(format!(
                "Failed to get id {id}: {e}"
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff(base: u64, max: u64) -> Backoff {
        Backoff {
            base_ms: base,
            max_ms: max,
            jitter_ms: 0,
            attempt: 0,
        }
    }

    #[test]
    fn backoff_doubles_until_the_cap() {
        let mut b = backoff(1_000, 10_000);
        assert_eq!(b.next_delay(), Duration::from_millis(1_000));
        assert_eq!(b.next_delay(), Duration::from_millis(2_000));
        assert_eq!(b.next_delay(), Duration::from_millis(4_000));
        assert_eq!(b.next_delay(), Duration::from_millis(8_000));
        assert_eq!(b.next_delay(), Duration::from_millis(10_000));
        assert_eq!(b.next_delay(), Duration::from_millis(10_000));
    }

    #[test]
    fn backoff_reset_starts_over() {
        let mut b = backoff(500, 60_000);
        b.next_delay();
        b.next_delay();
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_millis(500));
    }

    #[test]
    fn backoff_jitter_stays_within_bounds() {
        let mut b = Backoff {
            base_ms: 1_000,
            max_ms: 1_000,
            jitter_ms: 200,
            attempt: 0,
        };
        for _ in 0..50 {
            let d = b.next_delay();
            assert!(d >= Duration::from_millis(1_000));
            assert!(d <= Duration::from_millis(1_200));
        }
    }
}
