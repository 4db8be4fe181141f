//! HTTPS client for the sim server
//!
//! Resolves streamed ids into full requests (`GET <base>/get/<id>`) and sends
//! decisions back (`POST <base>/approve/<id>`). Both carry the shared-secret
//! PIN header and a descriptive user-agent.

use std::sync::OnceLock;
use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;

use crate::config::Config;
use crate::proto::{ApproveRequest, ApproveResponse};

/// Shared HTTP client (lazy initialized with timeout)
pub(crate) fn http_client() -> &'static reqwest::Client {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new())
    })
}

#[derive(Debug, Error)]
pub enum ApiError {
    /// The server no longer knows the id. The command was already handled or
    /// expired; the UI reports "command no longer exists" and moves on.
    #[error("command no longer exists")]
    NotFound,

    #[error("server returned {0}")]
    Status(StatusCode),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("malformed request payload: {0}")]
    Decode(#[from] prost::DecodeError),
}

/// Fetcher and reply sender, addressed at one sim server.
#[derive(Clone)]
pub struct SimClient {
    base_url: String,
    pin: String,
    user_agent: String,
}

impl SimClient {
    pub fn new(cfg: &Config) -> Self {
        Self::with_base_url(cfg.base_url(), cfg)
    }

    /// Like [`SimClient::new`] but with an explicit base URL. Tests point
    /// this at a local mock server.
    pub fn with_base_url(base_url: String, cfg: &Config) -> Self {
        Self {
            base_url,
            pin: cfg.pin.clone(),
            user_agent: cfg.user_agent(),
        }
    }

    /// Resolve a streamed id into the full request.
    pub async fn fetch(&self, id: &str) -> Result<ApproveRequest, ApiError> {
        let url = format!("{}/get/{id}", self.base_url);
        tracing::debug!("Fetching request {} from {}", id, url);

        let resp = http_client()
            .get(&url)
            .header("x-sim-pin", &self.pin)
            .header("user-agent", &self.user_agent)
            .send()
            .await?;

        match resp.status() {
            StatusCode::NOT_FOUND => Err(ApiError::NotFound),
            status if !status.is_success() => Err(ApiError::Status(status)),
            _ => {
                let body = resp.bytes().await?;
                Ok(ApproveRequest::decode_wire(&body)?)
            }
        }
    }

    /// Transmit a decision. The response body is drained even though it is
    /// unused, so the connection completes cleanly.
    pub async fn reply(&self, decision: &ApproveResponse) -> Result<(), ApiError> {
        let url = format!("{}/approve/{}", self.base_url, decision.id());
        tracing::info!(
            "Replying {} to request {}",
            if decision.approved.unwrap_or(false) {
                "approve"
            } else {
                "reject"
            },
            decision.id()
        );

        let resp = http_client()
            .post(&url)
            .header("x-sim-pin", &self.pin)
            .header("user-agent", &self.user_agent)
            .body(decision.encode_wire())
            .send()
            .await?;

        match resp.status() {
            StatusCode::NOT_FOUND => Err(ApiError::NotFound),
            status if !status.is_success() => Err(ApiError::Status(status)),
            _ => {
                let body = resp.bytes().await?;
                tracing::debug!("Reply acknowledged ({} bytes)", body.len());
                Ok(())
            }
        }
    }
}
