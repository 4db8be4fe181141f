//! Persisted settings
//!
//! Simple key/value settings stored as JSON in `~/.simapprover/config.json`,
//! read once at startup. CLI flags override individual values without being
//! written back unless asked to.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Which delivery strategy brings new request ids to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum UplinkKind {
    /// Persistent WebSocket stream, pull style.
    Stream,
    /// Encrypted payloads delivered by an external push service.
    Push,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server host, no scheme.
    pub base_host: String,
    /// Path prefix the sim endpoints live under.
    pub base_path: String,
    /// Shared secret. Sent as the `x-sim-pin` header and, for the push
    /// uplink, hashed into the payload encryption key.
    pub pin: String,
    /// Start the uplink automatically on `run`.
    pub poll: bool,
    pub uplink: UplinkKind,
    /// Reconnect backoff: initial delay.
    pub reconnect_base_ms: u64,
    /// Reconnect backoff: cap.
    pub reconnect_max_ms: u64,
    /// Reconnect backoff: max random jitter added per attempt.
    pub reconnect_jitter_ms: u64,
    /// Where the push uplink POSTs encrypted replies.
    pub cloud_reply_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_host: "shell.example.com".into(),
            base_path: "/sim".into(),
            pin: "some very secret password".into(),
            poll: true,
            uplink: UplinkKind::Stream,
            reconnect_base_ms: 1_000,
            reconnect_max_ms: 60_000,
            reconnect_jitter_ms: 1_000,
            cloud_reply_url: "https://europe-west2-simapprover.cloudfunctions.net/reply".into(),
        }
    }
}

impl Config {
    /// `user-agent` value: app id plus the local hostname, so the server log
    /// shows which device approved what.
    pub fn user_agent(&self) -> String {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown-host".into());
        format!("SimApprover/{} ({host})", env!("CARGO_PKG_VERSION"))
    }

    /// Base URL for the HTTPS endpoints (fetch, reply).
    pub fn base_url(&self) -> String {
        format!("https://{}{}", self.base_host, self.base_path)
    }

    /// URL for the streaming endpoint.
    pub fn stream_url(&self) -> String {
        format!("wss://{}{}/stream", self.base_host, self.base_path)
    }
}

/// Config directory (`~/.simapprover`), cross-platform.
pub fn config_dir() -> PathBuf {
    dirs_next::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".simapprover")
}

fn config_file() -> PathBuf {
    config_dir().join("config.json")
}

/// Load the config file, if present and parseable.
pub fn load_config() -> Option<Config> {
    let data = fs::read_to_string(config_file()).ok()?;
    match serde_json::from_str(&data) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            tracing::warn!("Ignoring malformed config file: {}", e);
            None
        }
    }
}

/// Load the config, falling back to (and persisting) defaults on first run.
pub fn load_or_init() -> Config {
    load_config().unwrap_or_else(|| {
        let cfg = Config::default();
        if let Err(e) = save_config(&cfg) {
            tracing::warn!("Failed to write default config: {}", e);
        }
        cfg
    })
}

pub fn save_config(cfg: &Config) -> std::io::Result<()> {
    let path = config_file();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(cfg)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_point_at_the_sim_prefix() {
        let cfg = Config::default();
        assert_eq!(cfg.base_url(), "https://shell.example.com/sim");
        assert_eq!(cfg.stream_url(), "wss://shell.example.com/sim/stream");
    }

    #[test]
    fn config_round_trips_through_json() {
        let mut cfg = Config::default();
        cfg.uplink = UplinkKind::Push;
        cfg.reconnect_base_ms = 250;
        let json = serde_json::to_string(&cfg).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.uplink, UplinkKind::Push);
        assert_eq!(back.reconnect_base_ms, 250);
    }
}
