//! Push-delivery uplink
//!
//! For devices that cannot hold an inbound stream open. An external push
//! service (registration is outside this crate) delivers payloads into the
//! channel returned by [`PushUplink::new`]: either a bare request id that
//! still needs a fetch, or the full request body encrypted with
//! AES-256-GCM under a key derived from the shared-secret PIN. Replies go out
//! encrypted through a cloud relay, since the push channel is one-way.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use sha2::{Digest, Sha256};
use tokio::sync::{broadcast, mpsc};

use super::stream::fetch_one;
use super::{UplinkError, UplinkEvent, UplinkStatus};
use crate::api::SimClient;
use crate::backlog::Backlog;
use crate::config::Config;
use crate::proto::{ApproveRequest, ApproveResponse};

/// AES-GCM nonce length; the nonce is prepended to the ciphertext on the wire.
const NONCE_LEN: usize = 12;

/// Capacity of the delivery channel from the push receiver.
const PUSH_QUEUE: usize = 16;

/// What the push service delivered.
#[derive(Debug, Clone)]
pub enum PushPayload {
    /// A bare request id; the full request still needs a fetch.
    Id(String),
    /// The full request body, encrypted with the derived key.
    Encrypted(Vec<u8>),
}

/// Payload encryption key: SHA-256 of the shared-secret PIN.
pub(crate) fn derive_key(pin: &str) -> [u8; 32] {
    Sha256::digest(pin.as_bytes()).into()
}

pub(crate) fn decrypt(key: &[u8; 32], data: &[u8]) -> Result<Vec<u8>, UplinkError> {
    if data.len() < NONCE_LEN {
        return Err(UplinkError::Decrypt);
    }
    let (nonce, ciphertext) = data.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| UplinkError::Decrypt)?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| UplinkError::Decrypt)
}

pub(crate) fn encrypt(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, UplinkError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| UplinkError::Decrypt)?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| UplinkError::Decrypt)?;
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

#[derive(Clone)]
pub struct PushUplink {
    client: SimClient,
    backlog: Arc<Backlog>,
    events: broadcast::Sender<UplinkEvent>,
    key: [u8; 32],
    cloud_reply_url: String,
    user_agent: String,
    /// Whether delivered payloads are processed or dropped. Push delivery
    /// keeps arriving either way; this is the start/stop gate.
    accepting: Arc<AtomicBool>,
}

impl PushUplink {
    /// Build the uplink and spawn its delivery task. The returned sender is
    /// handed to whatever integrates the push service.
    pub fn new(
        cfg: &Config,
        backlog: Arc<Backlog>,
        events: broadcast::Sender<UplinkEvent>,
    ) -> (Self, mpsc::Sender<PushPayload>) {
        Self::with_client(SimClient::new(cfg), cfg, backlog, events)
    }

    pub fn with_client(
        client: SimClient,
        cfg: &Config,
        backlog: Arc<Backlog>,
        events: broadcast::Sender<UplinkEvent>,
    ) -> (Self, mpsc::Sender<PushPayload>) {
        let (tx, mut rx) = mpsc::channel::<PushPayload>(PUSH_QUEUE);
        let uplink = Self {
            client,
            backlog,
            events,
            key: derive_key(&cfg.pin),
            cloud_reply_url: cfg.cloud_reply_url.clone(),
            user_agent: cfg.user_agent(),
            accepting: Arc::new(AtomicBool::new(false)),
        };

        let worker = uplink.clone();
        tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                worker.handle_message(payload).await;
            }
            tracing::debug!("Push delivery channel closed");
        });

        (uplink, tx)
    }

    /// Cipher self-test, run once at process start. A PIN that cannot round
    /// trip would otherwise only fail on the first real message.
    pub fn init(&self) {
        match encrypt(&self.key, b"self-test").and_then(|c| decrypt(&self.key, &c)) {
            Ok(plain) if plain == b"self-test" => {
                tracing::debug!("Push uplink cipher self-test passed");
            }
            _ => tracing::error!("Push uplink cipher self-test failed"),
        }
    }

    pub fn start(&self) {
        self.accepting.store(true, Ordering::SeqCst);
        let _ = self.events.send(UplinkEvent::Status(UplinkStatus::Connected));
    }

    pub fn stop(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        let _ = self.events.send(UplinkEvent::Status(UplinkStatus::Idle));
    }

    /// Process one delivered payload.
    ///
    /// Decryption or decode failures drop the message: the push channel has
    /// no retry handle, and the payload may be noise from an untrusted
    /// sender.
    pub async fn handle_message(&self, payload: PushPayload) {
        if !self.accepting.load(Ordering::SeqCst) {
            tracing::debug!("Push message dropped while stopped");
            return;
        }
        match payload {
            PushPayload::Id(id) => {
                fetch_one(&self.client, &self.backlog, &self.events, &id).await;
            }
            PushPayload::Encrypted(data) => {
                let plain = match decrypt(&self.key, &data) {
                    Ok(plain) => plain,
                    Err(_) => {
                        tracing::warn!(
                            "Unable to decrypt push message of {} bytes, dropping",
                            data.len()
                        );
                        return;
                    }
                };
                match ApproveRequest::decode_wire(&plain) {
                    Ok(req) => {
                        if self.backlog.add(req) {
                            let _ = self.events.send(UplinkEvent::BacklogChanged);
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Dropping undecodable push request: {}", e);
                    }
                }
            }
        }
    }

    /// Encrypt the decision and POST it to the cloud relay as
    /// `{"id": ..., "content": <base64>}`.
    pub async fn reply(&self, decision: &ApproveResponse) -> Result<(), UplinkError> {
        let ciphertext = encrypt(&self.key, &decision.encode_wire())?;
        let body = serde_json::json!({
            "id": decision.id(),
            "content": BASE64.encode(&ciphertext),
        });

        tracing::info!("Replying to {} via cloud relay", decision.id());
        let resp = crate::api::http_client()
            .post(&self.cloud_reply_url)
            .header("user-agent", &self.user_agent)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(UplinkError::CloudStatus(resp.status()));
        }
        // Drain so the connection completes cleanly.
        let ack = resp.bytes().await?;
        tracing::debug!("Cloud relay acknowledged ({} bytes)", ack.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::ApproveRequest;

    #[test]
    fn key_derivation_is_deterministic() {
        assert_eq!(derive_key("pin one"), derive_key("pin one"));
        assert_ne!(derive_key("pin one"), derive_key("pin two"));
    }

    #[test]
    fn encrypted_payload_round_trips() {
        let key = derive_key("a shared secret");
        let sealed = encrypt(&key, b"attack at dawn").unwrap();
        assert_eq!(decrypt(&key, &sealed).unwrap(), b"attack at dawn");
    }

    #[test]
    fn wrong_pin_fails_to_decrypt() {
        let sealed = encrypt(&derive_key("right pin"), b"payload").unwrap();
        assert!(matches!(
            decrypt(&derive_key("wrong pin"), &sealed),
            Err(UplinkError::Decrypt)
        ));
    }

    #[test]
    fn truncated_ciphertext_is_rejected() {
        let key = derive_key("pin");
        assert!(decrypt(&key, &[1, 2, 3]).is_err());
        let mut sealed = encrypt(&key, b"payload").unwrap();
        sealed.truncate(sealed.len() - 1);
        assert!(decrypt(&key, &sealed).is_err());
    }

    #[tokio::test]
    async fn encrypted_push_lands_in_the_backlog() {
        let cfg = crate::config::Config {
            pin: "push pin".into(),
            ..Default::default()
        };
        let backlog = Arc::new(Backlog::new());
        let (events, _keep_alive) = broadcast::channel(16);
        let (uplink, _tx) = PushUplink::new(&cfg, backlog.clone(), events);
        uplink.start();

        let req = ApproveRequest {
            id: Some("PUSHED1".into()),
            ..Default::default()
        };
        let sealed = encrypt(&derive_key("push pin"), &prost::Message::encode_to_vec(&req)).unwrap();
        uplink.handle_message(PushPayload::Encrypted(sealed)).await;

        assert_eq!(backlog.head().unwrap().id(), "PUSHED1");
    }

    #[tokio::test]
    async fn garbage_push_is_dropped_silently() {
        let cfg = crate::config::Config::default();
        let backlog = Arc::new(Backlog::new());
        let (events, _keep_alive) = broadcast::channel(16);
        let (uplink, _tx) = PushUplink::new(&cfg, backlog.clone(), events);
        uplink.start();

        uplink
            .handle_message(PushPayload::Encrypted(vec![0xde, 0xad, 0xbe, 0xef]))
            .await;
        assert!(backlog.is_empty());
    }

    #[tokio::test]
    async fn messages_while_stopped_are_dropped() {
        let cfg = crate::config::Config {
            pin: "p".into(),
            ..Default::default()
        };
        let backlog = Arc::new(Backlog::new());
        let (events, _keep_alive) = broadcast::channel(16);
        let (uplink, _tx) = PushUplink::new(&cfg, backlog.clone(), events);
        // Never started.
        let req = ApproveRequest {
            id: Some("X".into()),
            ..Default::default()
        };
        let sealed = encrypt(&derive_key("p"), &prost::Message::encode_to_vec(&req)).unwrap();
        uplink.handle_message(PushPayload::Encrypted(sealed)).await;
        assert!(backlog.is_empty());
    }
}
