//! Nostr relay pool: WebSocket fan-out publish, subscription tracking, and
//! NIP-17-style gift-wrapped direct messages used as the BLE fallback
//! transport for favorited peers.
//!
//! The gift-wrap envelope here follows NIP-17's three-layer shape (rumor →
//! seal → gift wrap) but uses this crate's own ChaCha20-Poly1305 conversation
//! key derivation rather than NIP-44's exact padding scheme — byte-for-byte
//! NIP-44 compatibility isn't required for two `meshline` nodes to exchange
//! gift-wrapped DMs with each other.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use futures_util::{SinkExt, StreamExt};
use rand::RngCore;
use secp256k1::{Keypair, Message as SecpMessage, Secp256k1, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::error::{Error, Result};
use crate::resilience::{BackoffStrategy, RetryConfig, RetryExecutor};

const DM_KIND_RUMOR: u32 = 14;
const DM_KIND_SEAL: u32 = 13;
const DM_KIND_GIFT_WRAP: u32 = 1059;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NostrEvent {
    pub id: String,
    pub pubkey: String,
    pub created_at: i64,
    pub kind: u32,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

impl NostrEvent {
    fn compute_id(pubkey: &str, created_at: i64, kind: u32, tags: &[Vec<String>], content: &str) -> [u8; 32] {
        let canonical = serde_json::json!([0, pubkey, created_at, kind, tags, content]);
        let serialized = serde_json::to_string(&canonical).expect("event fields are always serializable");
        Sha256::digest(serialized.as_bytes()).into()
    }

    /// Builds and schnorr-signs an event with the given key pair.
    pub fn create(keypair: &Keypair, created_at: i64, kind: u32, tags: Vec<Vec<String>>, content: String) -> Self {
        let secp = Secp256k1::new();
        let (x_only, _parity) = XOnlyPublicKey::from_keypair(keypair);
        let pubkey = hex::encode(x_only.serialize());

        let id_bytes = Self::compute_id(&pubkey, created_at, kind, &tags, &content);
        let message = SecpMessage::from_digest(id_bytes);
        let signature = secp.sign_schnorr(&message, keypair);

        Self {
            id: hex::encode(id_bytes),
            pubkey,
            created_at,
            kind,
            tags,
            content,
            sig: hex::encode(signature.as_ref()),
        }
    }
}

/// Shared secret derived from ECDH between our secret key and a peer's
/// x-only public key, used to key the gift-wrap/seal ChaCha20-Poly1305
/// layers.
fn conversation_key(secret_key: &secp256k1::SecretKey, their_pubkey: &XOnlyPublicKey) -> [u8; 32] {
    let full_pubkey = their_pubkey.public_key(secp256k1::Parity::Even);
    let shared_point = secp256k1::ecdh::SharedSecret::new(&full_pubkey, secret_key);
    let mut hasher = Sha256::new();
    hasher.update(shared_point.secret_bytes());
    hasher.update(b"nip44-v2-conversation-key");
    hasher.finalize().into()
}

fn encrypt_layer(key: &[u8; 32], plaintext: &[u8]) -> Result<String> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let mut nonce_bytes = [0u8; 12];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| Error::CryptoFailure("gift-wrap layer encryption failed".into()))?;

    let mut framed = nonce_bytes.to_vec();
    framed.extend_from_slice(&ciphertext);
    Ok(base64_encode(&framed))
}

fn decrypt_layer(key: &[u8; 32], encoded: &str) -> Result<Vec<u8>> {
    let framed = base64_decode(encoded)?;
    if framed.len() < 12 {
        return Err(Error::CryptoFailure("gift-wrap layer too short".into()));
    }
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = Nonce::from_slice(&framed[..12]);
    cipher
        .decrypt(nonce, &framed[12..])
        .map_err(|_| Error::CryptoFailure("gift-wrap layer decryption failed".into()))
}

/// Wraps `content` for `recipient_pubkey`, returning the gift-wrap event
/// ready to publish. `sender_keypair` signs the inner rumor and seal;
/// the outer gift wrap is signed by a disposable ephemeral key so relays
/// never learn who actually sent the message.
pub fn gift_wrap_dm(
    sender_keypair: &Keypair,
    recipient_pubkey: &XOnlyPublicKey,
    content: String,
    created_at: i64,
) -> Result<NostrEvent> {
    let (sender_x_only, _) = XOnlyPublicKey::from_keypair(sender_keypair);
    let rumor = NostrEvent {
        id: hex::encode(NostrEvent::compute_id(
            &hex::encode(sender_x_only.serialize()),
            created_at,
            DM_KIND_RUMOR,
            &[vec!["p".into(), hex::encode(recipient_pubkey.serialize())]],
            &content,
        )),
        pubkey: hex::encode(sender_x_only.serialize()),
        created_at,
        kind: DM_KIND_RUMOR,
        tags: vec![vec!["p".into(), hex::encode(recipient_pubkey.serialize())]],
        content,
        sig: String::new(),
    };
    let rumor_json = serde_json::to_string(&rumor)?;

    let sender_secret = sender_keypair.secret_key();
    let seal_key = conversation_key(&sender_secret, recipient_pubkey);
    let seal_content = encrypt_layer(&seal_key, rumor_json.as_bytes())?;
    let seal = NostrEvent::create(sender_keypair, created_at, DM_KIND_SEAL, vec![], seal_content);
    let seal_json = serde_json::to_string(&seal)?;

    let secp = Secp256k1::new();
    let mut ephemeral_bytes = [0u8; 32];
    loop {
        rand::rngs::OsRng.fill_bytes(&mut ephemeral_bytes);
        if secp256k1::SecretKey::from_slice(&ephemeral_bytes).is_ok() {
            break;
        }
    }
    let ephemeral_secret = secp256k1::SecretKey::from_slice(&ephemeral_bytes).expect("validated above");
    let ephemeral_keypair = Keypair::from_secret_key(&secp, &ephemeral_secret);

    let wrap_key = conversation_key(&ephemeral_secret, recipient_pubkey);
    let wrap_content = encrypt_layer(&wrap_key, seal_json.as_bytes())?;

    Ok(NostrEvent::create(
        &ephemeral_keypair,
        created_at,
        DM_KIND_GIFT_WRAP,
        vec![vec!["p".into(), hex::encode(recipient_pubkey.serialize())]],
        wrap_content,
    ))
}

/// Unwraps a gift-wrap event addressed to us, returning the rumor's content.
pub fn open_gift_wrap(recipient_keypair: &Keypair, gift_wrap: &NostrEvent) -> Result<String> {
    let wrapper_pubkey_bytes = hex::decode(&gift_wrap.pubkey)
        .map_err(|_| Error::InvalidPacket("gift wrap pubkey is not valid hex".into()))?;
    let wrapper_pubkey = XOnlyPublicKey::from_slice(&wrapper_pubkey_bytes)
        .map_err(|_| Error::InvalidPacket("gift wrap pubkey is not a valid point".into()))?;

    let recipient_secret = recipient_keypair.secret_key();
    let wrap_key = conversation_key(&recipient_secret, &wrapper_pubkey);
    let seal_json = decrypt_layer(&wrap_key, &gift_wrap.content)?;
    let seal: NostrEvent = serde_json::from_slice(&seal_json)?;

    let seal_pubkey_bytes = hex::decode(&seal.pubkey)
        .map_err(|_| Error::InvalidPacket("seal pubkey is not valid hex".into()))?;
    let seal_pubkey = XOnlyPublicKey::from_slice(&seal_pubkey_bytes)
        .map_err(|_| Error::InvalidPacket("seal pubkey is not a valid point".into()))?;
    let seal_key = conversation_key(&recipient_secret, &seal_pubkey);
    let rumor_json = decrypt_layer(&seal_key, &seal.content)?;
    let rumor: NostrEvent = serde_json::from_slice(&rumor_json)?;

    Ok(rumor.content)
}

struct RelayConnection {
    state: RelayConnectionState,
    outbound: mpsc::UnboundedSender<WsMessage>,
}

/// Fan-out publisher/subscriber across a set of Nostr relays, with
/// exponential-backoff reconnection per relay.
pub struct RelayPool {
    relays: Arc<RwLock<HashMap<String, RelayConnection>>>,
    inbound: mpsc::UnboundedSender<(String, NostrEvent)>,
}

impl RelayPool {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(String, NostrEvent)>) {
        let (inbound, rx) = mpsc::unbounded_channel();
        (
            Self {
                relays: Arc::new(RwLock::new(HashMap::new())),
                inbound,
            },
            rx,
        )
    }

    /// Connects to `url`, spawning a task that reconnects with exponential
    /// backoff until the relay is explicitly removed.
    pub async fn add_relay(&self, url: String) {
        let relays = self.relays.clone();
        let inbound = self.inbound.clone();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<WsMessage>();

        relays.write().await.insert(
            url.clone(),
            RelayConnection {
                state: RelayConnectionState::Connecting,
                outbound: outbound_tx,
            },
        );

        tokio::spawn(async move {
            let retry = RetryExecutor::new(RetryConfig {
                max_attempts: u32::MAX,
                backoff_strategy: BackoffStrategy::Exponential {
                    base: Duration::from_secs(1),
                    max: Duration::from_secs(300),
                    multiplier: 2.0,
                },
                max_total_duration: None,
                jitter: true,
                jitter_factor: 0.2,
                retry_on: vec![],
                dont_retry_on: vec![],
            });

            let connect_url = url.clone();
            let result = retry
                .execute(move || {
                    let connect_url = connect_url.clone();
                    Box::pin(async move {
                        tokio_tungstenite::connect_async(&connect_url)
                            .await
                            .map(|(stream, _)| stream)
                    })
                })
                .await;

            let Ok(stream) = result else {
                tracing::warn!(relay = %url, "giving up on relay after repeated connection failures");
                if let Some(entry) = relays.write().await.get_mut(&url) {
                    entry.state = RelayConnectionState::Disconnected;
                }
                return;
            };

            if let Some(entry) = relays.write().await.get_mut(&url) {
                entry.state = RelayConnectionState::Connected;
            }
            tracing::info!(relay = %url, "connected to relay");

            let (mut write, mut read) = stream.split();
            loop {
                tokio::select! {
                    outbound = outbound_rx.recv() => {
                        match outbound {
                            Some(message) => {
                                if write.send(message).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                    incoming = read.next() => {
                        match incoming {
                            Some(Ok(WsMessage::Text(text))) => {
                                if let Ok(event) = parse_event_message(&text) {
                                    let _ = inbound.send((url.clone(), event));
                                }
                            }
                            Some(Ok(_)) => {}
                            Some(Err(_)) | None => break,
                        }
                    }
                }
            }

            if let Some(entry) = relays.write().await.get_mut(&url) {
                entry.state = RelayConnectionState::Disconnected;
            }
            tracing::warn!(relay = %url, "relay connection closed");
        });
    }

    /// Publishes `event` to every relay currently connected. Succeeds if at
    /// least one relay accepted the frame for sending.
    pub async fn publish(&self, event: &NostrEvent) -> Result<()> {
        let frame = serde_json::to_string(&serde_json::json!(["EVENT", event]))?;
        let relays = self.relays.read().await;
        let mut sent = 0;
        for connection in relays.values() {
            if connection.state == RelayConnectionState::Connected
                && connection.outbound.send(WsMessage::Text(frame.clone())).is_ok()
            {
                sent += 1;
            }
        }
        if sent == 0 {
            return Err(Error::RelayError("no connected relay accepted the event".into()));
        }
        Ok(())
    }

    pub async fn subscribe(&self, subscription_id: &str, filter: serde_json::Value) -> Result<()> {
        let frame = serde_json::to_string(&serde_json::json!(["REQ", subscription_id, filter]))?;
        let relays = self.relays.read().await;
        for connection in relays.values() {
            if connection.state == RelayConnectionState::Connected {
                let _ = connection.outbound.send(WsMessage::Text(frame.clone()));
            }
        }
        Ok(())
    }

    pub async fn connected_relay_count(&self) -> usize {
        self.relays
            .read()
            .await
            .values()
            .filter(|c| c.state == RelayConnectionState::Connected)
            .count()
    }

    /// Drops a relay's connection. Dropping the outbound sender lets its
    /// read/write task observe a closed channel on its next select and exit.
    pub async fn remove_relay(&self, url: &str) {
        self.relays.write().await.remove(url);
    }

    pub async fn relay_status(&self) -> Vec<(String, RelayConnectionState)> {
        self.relays
            .read()
            .await
            .iter()
            .map(|(url, connection)| (url.clone(), connection.state))
            .collect()
    }
}

fn parse_event_message(text: &str) -> Result<NostrEvent> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    let array = value.as_array().ok_or_else(|| Error::InvalidPacket("relay message is not an array".into()))?;
    if array.first().and_then(|v| v.as_str()) != Some("EVENT") {
        return Err(Error::InvalidPacket("not an EVENT relay message".into()));
    }
    let event_value = array
        .get(2)
        .ok_or_else(|| Error::InvalidPacket("EVENT message missing event payload".into()))?;
    Ok(serde_json::from_value(event_value.clone())?)
}

fn base64_encode(data: &[u8]) -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let mut out = String::with_capacity(data.len().div_ceil(3) * 4);
    for chunk in data.chunks(3) {
        let b0 = chunk[0];
        let b1 = *chunk.get(1).unwrap_or(&0);
        let b2 = *chunk.get(2).unwrap_or(&0);
        let triple = ((b0 as u32) << 16) | ((b1 as u32) << 8) | b2 as u32;
        out.push(ALPHABET[((triple >> 18) & 0x3F) as usize] as char);
        out.push(ALPHABET[((triple >> 12) & 0x3F) as usize] as char);
        out.push(if chunk.len() > 1 { ALPHABET[((triple >> 6) & 0x3F) as usize] as char } else { '=' });
        out.push(if chunk.len() > 2 { ALPHABET[(triple & 0x3F) as usize] as char } else { '=' });
    }
    out
}

fn base64_decode(encoded: &str) -> Result<Vec<u8>> {
    fn value(byte: u8) -> Option<u32> {
        match byte {
            b'A'..=b'Z' => Some((byte - b'A') as u32),
            b'a'..=b'z' => Some((byte - b'a' + 26) as u32),
            b'0'..=b'9' => Some((byte - b'0' + 52) as u32),
            b'+' => Some(62),
            b'/' => Some(63),
            _ => None,
        }
    }

    let bytes: Vec<u8> = encoded.bytes().filter(|&b| b != b'=').collect();
    let mut out = Vec::with_capacity(bytes.len() * 3 / 4);
    for chunk in bytes.chunks(4) {
        let mut values = [0u32; 4];
        for (i, &byte) in chunk.iter().enumerate() {
            values[i] = value(byte).ok_or_else(|| Error::InvalidPacket("invalid base64 byte".into()))?;
        }
        let triple = (values[0] << 18) | (values[1] << 12) | (values[2] << 6) | values[3];
        out.push((triple >> 16) as u8);
        if chunk.len() > 2 {
            out.push((triple >> 8) as u8);
        }
        if chunk.len() > 3 {
            out.push(triple as u8);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64_round_trips() {
        let data = b"the quick brown fox jumps over the lazy dog";
        let encoded = base64_encode(data);
        let decoded = base64_decode(&encoded).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn gift_wrapped_dm_round_trips() {
        let secp = Secp256k1::new();
        let sender_secret = secp256k1::SecretKey::from_slice(&[7u8; 32]).unwrap();
        let sender = Keypair::from_secret_key(&secp, &sender_secret);

        let recipient_secret = secp256k1::SecretKey::from_slice(&[9u8; 32]).unwrap();
        let recipient = Keypair::from_secret_key(&secp, &recipient_secret);
        let (recipient_x_only, _) = XOnlyPublicKey::from_keypair(&recipient);

        let wrapped = gift_wrap_dm(&sender, &recipient_x_only, "hello over nostr".into(), 1_700_000_000).unwrap();
        assert_eq!(wrapped.kind, DM_KIND_GIFT_WRAP);

        let opened = open_gift_wrap(&recipient, &wrapped).unwrap();
        assert_eq!(opened, "hello over nostr");
    }
}
