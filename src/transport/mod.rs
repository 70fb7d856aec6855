//! Transport layer: the BLE/Nostr multiplexer that picks a physical carrier
//! per peer and drives the outbound (pad -> encrypt -> frame -> fragment) and
//! inbound (reassemble -> route -> decrypt -> unpad) pipelines around it.

#[cfg(feature = "bluetooth")]
pub mod bluetooth;
pub mod bounded_queue;
pub mod nostr;
pub mod traits;

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use secp256k1::{Keypair, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::error::{Error, Result};
use crate::mesh::{MeshRouter, RouteDecision};
use crate::protocol::constants::{
    FRAGMENT_CHUNK_SIZE, MAX_TTL, TYPE_FRAGMENT_CONTINUE, TYPE_FRAGMENT_END, TYPE_FRAGMENT_START,
    TYPE_NOISE_ENCRYPTED, TYPE_NOISE_HANDSHAKE_INIT, TYPE_NOISE_HANDSHAKE_RESP,
};
use crate::protocol::{fragment, padding, BinaryProtocol, Fragment, Packet, PeerId, Reassembler};
use crate::session::SessionManager;

#[cfg(feature = "bluetooth")]
pub use bluetooth::BluetoothTransport;
pub use nostr::{gift_wrap_dm, open_gift_wrap, NostrEvent, RelayPool};
pub use traits::Transport;

/// Where a frame came from or is headed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportAddress {
    Bluetooth(String),
    Nostr(String),
    Mesh(PeerId),
}

/// Events surfaced by a concrete [`Transport`] implementation.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connected { peer_id: PeerId, address: TransportAddress },
    Disconnected { peer_id: PeerId, reason: String },
    DataReceived { peer_id: PeerId, data: Vec<u8> },
    Error { peer_id: Option<PeerId>, error: String },
}

/// The physical carrier chosen for a given peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Ble,
    Nostr,
}

/// A fully decrypted, unpadded message handed up from the transport layer
/// once it addresses us.
#[derive(Debug, Clone)]
pub struct DeliveredMessage {
    pub from: PeerId,
    pub plaintext: Vec<u8>,
}

struct NostrState {
    pool: Arc<RelayPool>,
    identity: Keypair,
}

/// Picks BLE when a peer is directly reachable over an established session,
/// falls back to Nostr gift-wrapped DMs for mutually favorited peers, and
/// otherwise reports the peer unreachable. Owns the outbound pad/encrypt/
/// frame/fragment pipeline and the inbound reassemble/route/decrypt pipeline.
pub struct TransportMultiplexer {
    local_peer: PeerId,
    ble: Option<AsyncMutex<Box<dyn Transport>>>,
    nostr: Option<NostrState>,
    nostr_pubkeys: DashMap<PeerId, XOnlyPublicKey>,
    favorites: DashMap<PeerId, ()>,
    sessions: Arc<SessionManager>,
    router: SyncMutex<MeshRouter>,
    reassembler: SyncMutex<Reassembler>,
}

impl TransportMultiplexer {
    pub fn new(local_peer: PeerId, sessions: Arc<SessionManager>) -> Self {
        Self {
            local_peer,
            ble: None,
            nostr: None,
            nostr_pubkeys: DashMap::new(),
            favorites: DashMap::new(),
            sessions,
            router: SyncMutex::new(MeshRouter::new(local_peer)),
            reassembler: SyncMutex::new(Reassembler::new(std::time::Duration::from_secs(30))),
        }
    }

    pub fn set_ble_transport(&mut self, transport: Box<dyn Transport>) {
        self.ble = Some(AsyncMutex::new(transport));
    }

    pub fn set_nostr_pool(&mut self, pool: Arc<RelayPool>, identity: Keypair) {
        self.nostr = Some(NostrState { pool, identity });
    }

    /// Marks `peer` as mutually favorited and records the Nostr public key to
    /// gift-wrap DMs to, enabling the Nostr fallback route for that peer.
    pub fn add_favorite(&self, peer: PeerId, nostr_pubkey: XOnlyPublicKey) {
        self.favorites.insert(peer, ());
        self.nostr_pubkeys.insert(peer, nostr_pubkey);
    }

    pub fn remove_favorite(&self, peer: &PeerId) {
        self.favorites.remove(peer);
        self.nostr_pubkeys.remove(peer);
    }

    pub fn block_peer(&self, peer: PeerId) {
        self.router.lock().peers.set_trust(peer, crate::mesh::TrustLevel::Blocked);
    }

    pub fn unblock_peer(&self, peer: PeerId) {
        self.router.lock().peers.set_trust(peer, crate::mesh::TrustLevel::Untrusted);
    }

    pub fn is_blocked(&self, peer: &PeerId) -> bool {
        self.router.lock().peers.is_blocked(peer)
    }

    /// Every peer the mesh router has observed, with their current trust
    /// level, most-recently-touched order not preserved.
    pub fn known_peers(&self) -> Vec<(PeerId, crate::mesh::TrustLevel)> {
        self.router
            .lock()
            .peers
            .iter_ids()
            .into_iter()
            .collect()
    }

    pub fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    pub fn nostr_pool(&self) -> Option<Arc<RelayPool>> {
        self.nostr.as_ref().map(|state| state.pool.clone())
    }

    /// Pulls the next raw event off the BLE transport, if one is
    /// configured. Callers drive `ingest_ble_frame` off the resulting
    /// `DataReceived` events; `Connected`/`Disconnected` are surfaced
    /// as-is for the boundary layer to forward.
    pub async fn next_ble_event(&self) -> Option<TransportEvent> {
        match &self.ble {
            Some(transport) => transport.lock().await.next_event().await,
            None => std::future::pending().await,
        }
    }

    fn ble_connected(&self, peer: &PeerId) -> bool {
        self.ble
            .as_ref()
            .and_then(|m| m.try_lock().ok())
            .map(|guard| guard.is_connected(peer))
            .unwrap_or(false)
    }

    fn choose_route(&self, peer: &PeerId) -> Result<Route> {
        if self.ble_connected(peer) && self.sessions.state(peer) == crate::session::SessionPhase::Completed {
            return Ok(Route::Ble);
        }
        if self.favorites.contains_key(peer) && self.nostr.is_some() && self.nostr_pubkeys.contains_key(peer) {
            return Ok(Route::Nostr);
        }
        Err(Error::PeerUnreachable(peer.to_string()))
    }

    /// Runs the outbound pipeline for `plaintext` addressed to `peer`: pad,
    /// encrypt under the established Noise session, frame as a wire packet,
    /// fragment if needed, and transmit over whichever route is reachable.
    pub async fn send(&self, peer: PeerId, plaintext: &[u8], now_ms: u64) -> Result<()> {
        let padded = padding::pad(plaintext)?;
        let ciphertext = self.sessions.encrypt(&peer, &padded)?;
        let packet = Packet::new(TYPE_NOISE_ENCRYPTED, MAX_TTL, now_ms, self.local_peer, ciphertext)
            .with_recipient(peer);
        let encoded = BinaryProtocol::encode(&packet)?;

        match self.choose_route(&peer)? {
            Route::Ble => self.send_over_ble(peer, &encoded, now_ms).await,
            Route::Nostr => self.send_over_nostr(&peer, &encoded, now_ms).await,
        }
    }

    async fn send_over_ble(&self, peer: PeerId, encoded: &[u8], now_ms: u64) -> Result<()> {
        let ble = self
            .ble
            .as_ref()
            .ok_or_else(|| Error::TransportUnavailable("no BLE transport configured".into()))?;
        let mut guard = ble.lock().await;

        if encoded.len() <= FRAGMENT_CHUNK_SIZE {
            return guard.send(peer, encoded.to_vec()).await;
        }

        let message_id: [u8; 8] = rand::random();
        let fragments = fragment::split(message_id, encoded);
        let total = fragments.len();
        for (index, frag) in fragments.into_iter().enumerate() {
            let packet_type = if index == 0 {
                TYPE_FRAGMENT_START
            } else if index == total - 1 {
                TYPE_FRAGMENT_END
            } else {
                TYPE_FRAGMENT_CONTINUE
            };
            let wrapper = Packet::new(packet_type, MAX_TTL, now_ms, self.local_peer, frag.encode());
            let wire = BinaryProtocol::encode(&wrapper)?;
            guard.send(peer, wire).await?;
        }
        Ok(())
    }

    async fn send_over_nostr(&self, peer: &PeerId, encoded: &[u8], now_ms: u64) -> Result<()> {
        let state = self
            .nostr
            .as_ref()
            .ok_or_else(|| Error::TransportUnavailable("no Nostr relay pool configured".into()))?;
        let their_pubkey = self
            .nostr_pubkeys
            .get(peer)
            .ok_or_else(|| Error::PeerUnreachable(peer.to_string()))?;

        let their_pubkey: XOnlyPublicKey = *their_pubkey;
        let content = hex::encode(encoded);
        let gift_wrap = gift_wrap_dm(&state.identity, &their_pubkey, content, now_ms as i64 / 1000)?;
        state.pool.publish(&gift_wrap).await
    }

    /// Runs the inbound pipeline on one wire frame received from `from` over
    /// BLE: reassembles fragments, routes through the mesh, and decrypts the
    /// payload once it is addressed to us.
    pub async fn ingest_ble_frame(&self, from: PeerId, frame: &[u8], now_ms: u64) -> Result<Option<DeliveredMessage>> {
        let outer = BinaryProtocol::decode(frame)?;

        let resolved = match outer.packet_type {
            TYPE_FRAGMENT_START | TYPE_FRAGMENT_CONTINUE | TYPE_FRAGMENT_END => {
                let piece = Fragment::decode(&outer.payload)?;
                let reassembled = self.reassembler.lock().push(piece)?;
                match reassembled {
                    Some(payload) => BinaryProtocol::decode(&payload)?,
                    None => return Ok(None),
                }
            }
            _ => outer,
        };

        self.route_and_deliver(from, resolved, now_ms).await
    }

    /// Runs the inbound pipeline on a gift-wrapped Nostr event addressed to
    /// us: unwraps it, decodes the hex-encoded wire frame, then routes and
    /// decrypts exactly as the BLE path does.
    pub async fn ingest_nostr_event(&self, event: &NostrEvent, now_ms: u64) -> Result<Option<DeliveredMessage>> {
        let state = self
            .nostr
            .as_ref()
            .ok_or_else(|| Error::TransportUnavailable("no Nostr relay pool configured".into()))?;
        let content = open_gift_wrap(&state.identity, event)?;
        let frame = hex::decode(&content)
            .map_err(|_| Error::InvalidPacket("gift-wrapped content is not valid hex".into()))?;
        let packet = BinaryProtocol::decode(&frame)?;
        let from = packet.sender;
        self.route_and_deliver(from, packet, now_ms).await
    }

    async fn route_and_deliver(&self, from: PeerId, packet: Packet, now_ms: u64) -> Result<Option<DeliveredMessage>> {
        let decision = self.router.lock().handle_inbound(from, packet, now_ms);

        match decision {
            RouteDecision::Deliver(packet) => self.deliver(from, packet, now_ms).await,
            RouteDecision::DeliverAndRelay(packet, relayed) => {
                let delivered = self.deliver(from, packet, now_ms).await?;
                self.relay(relayed).await?;
                Ok(delivered)
            }
            RouteDecision::Relay(packet) => {
                self.relay(packet).await?;
                Ok(None)
            }
            RouteDecision::Drop(_) => Ok(None),
        }
    }

    /// Starts a Noise handshake with `peer` as initiator, sending the first
    /// wire message over BLE.
    pub async fn initiate_handshake(&self, peer: PeerId, now_ms: u64) -> Result<()> {
        let message = self.sessions.initiate(peer)?;
        let packet = Packet::new(TYPE_NOISE_HANDSHAKE_INIT, MAX_TTL, now_ms, self.local_peer, message)
            .with_recipient(peer);
        let encoded = BinaryProtocol::encode(&packet)?;
        self.send_raw_over_ble(peer, &encoded).await
    }

    async fn send_raw_over_ble(&self, peer: PeerId, encoded: &[u8]) -> Result<()> {
        let ble = self
            .ble
            .as_ref()
            .ok_or_else(|| Error::TransportUnavailable("no BLE transport configured".into()))?;
        ble.lock().await.send(peer, encoded.to_vec()).await
    }

    async fn deliver(&self, from: PeerId, packet: Packet, now_ms: u64) -> Result<Option<DeliveredMessage>> {
        match packet.packet_type {
            TYPE_NOISE_HANDSHAKE_INIT | TYPE_NOISE_HANDSHAKE_RESP => {
                if let Some(response) = self.sessions.on_inbound(packet.sender, &packet.payload)? {
                    let reply = Packet::new(TYPE_NOISE_HANDSHAKE_RESP, MAX_TTL, now_ms, self.local_peer, response)
                        .with_recipient(packet.sender);
                    let encoded = BinaryProtocol::encode(&reply)?;
                    self.send_raw_over_ble(from, &encoded).await?;
                }
                Ok(None)
            }
            TYPE_NOISE_ENCRYPTED => {
                let padded = self.sessions.decrypt(&packet.sender, &packet.payload)?;
                let plaintext = padding::unpad(&padded)?;
                Ok(Some(DeliveredMessage {
                    from: packet.sender,
                    plaintext,
                }))
            }
            _ => Ok(None),
        }
    }

    async fn relay(&self, packet: Packet) -> Result<()> {
        let encoded = BinaryProtocol::encode(&packet)?;
        if let Some(ble) = &self.ble {
            let mut guard = ble.lock().await;
            for peer in guard.connected_peers() {
                let _ = guard.send(peer, encoded.clone()).await;
            }
        }
        Ok(())
    }

    /// Drops reassembly state for partial messages that have been pending
    /// longer than the reassembler's timeout.
    pub fn expire_stale_fragments(&self) -> Vec<[u8; 8]> {
        self.reassembler.lock().expire_stale()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Identity;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use tokio::sync::Mutex as TokioMutex;

    /// An in-memory BLE stand-in that records what was sent to each peer so
    /// tests can assert on the multiplexer's framing without real Bluetooth.
    struct RecordingTransport {
        connected: HashSet<PeerId>,
        sent: TokioMutex<Vec<(PeerId, Vec<u8>)>>,
    }

    impl RecordingTransport {
        fn new(connected: &[PeerId]) -> Self {
            Self {
                connected: connected.iter().copied().collect(),
                sent: TokioMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn listen(&mut self, _address: TransportAddress) -> Result<()> {
            Ok(())
        }

        async fn connect(&mut self, _address: TransportAddress) -> Result<PeerId> {
            Err(Error::TransportUnavailable("not used in tests".into()))
        }

        async fn send(&mut self, peer_id: PeerId, data: Vec<u8>) -> Result<()> {
            self.sent.lock().await.push((peer_id, data));
            Ok(())
        }

        async fn disconnect(&mut self, peer_id: PeerId) -> Result<()> {
            self.connected.remove(&peer_id);
            Ok(())
        }

        fn is_connected(&self, peer_id: &PeerId) -> bool {
            self.connected.contains(peer_id)
        }

        fn connected_peers(&self) -> Vec<PeerId> {
            self.connected.iter().copied().collect()
        }

        async fn next_event(&mut self) -> Option<TransportEvent> {
            None
        }
    }

    #[tokio::test]
    async fn routes_to_ble_for_a_connected_completed_session() {
        let alice_identity = Arc::new(Identity::generate());
        let bob_identity = Arc::new(Identity::generate());
        let (alice_sessions, _rx) = SessionManager::new(alice_identity.clone());
        let (bob_sessions, _rx2) = SessionManager::new(bob_identity.clone());

        let bob_peer = bob_identity.peer_id();
        let alice_peer = alice_identity.peer_id();

        let msg1 = alice_sessions.initiate(bob_peer).unwrap();
        let msg2 = bob_sessions.on_inbound(alice_peer, &msg1).unwrap().unwrap();
        alice_sessions.on_inbound(bob_peer, &msg2).unwrap();

        let mut multiplexer = TransportMultiplexer::new(alice_peer, alice_sessions);
        multiplexer.set_ble_transport(Box::new(RecordingTransport::new(&[bob_peer])));

        multiplexer.send(bob_peer, b"hello over ble", 1000).await.unwrap();

        let ble = multiplexer.ble.as_ref().unwrap().lock().await;
        // downcasting isn't available for the trait object in this test; the
        // call succeeding at all demonstrates the BLE route was taken, since
        // no Nostr pool was configured and the peer isn't a favorite.
        drop(ble);
        assert_eq!(multiplexer.choose_route(&bob_peer).unwrap(), Route::Ble);
    }

    #[test]
    fn unreachable_peer_is_reported_as_such() {
        let identity = Arc::new(Identity::generate());
        let (sessions, _rx) = SessionManager::new(identity.clone());
        let multiplexer = TransportMultiplexer::new(identity.peer_id(), sessions);
        let stranger = PeerId::from_bytes([9; 8]);

        assert!(matches!(multiplexer.choose_route(&stranger), Err(Error::PeerUnreachable(_))));
    }
}
