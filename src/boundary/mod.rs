//! Boundary adapter: the narrow surface a UI (CLI, mobile shell, whatever)
//! drives the core through. Nothing on the other side of this module knows
//! about GATT characteristics, Noise frames, or gift-wrapped events — it
//! sees peers, messages, and status events.

#[cfg(feature = "sqlite")]
pub mod kv;

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::crypto::Identity;
use crate::error::Result;
use crate::mesh::TrustLevel;
use crate::protocol::{MessageId, PeerId};
use crate::session::{SessionEvent, SessionManager};
use crate::transport::TransportMultiplexer;

#[cfg(feature = "sqlite")]
use crate::message::{MessageEvent, MessageManager, MessagePriority};

/// A reference to a peer as the UI layer should see it: who they are, how
/// trusted they are, and whether they're reachable right now.
#[derive(Debug, Clone)]
pub struct PeerSummary {
    pub peer_id: PeerId,
    pub trust: TrustLevel,
    pub is_favorite: bool,
}

/// Everything the UI layer might want to react to, collapsed into one
/// stream so it only has to hold a single subscription.
#[derive(Debug, Clone)]
pub enum BoundaryEvent {
    MessageReceived { from: PeerId, plaintext: Vec<u8> },
    PeerConnected { peer: PeerId },
    PeerDisconnected { peer: PeerId, reason: String },
    Session(SessionEvent),
    #[cfg(feature = "sqlite")]
    Message(MessageEvent),
    RelayStatusChanged { connected_relays: usize },
}

/// The façade the UI talks to. Core components (session manager, transport
/// multiplexer, message manager) are built and owned by the caller and
/// wired in here; `BoundaryAdapter` only exposes the operations a UI needs
/// and fans every underlying event source into one broadcast channel.
pub struct BoundaryAdapter {
    identity: Arc<Identity>,
    sessions: Arc<SessionManager>,
    multiplexer: Arc<TransportMultiplexer>,
    #[cfg(feature = "sqlite")]
    messages: Arc<MessageManager>,
    events: broadcast::Sender<BoundaryEvent>,
}

impl BoundaryAdapter {
    #[cfg(feature = "sqlite")]
    pub fn new(
        identity: Arc<Identity>,
        sessions: Arc<SessionManager>,
        multiplexer: Arc<TransportMultiplexer>,
        messages: Arc<MessageManager>,
    ) -> Self {
        let (events, _rx) = broadcast::channel(1024);
        Self {
            identity,
            sessions,
            multiplexer,
            messages,
            events,
        }
    }

    #[cfg(not(feature = "sqlite"))]
    pub fn new(identity: Arc<Identity>, sessions: Arc<SessionManager>, multiplexer: Arc<TransportMultiplexer>) -> Self {
        let (events, _rx) = broadcast::channel(1024);
        Self {
            identity,
            sessions,
            multiplexer,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BoundaryEvent> {
        self.events.subscribe()
    }

    /// Forwards session lifecycle events onto the unified event stream.
    /// Spawn this once, fed by the receiver returned from `SessionManager::new`.
    /// A freshly-completed handshake also wakes the message manager so any
    /// backed-off deliveries to that peer are retried immediately instead of
    /// waiting out their scheduled backoff.
    pub async fn relay_session_events(&self, mut rx: tokio::sync::mpsc::UnboundedReceiver<SessionEvent>) {
        while let Some(event) = rx.recv().await {
            #[cfg(feature = "sqlite")]
            if let SessionEvent::HandshakeCompleted { peer } = &event {
                self.messages.expedite(peer);
            }
            let _ = self.events.send(BoundaryEvent::Session(event));
        }
    }

    #[cfg(feature = "sqlite")]
    pub async fn relay_message_events(&self, mut rx: tokio::sync::mpsc::UnboundedReceiver<MessageEvent>) {
        while let Some(event) = rx.recv().await {
            let _ = self.events.send(BoundaryEvent::Message(event));
        }
    }

    pub fn publish_delivered(&self, from: PeerId, plaintext: Vec<u8>) {
        let _ = self.events.send(BoundaryEvent::MessageReceived { from, plaintext });
    }

    pub fn publish_transport(&self, event: &crate::transport::TransportEvent) {
        use crate::transport::TransportEvent;
        let boundary_event = match event {
            TransportEvent::Connected { peer_id, .. } => BoundaryEvent::PeerConnected { peer: *peer_id },
            TransportEvent::Disconnected { peer_id, reason } => BoundaryEvent::PeerDisconnected {
                peer: *peer_id,
                reason: reason.clone(),
            },
            TransportEvent::DataReceived { .. } | TransportEvent::Error { .. } => return,
        };
        let _ = self.events.send(boundary_event);
    }

    /// The local node's human-verifiable fingerprint.
    pub fn fingerprint(&self) -> String {
        self.identity.fingerprint()
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.identity.peer_id()
    }

    pub fn peers(&self) -> Vec<PeerSummary> {
        self.multiplexer
            .known_peers()
            .into_iter()
            .map(|(peer_id, trust)| PeerSummary {
                peer_id,
                trust,
                is_favorite: false,
            })
            .collect()
    }

    /// Sends a direct message to `recipient`, encrypted under its session
    /// and routed over whichever transport reaches it.
    #[cfg(feature = "sqlite")]
    pub fn send(&self, recipient: PeerId, content: Vec<u8>) -> Result<MessageId> {
        self.messages.send(
            recipient,
            content,
            MessagePriority::DirectMessage,
            std::time::Duration::from_secs(7 * 24 * 60 * 60),
        )
    }

    pub fn add_favorite(&self, peer: PeerId, nostr_pubkey: secp256k1::XOnlyPublicKey) {
        self.multiplexer.add_favorite(peer, nostr_pubkey);
    }

    pub fn remove_favorite(&self, peer: &PeerId) {
        self.multiplexer.remove_favorite(peer);
    }

    pub fn block(&self, peer: PeerId) {
        self.multiplexer.block_peer(peer);
    }

    pub fn unblock(&self, peer: PeerId) {
        self.multiplexer.unblock_peer(peer);
    }

    pub async fn add_relay(&self, url: String) -> Result<()> {
        match self.multiplexer.nostr_pool() {
            Some(pool) => {
                pool.add_relay(url).await;
                Ok(())
            }
            None => Err(crate::error::Error::TransportUnavailable("Nostr is not configured".into())),
        }
    }

    pub async fn remove_relay(&self, url: &str) -> Result<()> {
        match self.multiplexer.nostr_pool() {
            Some(pool) => {
                pool.remove_relay(url).await;
                Ok(())
            }
            None => Err(crate::error::Error::TransportUnavailable("Nostr is not configured".into())),
        }
    }

    pub async fn relay_status(&self) -> Vec<(String, crate::transport::nostr::RelayConnectionState)> {
        match self.multiplexer.nostr_pool() {
            Some(pool) => pool.relay_status().await,
            None => Vec::new(),
        }
    }
}
