//! Noise session lifecycle: per-peer handshake orchestration, transport
//! encryption, and idle/timeout sweeping.
//!
//! Three states per peer: `None` (no session), `Initiated` (a handshake is
//! in flight, bounded by a 30s deadline), and `Completed` (split transport
//! ciphers are in place). A background sweep evicts handshakes that never
//! finish and sessions idle past 60 minutes.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::crypto::{fingerprint_from_public_key, HandshakeState, Identity, NoiseKeyPair, Transport};
use crate::error::{Error, Result};
use crate::protocol::PeerId;

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60 * 60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    None,
    Initiated,
    Completed,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    HandshakeCompleted { peer: PeerId },
    HandshakeFailed { peer: PeerId, reason: String },
    SessionClosed { peer: PeerId },
}

struct PendingHandshake {
    handshake: HandshakeState,
    started_at: Instant,
}

struct EstablishedSession {
    transport: Transport,
    established_at: Instant,
    last_activity: Instant,
}

/// Owns every peer's Noise session state. Cheap to clone (internals are
/// `Arc`-shared) so it can be handed to the transport multiplexer and the
/// idle-sweep task alike.
pub struct SessionManager {
    identity: Arc<Identity>,
    pending: DashMap<PeerId, PendingHandshake>,
    sessions: DashMap<PeerId, EstablishedSession>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionManager {
    pub fn new(identity: Arc<Identity>) -> (Arc<Self>, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            identity,
            pending: DashMap::new(),
            sessions: DashMap::new(),
            events,
        });
        (manager, rx)
    }

    pub fn state(&self, peer: &PeerId) -> SessionPhase {
        if self.sessions.contains_key(peer) {
            SessionPhase::Completed
        } else if self.pending.contains_key(peer) {
            SessionPhase::Initiated
        } else {
            SessionPhase::None
        }
    }

    fn local_static(&self) -> NoiseKeyPair {
        NoiseKeyPair::from_bytes(self.identity.noise_keypair.private_bytes())
    }

    /// Starts a handshake as initiator, returning the first wire message.
    pub fn initiate(&self, peer: PeerId) -> Result<Vec<u8>> {
        if self.sessions.contains_key(&peer) || self.pending.contains_key(&peer) {
            return Err(Error::HandshakeInProgress(peer.to_string()));
        }

        let mut handshake = HandshakeState::initiator(self.local_static());
        let message = handshake.write_message()?;
        self.pending.insert(
            peer,
            PendingHandshake {
                handshake,
                started_at: Instant::now(),
            },
        );
        Ok(message)
    }

    /// Feeds in an inbound handshake message, responding as initiator or
    /// responder depending on whether a handshake for `peer` is already in
    /// flight. Returns the next wire message to send, if any.
    pub fn on_inbound(&self, peer: PeerId, message: &[u8]) -> Result<Option<Vec<u8>>> {
        if self.sessions.contains_key(&peer) {
            return Err(Error::HandshakeInProgress(peer.to_string()));
        }

        if let Some(mut entry) = self.pending.get_mut(&peer) {
            entry.handshake.read_message(message)?;

            if entry.handshake.is_complete() {
                drop(entry);
                self.complete_handshake(peer)?;
                return Ok(None);
            }

            let response = entry.handshake.write_message()?;
            let complete = entry.handshake.is_complete();
            drop(entry);

            if complete {
                self.complete_handshake(peer)?;
            }

            Ok(Some(response))
        } else {
            let mut handshake = HandshakeState::responder(self.local_static());
            handshake.read_message(message)?;
            let response = handshake.write_message()?;
            self.pending.insert(
                peer,
                PendingHandshake {
                    handshake,
                    started_at: Instant::now(),
                },
            );
            Ok(Some(response))
        }
    }

    fn complete_handshake(&self, peer: PeerId) -> Result<()> {
        let (_, pending) = self
            .pending
            .remove(&peer)
            .ok_or_else(|| Error::NoSession(peer.to_string()))?;

        let transport = pending.handshake.into_transport()?;
        let now = Instant::now();
        self.sessions.insert(
            peer,
            EstablishedSession {
                transport,
                established_at: now,
                last_activity: now,
            },
        );
        let _ = self.events.send(SessionEvent::HandshakeCompleted { peer });
        Ok(())
    }

    pub fn encrypt(&self, peer: &PeerId, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut session = self
            .sessions
            .get_mut(peer)
            .ok_or_else(|| Error::NoSession(peer.to_string()))?;
        session.last_activity = Instant::now();
        session.transport.send.encrypt_with_ad(b"", plaintext)
    }

    pub fn decrypt(&self, peer: &PeerId, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let mut session = self
            .sessions
            .get_mut(peer)
            .ok_or_else(|| Error::NoSession(peer.to_string()))?;
        session.last_activity = Instant::now();
        session.transport.receive.decrypt_with_ad(b"", ciphertext)
    }

    /// The remote's human-verifiable fingerprint, once a session is
    /// established — derived from the static key exchanged during the
    /// handshake, not from any claim the peer makes afterward.
    pub fn remote_fingerprint(&self, peer: &PeerId) -> Option<String> {
        self.sessions
            .get(peer)
            .map(|session| fingerprint_from_public_key(&session.transport.remote_static))
    }

    pub fn close(&self, peer: &PeerId) {
        self.pending.remove(peer);
        if self.sessions.remove(peer).is_some() {
            let _ = self.events.send(SessionEvent::SessionClosed { peer: *peer });
        }
    }

    pub fn established_peers(&self) -> Vec<PeerId> {
        self.sessions.iter().map(|entry| *entry.key()).collect()
    }

    fn sweep_once(&self) {
        let now = Instant::now();

        let timed_out: Vec<PeerId> = self
            .pending
            .iter()
            .filter(|entry| now.duration_since(entry.started_at) > HANDSHAKE_TIMEOUT)
            .map(|entry| *entry.key())
            .collect();

        for peer in timed_out {
            self.pending.remove(&peer);
            let _ = self.events.send(SessionEvent::HandshakeFailed {
                peer,
                reason: "handshake timed out".into(),
            });
        }

        let idle: Vec<PeerId> = self
            .sessions
            .iter()
            .filter(|entry| now.duration_since(entry.last_activity) > IDLE_TIMEOUT)
            .map(|entry| *entry.key())
            .collect();

        for peer in idle {
            self.sessions.remove(&peer);
            let _ = self.events.send(SessionEvent::SessionClosed { peer });
        }
    }

    /// Runs forever, periodically evicting stalled handshakes and idle
    /// sessions. Spawn this once per `SessionManager` instance.
    pub async fn run_idle_sweep(self: Arc<Self>) {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            self.sweep_once();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_handshake_establishes_session_on_both_sides() {
        let alice_identity = Arc::new(Identity::generate());
        let bob_identity = Arc::new(Identity::generate());
        let (alice, _rx_a) = SessionManager::new(alice_identity.clone());
        let (bob, _rx_b) = SessionManager::new(bob_identity.clone());

        let bob_peer = bob_identity.peer_id();
        let alice_peer = alice_identity.peer_id();

        let msg1 = alice.initiate(bob_peer).unwrap();
        assert_eq!(alice.state(&bob_peer), SessionPhase::Initiated);

        let msg2 = bob.on_inbound(alice_peer, &msg1).unwrap().unwrap();
        let msg3 = alice.on_inbound(bob_peer, &msg2).unwrap().unwrap();
        assert!(bob.on_inbound(alice_peer, &msg3).unwrap().is_none());

        assert_eq!(alice.state(&bob_peer), SessionPhase::Completed);
        assert_eq!(bob.state(&alice_peer), SessionPhase::Completed);

        let ciphertext = alice.encrypt(&bob_peer, b"hello bob").unwrap();
        let plaintext = bob.decrypt(&alice_peer, &ciphertext).unwrap();
        assert_eq!(plaintext, b"hello bob");

        assert_eq!(
            bob.remote_fingerprint(&alice_peer),
            Some(alice_identity.fingerprint())
        );
    }

    #[test]
    fn cannot_initiate_twice_concurrently() {
        let identity = Arc::new(Identity::generate());
        let (manager, _rx) = SessionManager::new(identity);
        let peer = PeerId::from_bytes([9; 8]);

        manager.initiate(peer).unwrap();
        assert!(manager.initiate(peer).is_err());
    }

    #[test]
    fn encrypt_without_session_fails() {
        let identity = Arc::new(Identity::generate());
        let (manager, _rx) = SessionManager::new(identity);
        let peer = PeerId::from_bytes([1; 8]);

        assert!(manager.encrypt(&peer, b"hi").is_err());
    }
}
