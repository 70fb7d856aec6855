//! Mesh router: peer registry, shortest-hop routing table, TTL policing,
//! clock-skew rejection, and bloom-filter duplicate suppression.

pub mod deduplication;

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use deduplication::{packet_id, Deduplicator};

use crate::protocol::constants::{TYPE_ANNOUNCE, TYPE_LEAVE};
use crate::protocol::{Packet, PeerId};

/// Packets more than this far from our clock (either direction) are
/// rejected outright rather than routed.
pub const MAX_CLOCK_SKEW: Duration = Duration::from_secs(5 * 60);
/// Routes not refreshed within this window are evicted.
const ROUTE_IDLE_TIMEOUT: Duration = Duration::from_secs(10 * 60);
/// Upper bound on tracked peers; oldest-touched entries are evicted first.
const PEER_REGISTRY_CAPACITY: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustLevel {
    Untrusted,
    Verified,
    Trusted,
    Blocked,
}

#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub trust: TrustLevel,
    pub first_seen: Instant,
    pub last_seen: Instant,
}

/// Tracks known peers and their trust level, with LRU eviction once
/// [`PEER_REGISTRY_CAPACITY`] is exceeded.
pub struct PeerRegistry {
    peers: HashMap<PeerId, PeerRecord>,
    touch_order: VecDeque<PeerId>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self {
            peers: HashMap::new(),
            touch_order: VecDeque::new(),
        }
    }

    fn touch(&mut self, peer: PeerId) {
        self.touch_order.retain(|&p| p != peer);
        self.touch_order.push_back(peer);
        while self.touch_order.len() > PEER_REGISTRY_CAPACITY {
            if let Some(oldest) = self.touch_order.pop_front() {
                self.peers.remove(&oldest);
            }
        }
    }

    pub fn announce(&mut self, peer: PeerId) {
        let now = Instant::now();
        self.peers
            .entry(peer)
            .and_modify(|record| record.last_seen = now)
            .or_insert(PeerRecord {
                trust: TrustLevel::Untrusted,
                first_seen: now,
                last_seen: now,
            });
        self.touch(peer);
    }

    pub fn leave(&mut self, peer: &PeerId) {
        self.peers.remove(peer);
        self.touch_order.retain(|p| p != peer);
    }

    pub fn set_trust(&mut self, peer: PeerId, trust: TrustLevel) {
        self.peers
            .entry(peer)
            .and_modify(|record| record.trust = trust)
            .or_insert(PeerRecord {
                trust,
                first_seen: Instant::now(),
                last_seen: Instant::now(),
            });
    }

    pub fn is_blocked(&self, peer: &PeerId) -> bool {
        matches!(self.peers.get(peer), Some(record) if record.trust == TrustLevel::Blocked)
    }

    pub fn get(&self, peer: &PeerId) -> Option<&PeerRecord> {
        self.peers.get(peer)
    }

    /// Every tracked peer with its current trust level.
    pub fn iter_ids(&self) -> Vec<(PeerId, TrustLevel)> {
        self.peers.iter().map(|(peer, record)| (*peer, record.trust)).collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
struct RouteEntry {
    next_hop: PeerId,
    hop_count: u8,
    last_seen: Instant,
}

/// Shortest-hop-count route to each known destination, with idle expiry.
pub struct RoutingTable {
    routes: HashMap<PeerId, RouteEntry>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self {
            routes: HashMap::new(),
        }
    }

    pub fn record(&mut self, destination: PeerId, next_hop: PeerId, hop_count: u8) {
        let now = Instant::now();
        let should_replace = match self.routes.get(&destination) {
            Some(existing) => hop_count < existing.hop_count || existing.next_hop == next_hop,
            None => true,
        };
        if should_replace {
            self.routes.insert(
                destination,
                RouteEntry {
                    next_hop,
                    hop_count,
                    last_seen: now,
                },
            );
        }
    }

    pub fn next_hop(&self, destination: &PeerId) -> Option<PeerId> {
        self.routes.get(destination).map(|route| route.next_hop)
    }

    pub fn expire_idle(&mut self) {
        let now = Instant::now();
        self.routes
            .retain(|_, route| now.duration_since(route.last_seen) <= ROUTE_IDLE_TIMEOUT);
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Duplicate,
    TtlExhausted,
    PeerBlocked,
    ClockSkew,
}

#[derive(Debug, Clone)]
pub enum RouteDecision {
    /// Addressed directly to us; hand to the session/message layer only.
    Deliver(Packet),
    /// A broadcast with hops left: deliver locally *and* forward the
    /// ttl-decremented copy so flood routing reaches the next hop.
    DeliverAndRelay(Packet, Packet),
    /// Not addressed to us and still has hops left; forward after
    /// decrementing TTL.
    Relay(Packet),
    Drop(DropReason),
}

/// Decides, per inbound packet, whether to deliver it locally, relay it
/// onward, or drop it — the core of the flood-routing mesh.
pub struct MeshRouter {
    local_peer: PeerId,
    dedup: Deduplicator,
    pub peers: PeerRegistry,
    pub routes: RoutingTable,
}

impl MeshRouter {
    pub fn new(local_peer: PeerId) -> Self {
        Self {
            local_peer,
            dedup: Deduplicator::new(),
            peers: PeerRegistry::new(),
            routes: RoutingTable::new(),
        }
    }

    /// `from` is the peer that handed us this packet over the transport
    /// (not necessarily `packet.sender`); `now_ms` is our local clock in
    /// milliseconds since the epoch.
    pub fn handle_inbound(&mut self, from: PeerId, packet: Packet, now_ms: u64) -> RouteDecision {
        if self.peers.is_blocked(&packet.sender) {
            return RouteDecision::Drop(DropReason::PeerBlocked);
        }

        let skew = now_ms.abs_diff(packet.timestamp);
        if skew > MAX_CLOCK_SKEW.as_millis() as u64 {
            return RouteDecision::Drop(DropReason::ClockSkew);
        }

        let id = packet_id(&packet.sender, packet.timestamp, &packet.payload);
        if self.dedup.observe(&id) {
            return RouteDecision::Drop(DropReason::Duplicate);
        }

        match packet.packet_type {
            TYPE_ANNOUNCE => self.peers.announce(packet.sender),
            TYPE_LEAVE => self.peers.leave(&packet.sender),
            _ => self.peers.announce(packet.sender),
        }

        let hop_count = crate::protocol::constants::MAX_TTL.saturating_sub(packet.ttl) + 1;
        self.routes.record(packet.sender, from, hop_count);

        let is_broadcast = match packet.recipient {
            None => true,
            Some(recipient) => recipient.is_broadcast(),
        };
        let addressed_to_us = is_broadcast || packet.recipient == Some(self.local_peer);

        if addressed_to_us {
            // Broadcast chatter both lands here and keeps flooding outward;
            // a direct message is consumed and goes no further.
            if is_broadcast && !packet.is_expired_ttl() {
                let relayed = packet.relayed();
                return RouteDecision::DeliverAndRelay(packet, relayed);
            }
            return RouteDecision::Deliver(packet);
        }

        if packet.is_expired_ttl() {
            return RouteDecision::Drop(DropReason::TtlExhausted);
        }

        RouteDecision::Relay(packet.relayed())
    }
}
