//! Core wire-level types: peer identifiers and the decoded packet.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::constants::{PEER_ID_SIZE, SIGNATURE_SIZE};

/// Short peer identifier carried on the wire. Derived from the peer's static
/// public key (first 8 bytes of its SHA-256 digest); the full key is the
/// authoritative identity, this is only a routing shorthand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub [u8; PEER_ID_SIZE]);

impl PeerId {
    pub const BROADCAST: PeerId = PeerId(super::constants::BROADCAST_ID);

    pub fn from_bytes(bytes: [u8; PEER_ID_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PEER_ID_SIZE] {
        &self.0
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl TryFrom<&[u8]> for PeerId {
    type Error = crate::error::Error;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let arr: [u8; PEER_ID_SIZE] = bytes
            .try_into()
            .map_err(|_| crate::error::Error::InvalidPacket("peer id length mismatch".into()))?;
        Ok(Self(arr))
    }
}

/// ULID-backed message identifier, distinct from the wire `PeerId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub [u8; 16]);

impl MessageId {
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_bytes())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", ulid::Ulid::from_bytes(self.0))
    }
}

/// A fully decoded wire packet. `encode`/`decode` live in [`super::binary`];
/// this type only carries the parsed fields plus the builder conveniences
/// callers use to assemble one before encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub version: u8,
    pub packet_type: u8,
    pub ttl: u8,
    pub timestamp: u64,
    pub flags: u8,
    pub sender: PeerId,
    pub recipient: Option<PeerId>,
    pub payload: Vec<u8>,
    pub signature: Option<[u8; SIGNATURE_SIZE]>,
}

impl Packet {
    pub fn new(packet_type: u8, ttl: u8, timestamp: u64, sender: PeerId, payload: Vec<u8>) -> Self {
        Self {
            version: super::constants::PROTOCOL_VERSION,
            packet_type,
            ttl,
            timestamp,
            flags: 0,
            sender,
            recipient: None,
            payload,
            signature: None,
        }
    }

    pub fn with_recipient(mut self, recipient: PeerId) -> Self {
        self.recipient = Some(recipient);
        self.flags |= super::constants::FLAG_HAS_RECIPIENT;
        self
    }

    pub fn with_signature(mut self, signature: [u8; SIGNATURE_SIZE]) -> Self {
        self.signature = Some(signature);
        self.flags |= super::constants::FLAG_HAS_SIGNATURE;
        self
    }

    pub fn mark_compressed(mut self) -> Self {
        self.flags |= super::constants::FLAG_IS_COMPRESSED;
        self
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & super::constants::FLAG_IS_COMPRESSED != 0
    }

    pub fn has_recipient(&self) -> bool {
        self.flags & super::constants::FLAG_HAS_RECIPIENT != 0
    }

    pub fn has_signature(&self) -> bool {
        self.flags & super::constants::FLAG_HAS_SIGNATURE != 0
    }

    /// True once `ttl` reaches zero and the packet can no longer be relayed.
    pub fn is_expired_ttl(&self) -> bool {
        self.ttl == 0
    }

    /// Returns a copy with `ttl` decremented by one, saturating at zero.
    pub fn relayed(&self) -> Self {
        let mut next = self.clone();
        next.ttl = next.ttl.saturating_sub(1);
        next
    }
}
