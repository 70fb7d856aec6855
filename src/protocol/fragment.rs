//! Fragmentation for payloads too large for a single BLE write.
//!
//! Each fragment's payload is `message_id(8) | index(2 BE) | total(2 BE) | data`,
//! carried in a packet whose type is `FRAGMENT_START`, `FRAGMENT_CONTINUE`, or
//! `FRAGMENT_END` depending on position.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::constants::{FRAGMENT_CHUNK_SIZE, FRAGMENT_HEADER_SIZE};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub message_id: [u8; 8],
    pub index: u16,
    pub total: u16,
    pub data: Vec<u8>,
}

impl Fragment {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAGMENT_HEADER_SIZE + self.data.len());
        out.extend_from_slice(&self.message_id);
        out.write_u16::<BigEndian>(self.index).unwrap();
        out.write_u16::<BigEndian>(self.total).unwrap();
        out.extend_from_slice(&self.data);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < FRAGMENT_HEADER_SIZE {
            return Err(Error::InvalidPacket("truncated fragment header".into()));
        }
        let mut message_id = [0u8; 8];
        message_id.copy_from_slice(&bytes[0..8]);
        let mut cursor = std::io::Cursor::new(&bytes[8..12]);
        let index = cursor.read_u16::<BigEndian>()?;
        let total = cursor.read_u16::<BigEndian>()?;
        Ok(Self {
            message_id,
            index,
            total,
            data: bytes[FRAGMENT_HEADER_SIZE..].to_vec(),
        })
    }
}

/// Splits `payload` into `FRAGMENT_CHUNK_SIZE`-sized fragments. Returns an
/// empty vec if the payload fits in a single unfragmented packet.
pub fn split(message_id: [u8; 8], payload: &[u8]) -> Vec<Fragment> {
    if payload.len() <= FRAGMENT_CHUNK_SIZE {
        return Vec::new();
    }

    let chunks: Vec<&[u8]> = payload.chunks(FRAGMENT_CHUNK_SIZE).collect();
    let total = chunks.len() as u16;

    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| Fragment {
            message_id,
            index: i as u16,
            total,
            data: chunk.to_vec(),
        })
        .collect()
}

struct PendingReassembly {
    total: u16,
    parts: HashMap<u16, Vec<u8>>,
    started_at: Instant,
}

/// Reassembles fragments back into a full payload, tracking partial messages
/// with an expiry so a never-completed message doesn't leak memory forever.
pub struct Reassembler {
    pending: HashMap<[u8; 8], PendingReassembly>,
    timeout: Duration,
}

impl Reassembler {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            timeout,
        }
    }

    /// Feeds one fragment in. Returns `Some(payload)` once the final fragment
    /// for that message arrives.
    pub fn push(&mut self, fragment: Fragment) -> Result<Option<Vec<u8>>> {
        let entry = self.pending.entry(fragment.message_id).or_insert_with(|| PendingReassembly {
            total: fragment.total,
            parts: HashMap::new(),
            started_at: Instant::now(),
        });

        entry.parts.insert(fragment.index, fragment.data);

        if entry.parts.len() as u16 >= entry.total {
            let entry = self.pending.remove(&fragment.message_id).unwrap();
            let mut payload = Vec::new();
            for i in 0..entry.total {
                let part = entry
                    .parts
                    .get(&i)
                    .ok_or_else(|| Error::InvalidPacket(format!("missing fragment index {i}")))?;
                payload.extend_from_slice(part);
            }
            return Ok(Some(payload));
        }

        Ok(None)
    }

    /// Drops any in-flight reassembly older than the configured timeout,
    /// returning the message ids that were abandoned.
    pub fn expire_stale(&mut self) -> Vec<[u8; 8]> {
        let timeout = self.timeout;
        let now = Instant::now();
        let expired: Vec<[u8; 8]> = self
            .pending
            .iter()
            .filter(|(_, pending)| now.duration_since(pending.started_at) > timeout)
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            self.pending.remove(id);
        }

        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_payloads_are_not_split() {
        assert!(split([0; 8], &[0u8; 10]).is_empty());
    }

    #[test]
    fn splits_and_reassembles_in_order() {
        let message_id = [7u8; 8];
        let payload: Vec<u8> = (0..1500).map(|i| (i % 256) as u8).collect();
        let fragments = split(message_id, &payload);
        assert!(fragments.len() > 1);

        let mut reassembler = Reassembler::new(Duration::from_secs(30));
        let mut result = None;
        for fragment in fragments {
            result = reassembler.push(fragment).unwrap();
        }

        assert_eq!(result, Some(payload));
    }

    #[test]
    fn reassembles_out_of_order() {
        let message_id = [3u8; 8];
        let payload: Vec<u8> = (0..1200).map(|i| (i % 256) as u8).collect();
        let mut fragments = split(message_id, &payload);
        fragments.reverse();

        let mut reassembler = Reassembler::new(Duration::from_secs(30));
        let mut result = None;
        for fragment in fragments {
            result = reassembler.push(fragment).unwrap();
        }

        assert_eq!(result, Some(payload));
    }

    #[test]
    fn expires_stale_partial_messages() {
        let mut reassembler = Reassembler::new(Duration::from_millis(0));
        let fragment = Fragment {
            message_id: [1; 8],
            index: 0,
            total: 2,
            data: vec![1, 2, 3],
        };
        reassembler.push(fragment).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let expired = reassembler.expire_stale();
        assert_eq!(expired, vec![[1u8; 8]]);
    }
}
