//! Bloom-filter duplicate suppression for the mesh router.
//!
//! Sized for 10,000 in-flight packet ids at <=1% false-positive rate: 7 hash
//! functions over a ~100,000-bit array (`-n*ln(p)/ln(2)^2` rounded up).

use sha2::{Digest, Sha256};

use crate::protocol::PeerId;

const BLOOM_BITS: usize = 100_000;
const HASH_COUNT: usize = 7;

/// Computes the packet id used for duplicate suppression:
/// `sha256(sender_id || timestamp_be || payload[0..8])`. Only the first 8
/// payload bytes are hashed so this stays O(1) regardless of payload size.
pub fn packet_id(sender: &PeerId, timestamp: u64, payload: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(sender.as_bytes());
    hasher.update(timestamp.to_be_bytes());
    let prefix_len = payload.len().min(8);
    hasher.update(&payload[..prefix_len]);
    hasher.finalize().into()
}

struct BloomFilter {
    bits: Vec<u64>,
}

impl BloomFilter {
    fn new() -> Self {
        Self {
            bits: vec![0u64; BLOOM_BITS.div_ceil(64)],
        }
    }

    fn indices(id: &[u8; 32]) -> [usize; HASH_COUNT] {
        let mut indices = [0usize; HASH_COUNT];
        for (seed, slot) in indices.iter_mut().enumerate() {
            let mut hasher = Sha256::new();
            hasher.update([seed as u8]);
            hasher.update(id);
            let digest = hasher.finalize();
            let value = u64::from_be_bytes(digest[0..8].try_into().expect("8 bytes"));
            *slot = (value as usize) % BLOOM_BITS;
        }
        indices
    }

    fn insert(&mut self, id: &[u8; 32]) {
        for index in Self::indices(id) {
            self.bits[index / 64] |= 1 << (index % 64);
        }
    }

    fn contains(&self, id: &[u8; 32]) -> bool {
        Self::indices(id).iter().all(|&index| self.bits[index / 64] & (1 << (index % 64)) != 0)
    }

    fn clear(&mut self) {
        self.bits.iter_mut().for_each(|word| *word = 0);
    }
}

/// Duplicate suppression for relayed packets. A positive from `observe`
/// means "probably already seen, drop it"; the bloom filter never produces a
/// false negative, so a packet that should be relayed is never dropped.
pub struct Deduplicator {
    filter: BloomFilter,
    observed: usize,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self {
            filter: BloomFilter::new(),
            observed: 0,
        }
    }

    /// Returns `true` if this packet id has (probably) already been seen;
    /// records it as seen either way.
    pub fn observe(&mut self, id: &[u8; 32]) -> bool {
        let duplicate = self.filter.contains(id);
        self.filter.insert(id);
        self.observed += 1;
        duplicate
    }

    pub fn reset(&mut self) {
        self.filter.clear();
        self.observed = 0;
    }

    pub fn observed_count(&self) -> usize {
        self.observed
    }
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_observation_is_never_a_duplicate() {
        let mut dedup = Deduplicator::new();
        let id = packet_id(&PeerId::from_bytes([1; 8]), 1000, b"hello world");
        assert!(!dedup.observe(&id));
    }

    #[test]
    fn repeated_observation_is_flagged() {
        let mut dedup = Deduplicator::new();
        let id = packet_id(&PeerId::from_bytes([1; 8]), 1000, b"hello world");
        dedup.observe(&id);
        assert!(dedup.observe(&id));
    }

    #[test]
    fn packet_id_only_hashes_first_eight_payload_bytes() {
        let sender = PeerId::from_bytes([2; 8]);
        let a = packet_id(&sender, 5, b"same prefix but different tail A");
        let b = packet_id(&sender, 5, b"same prefix but different tail B");
        assert_eq!(a, b);
    }

    #[test]
    fn false_positive_rate_stays_under_one_percent_at_capacity() {
        let mut dedup = Deduplicator::new();
        let sender = PeerId::from_bytes([3; 8]);
        for i in 0..10_000u64 {
            let id = packet_id(&sender, i, &i.to_be_bytes());
            dedup.observe(&id);
        }

        let mut false_positives = 0;
        for i in 10_000..11_000u64 {
            let id = packet_id(&sender, i, &i.to_be_bytes());
            if dedup.observe(&id) {
                false_positives += 1;
            }
        }

        assert!(false_positives < 10, "false positives: {false_positives}");
    }
}
