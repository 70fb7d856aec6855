//! Static identity key material: the X25519 key pair used for Noise
//! handshakes, an Ed25519 signing key pair for announcement signatures, and
//! derived fingerprints / Nostr keys.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::protocol::PeerId;

#[derive(Clone)]
pub struct NoiseKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl std::fmt::Debug for NoiseKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoiseKeyPair")
            .field("public", &hex::encode(self.public.as_bytes()))
            .finish_non_exhaustive()
    }
}

impl NoiseKeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn from_bytes(private_bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(private_bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    pub fn private_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    pub fn diffie_hellman(&self, their_public: &[u8; 32]) -> [u8; 32] {
        let their_public = PublicKey::from(*their_public);
        self.secret.diffie_hellman(&their_public).to_bytes()
    }
}

#[derive(Debug, Clone)]
pub struct SigningKeyPair {
    pub signing_key: SigningKey,
    pub verifying_key: VerifyingKey,
}

impl SigningKeyPair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    pub fn from_bytes(private_bytes: [u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(&private_bytes);
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn verify(
        verifying_key: &VerifyingKey,
        message: &[u8],
        signature: &Signature,
    ) -> Result<(), ed25519_dalek::SignatureError> {
        verifying_key.verify(message, signature)
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    pub fn private_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }
}

/// A node's full identity: the Noise static key pair plus a signing key pair
/// used to authenticate announcements.
#[derive(Debug, Clone)]
pub struct Identity {
    pub noise_keypair: NoiseKeyPair,
    pub signing_keypair: SigningKeyPair,
}

impl Identity {
    pub fn generate() -> Self {
        Self {
            noise_keypair: NoiseKeyPair::generate(),
            signing_keypair: SigningKeyPair::generate(),
        }
    }

    /// Short wire identifier: first 8 bytes of `SHA-256(static_public_key)`.
    pub fn peer_id(&self) -> PeerId {
        peer_id_from_public_key(&self.noise_keypair.public_bytes())
    }

    /// Human-verifiable fingerprint: uppercase hex of the full SHA-256
    /// digest, grouped into colon-separated pairs.
    pub fn fingerprint(&self) -> String {
        fingerprint_from_public_key(&self.noise_keypair.public_bytes())
    }

    /// Serializes both private keys (noise || signing, 64 bytes) for
    /// storage at rest. Callers are responsible for writing this to a
    /// location only the local user can read.
    pub fn to_bytes(&self) -> [u8; 64] {
        let mut bytes = [0u8; 64];
        bytes[..32].copy_from_slice(&self.noise_keypair.private_bytes());
        bytes[32..].copy_from_slice(&self.signing_keypair.private_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; 64]) -> Self {
        let mut noise_bytes = [0u8; 32];
        let mut signing_bytes = [0u8; 32];
        noise_bytes.copy_from_slice(&bytes[..32]);
        signing_bytes.copy_from_slice(&bytes[32..]);
        Self {
            noise_keypair: NoiseKeyPair::from_bytes(noise_bytes),
            signing_keypair: SigningKeyPair::from_bytes(signing_bytes),
        }
    }

    /// Derives a secp256k1 key for Nostr use, per `SHA-256(static_private ||
    /// "nostr-key-derivation")` reduced into the secp256k1 scalar field by
    /// rejection sampling.
    pub fn derive_nostr_keypair(&self) -> secp256k1::Keypair {
        let mut hasher = Sha256::new();
        hasher.update(self.noise_keypair.private_bytes());
        hasher.update(b"nostr-key-derivation");
        let mut candidate: [u8; 32] = hasher.finalize().into();

        let secp = secp256k1::Secp256k1::new();
        loop {
            if let Ok(secret_key) = secp256k1::SecretKey::from_slice(&candidate) {
                return secp256k1::Keypair::from_secret_key(&secp, &secret_key);
            }
            let mut hasher = Sha256::new();
            hasher.update(candidate);
            candidate = hasher.finalize().into();
        }
    }
}

pub fn peer_id_from_public_key(public_key: &[u8; 32]) -> PeerId {
    let digest = Sha256::digest(public_key);
    let mut id = [0u8; 8];
    id.copy_from_slice(&digest[..8]);
    PeerId::from_bytes(id)
}

pub fn fingerprint_from_public_key(public_key: &[u8; 32]) -> String {
    let digest = Sha256::digest(public_key);
    digest
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_survives_byte_round_trip() {
        let identity = Identity::generate();
        let restored = Identity::from_bytes(&identity.to_bytes());
        assert_eq!(identity.peer_id(), restored.peer_id());
        assert_eq!(identity.fingerprint(), restored.fingerprint());
    }

    #[test]
    fn diffie_hellman_agrees_between_peers() {
        let alice = NoiseKeyPair::generate();
        let bob = NoiseKeyPair::generate();

        let shared_a = alice.diffie_hellman(&bob.public_bytes());
        let shared_b = bob.diffie_hellman(&alice.public_bytes());

        assert_eq!(shared_a, shared_b);
    }

    #[test]
    fn fingerprint_is_stable_for_same_key() {
        let identity = Identity::generate();
        assert_eq!(identity.fingerprint(), identity.fingerprint());
        assert_eq!(identity.fingerprint().split(':').count(), 32);
    }

    #[test]
    fn nostr_keypair_derivation_is_deterministic() {
        let identity = Identity::generate();
        let k1 = identity.derive_nostr_keypair();
        let k2 = identity.derive_nostr_keypair();
        assert_eq!(k1.secret_bytes(), k2.secret_bytes());
    }
}
