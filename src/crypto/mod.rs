//! Cryptographic primitives: X25519/Ed25519 identity keys and the
//! hand-rolled Noise state machine built on top of them. Long-lived and
//! ephemeral secret material (`StaticSecret`, `SigningKey`, the Noise
//! cipher states) zeroizes itself on drop via the underlying crates.

pub mod cipher;
pub mod keys;
pub mod noise;
pub mod symmetric;

pub use cipher::CipherState;
pub use keys::{fingerprint_from_public_key, peer_id_from_public_key, Identity, NoiseKeyPair, SigningKeyPair};
pub use noise::{HandshakeState, Transport};
pub use symmetric::SymmetricState;
