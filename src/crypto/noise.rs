//! Hand-rolled Noise_XX_25519_ChaChaPoly_SHA256 handshake state machine.
//!
//! Pattern:
//! ```text
//! -> e
//! <- e, ee, s, es
//! -> s, se
//! ```
//! Implemented directly against [`super::symmetric::SymmetricState`] rather
//! than through a general-purpose Noise library, since only this one pattern
//! is ever needed.

use x25519_dalek::{PublicKey, StaticSecret};

use super::cipher::CipherState;
use super::keys::NoiseKeyPair;
use super::symmetric::SymmetricState;
use crate::error::{Error, Result};

enum Role {
    Initiator,
    Responder,
}

/// Drives one Noise XX handshake to completion, then yields the split
/// transport ciphers.
pub struct HandshakeState {
    symmetric: SymmetricState,
    role: Role,
    local_static: NoiseKeyPair,
    local_ephemeral: Option<StaticSecret>,
    local_ephemeral_public: Option<PublicKey>,
    remote_ephemeral: Option<PublicKey>,
    remote_static: Option<PublicKey>,
    message_index: u8,
}

pub struct Transport {
    pub send: CipherState,
    pub receive: CipherState,
    pub remote_static: [u8; 32],
}

impl HandshakeState {
    pub fn initiator(local_static: NoiseKeyPair) -> Self {
        Self::new(local_static, Role::Initiator)
    }

    pub fn responder(local_static: NoiseKeyPair) -> Self {
        Self::new(local_static, Role::Responder)
    }

    fn new(local_static: NoiseKeyPair, role: Role) -> Self {
        Self {
            symmetric: SymmetricState::initialize(),
            role,
            local_static,
            local_ephemeral: None,
            local_ephemeral_public: None,
            remote_ephemeral: None,
            remote_static: None,
            message_index: 0,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.message_index >= 3
    }

    /// Writes the next handshake message. Call alternately with
    /// [`Self::read_message`] according to the XX pattern.
    pub fn write_message(&mut self) -> Result<Vec<u8>> {
        match (&self.role, self.message_index) {
            (Role::Initiator, 0) => {
                let e = StaticSecret::random_from_rng(rand::rngs::OsRng);
                let e_pub = PublicKey::from(&e);
                self.symmetric.mix_hash(e_pub.as_bytes());
                self.local_ephemeral = Some(e);
                self.local_ephemeral_public = Some(e_pub);
                self.message_index = 1;
                Ok(e_pub.as_bytes().to_vec())
            }
            (Role::Responder, 1) => {
                let e = StaticSecret::random_from_rng(rand::rngs::OsRng);
                let e_pub = PublicKey::from(&e);
                self.symmetric.mix_hash(e_pub.as_bytes());

                let remote_e = self
                    .remote_ephemeral
                    .ok_or_else(|| Error::UnexpectedHandshakeMessage("missing remote ephemeral".into()))?;
                self.symmetric.mix_key(&e.diffie_hellman(&remote_e).to_bytes());

                let s_pub = self.local_static.public_bytes();
                let s_ciphertext = self.symmetric.encrypt_and_hash(&s_pub)?;

                let es = self
                    .local_static
                    .diffie_hellman(remote_e.as_bytes());
                self.symmetric.mix_key(&es);

                self.local_ephemeral = Some(e);
                self.local_ephemeral_public = Some(e_pub);
                self.message_index = 2;

                let mut out = e_pub.as_bytes().to_vec();
                out.extend_from_slice(&s_ciphertext);
                Ok(out)
            }
            (Role::Initiator, 2) => {
                let s_pub = self.local_static.public_bytes();
                let s_ciphertext = self.symmetric.encrypt_and_hash(&s_pub)?;

                let remote_e = self
                    .remote_ephemeral
                    .ok_or_else(|| Error::UnexpectedHandshakeMessage("missing remote ephemeral".into()))?;
                let se = self.local_static.diffie_hellman(remote_e.as_bytes());
                self.symmetric.mix_key(&se);

                self.message_index = 3;
                Ok(s_ciphertext)
            }
            _ => Err(Error::UnexpectedHandshakeMessage(format!(
                "no message to write at step {}",
                self.message_index
            ))),
        }
    }

    /// Reads the next incoming handshake message.
    pub fn read_message(&mut self, message: &[u8]) -> Result<()> {
        match (&self.role, self.message_index) {
            (Role::Responder, 0) => {
                let e_pub = read_public_key(message)?;
                self.symmetric.mix_hash(e_pub.as_bytes());
                self.remote_ephemeral = Some(e_pub);
                self.message_index = 1;
                Ok(())
            }
            (Role::Initiator, 1) => {
                if message.len() < 32 {
                    return Err(Error::InvalidPacket("handshake message 2 too short".into()));
                }
                let remote_e = read_public_key(&message[..32])?;
                self.symmetric.mix_hash(remote_e.as_bytes());

                let local_e = self
                    .local_ephemeral
                    .as_ref()
                    .ok_or_else(|| Error::UnexpectedHandshakeMessage("missing local ephemeral".into()))?;
                self.symmetric.mix_key(&local_e.diffie_hellman(&remote_e).to_bytes());

                let remote_s_bytes = self.symmetric.decrypt_and_hash(&message[32..])?;
                let remote_s = read_public_key(&remote_s_bytes)?;

                let es = local_e.diffie_hellman(&remote_s);
                self.symmetric.mix_key(es.as_bytes());

                self.remote_static = Some(remote_s);
                self.remote_ephemeral = Some(remote_e);
                self.message_index = 2;
                Ok(())
            }
            (Role::Responder, 2) => {
                let remote_s_bytes = self.symmetric.decrypt_and_hash(message)?;
                let remote_s = read_public_key(&remote_s_bytes)?;

                let local_e = self
                    .local_ephemeral
                    .as_ref()
                    .ok_or_else(|| Error::UnexpectedHandshakeMessage("missing local ephemeral".into()))?;
                let se = local_e.diffie_hellman(&remote_s);
                self.symmetric.mix_key(se.as_bytes());

                self.remote_static = Some(remote_s);
                self.message_index = 3;
                Ok(())
            }
            _ => Err(Error::UnexpectedHandshakeMessage(format!(
                "no message expected at step {}",
                self.message_index
            ))),
        }
    }

    /// Consumes the handshake state once complete, producing the transport
    /// cipher pair. The initiator's send cipher is the responder's receive
    /// cipher, and vice versa.
    pub fn into_transport(self) -> Result<Transport> {
        if !self.is_complete() {
            return Err(Error::UnexpectedHandshakeMessage("handshake not complete".into()));
        }
        let remote_static = self
            .remote_static
            .ok_or_else(|| Error::CryptoFailure("handshake completed without remote static key".into()))?;

        let (c1, c2) = self.symmetric.split();
        let (send, receive) = match self.role {
            Role::Initiator => (c1, c2),
            Role::Responder => (c2, c1),
        };

        Ok(Transport {
            send,
            receive,
            remote_static: remote_static.to_bytes(),
        })
    }
}

fn read_public_key(bytes: &[u8]) -> Result<PublicKey> {
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| Error::InvalidPacket("public key must be 32 bytes".into()))?;
    Ok(PublicKey::from(arr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xx_handshake_establishes_matching_transport_keys() {
        let initiator_static = NoiseKeyPair::generate();
        let responder_static = NoiseKeyPair::generate();

        let mut initiator = HandshakeState::initiator(initiator_static.clone());
        let mut responder = HandshakeState::responder(responder_static.clone());

        let msg1 = initiator.write_message().unwrap();
        responder.read_message(&msg1).unwrap();

        let msg2 = responder.write_message().unwrap();
        initiator.read_message(&msg2).unwrap();

        let msg3 = initiator.write_message().unwrap();
        responder.read_message(&msg3).unwrap();

        assert!(initiator.is_complete());
        assert!(responder.is_complete());

        let mut initiator_transport = initiator.into_transport().unwrap();
        let mut responder_transport = responder.into_transport().unwrap();

        assert_eq!(initiator_transport.remote_static, responder_static.public_bytes());
        assert_eq!(responder_transport.remote_static, initiator_static.public_bytes());

        let ciphertext = initiator_transport.send.encrypt_with_ad(b"", b"hello from initiator").unwrap();
        let plaintext = responder_transport.receive.decrypt_with_ad(b"", &ciphertext).unwrap();
        assert_eq!(plaintext, b"hello from initiator");

        let ciphertext = responder_transport.send.encrypt_with_ad(b"", b"hello from responder").unwrap();
        let plaintext = initiator_transport.receive.decrypt_with_ad(b"", &ciphertext).unwrap();
        assert_eq!(plaintext, b"hello from responder");
    }
}
