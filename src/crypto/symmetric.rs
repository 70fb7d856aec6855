//! Noise `SymmetricState`: chaining key, handshake hash, and the HKDF mixing
//! operations that drive a Noise XX handshake to a split transport key pair.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use super::cipher::CipherState;
use crate::error::Result;

const PROTOCOL_NAME: &[u8] = b"Noise_XX_25519_ChaChaPoly_SHA256";

pub struct SymmetricState {
    ck: [u8; 32],
    h: [u8; 32],
    cipher: CipherState,
}

impl SymmetricState {
    pub fn initialize() -> Self {
        let h = if PROTOCOL_NAME.len() <= 32 {
            let mut padded = [0u8; 32];
            padded[..PROTOCOL_NAME.len()].copy_from_slice(PROTOCOL_NAME);
            padded
        } else {
            Sha256::digest(PROTOCOL_NAME).into()
        };

        Self {
            ck: h,
            h,
            cipher: CipherState::empty(),
        }
    }

    pub fn mix_hash(&mut self, data: &[u8]) {
        let mut hasher = Sha256::new();
        hasher.update(self.h);
        hasher.update(data);
        self.h = hasher.finalize().into();
    }

    pub fn mix_key(&mut self, input_key_material: &[u8]) {
        let (ck, key) = hkdf2(&self.ck, input_key_material);
        self.ck = ck;
        self.cipher.initialize_key(key);
    }

    pub fn mix_key_and_hash(&mut self, input_key_material: &[u8]) {
        let hk = Hkdf::<Sha256>::new(Some(&self.ck), input_key_material);
        let mut okm = [0u8; 96];
        hk.expand(&[], &mut okm).expect("okm length is valid for HKDF-SHA256");

        self.ck.copy_from_slice(&okm[0..32]);
        self.mix_hash(&okm[32..64]);
        let mut key = [0u8; 32];
        key.copy_from_slice(&okm[64..96]);
        self.cipher.initialize_key(key);
    }

    pub fn encrypt_and_hash(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let ciphertext = self.cipher.encrypt_with_ad(&self.h, plaintext)?;
        self.mix_hash(&ciphertext);
        Ok(ciphertext)
    }

    pub fn decrypt_and_hash(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let plaintext = self.cipher.decrypt_with_ad(&self.h, ciphertext)?;
        self.mix_hash(ciphertext);
        Ok(plaintext)
    }

    pub fn handshake_hash(&self) -> [u8; 32] {
        self.h
    }

    /// Splits into the two directional transport ciphers once the handshake
    /// pattern is complete.
    pub fn split(&self) -> (CipherState, CipherState) {
        let (k1, k2) = hkdf2(&self.ck, &[]);
        let mut c1 = CipherState::empty();
        c1.initialize_key(k1);
        let mut c2 = CipherState::empty();
        c2.initialize_key(k2);
        (c1, c2)
    }
}

/// HKDF with two output keys, per Noise's `HKDF(chaining_key, input, 2)`.
fn hkdf2(chaining_key: &[u8; 32], input_key_material: &[u8]) -> ([u8; 32], [u8; 32]) {
    type HmacSha256 = Hmac<Sha256>;

    let temp_key = {
        let mut mac = HmacSha256::new_from_slice(chaining_key).expect("hmac accepts any key length");
        mac.update(input_key_material);
        mac.finalize().into_bytes()
    };

    let output1 = {
        let mut mac = HmacSha256::new_from_slice(&temp_key).expect("hmac accepts any key length");
        mac.update(&[0x01]);
        mac.finalize().into_bytes()
    };

    let output2 = {
        let mut mac = HmacSha256::new_from_slice(&temp_key).expect("hmac accepts any key length");
        mac.update(&output1);
        mac.update(&[0x02]);
        mac.finalize().into_bytes()
    };

    (output1.into(), output2.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mix_hash_is_order_dependent() {
        let mut a = SymmetricState::initialize();
        let mut b = SymmetricState::initialize();
        a.mix_hash(b"one");
        a.mix_hash(b"two");
        b.mix_hash(b"two");
        b.mix_hash(b"one");
        assert_ne!(a.handshake_hash(), b.handshake_hash());
    }

    #[test]
    fn split_produces_independent_ciphers() {
        let mut state = SymmetricState::initialize();
        state.mix_key(b"shared secret");
        let (mut c1, mut c2) = state.split();

        let ciphertext = c1.encrypt_with_ad(b"", b"hello").unwrap();
        let plaintext = c2.decrypt_with_ad(b"", &ciphertext).unwrap();
        assert_eq!(plaintext, b"hello");
    }
}
