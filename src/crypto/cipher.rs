//! Noise `CipherState`: a ChaCha20-Poly1305 key plus a monotonic nonce
//! counter, per the Noise Protocol Framework spec. The nonce's high 32 bits
//! are always zero; only the low 64 bits increment.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};

use crate::error::{Error, Result};

pub struct CipherState {
    key: Option<[u8; 32]>,
    cipher: Option<ChaCha20Poly1305>,
    nonce: u64,
}

impl CipherState {
    pub fn empty() -> Self {
        Self {
            key: None,
            cipher: None,
            nonce: 0,
        }
    }

    pub fn initialize_key(&mut self, key: [u8; 32]) {
        self.cipher = Some(ChaCha20Poly1305::new(Key::from_slice(&key)));
        self.key = Some(key);
        self.nonce = 0;
    }

    pub fn has_key(&self) -> bool {
        self.cipher.is_some()
    }

    fn nonce_bytes(&self) -> Nonce {
        let mut bytes = [0u8; 12];
        bytes[..8].copy_from_slice(&self.nonce.to_le_bytes());
        *Nonce::from_slice(&bytes)
    }

    pub fn encrypt_with_ad(&mut self, ad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        let Some(cipher) = &self.cipher else {
            return Ok(plaintext.to_vec());
        };
        let nonce = self.nonce_bytes();
        let ciphertext = cipher
            .encrypt(&nonce, Payload { msg: plaintext, aad: ad })
            .map_err(|_| Error::CryptoFailure("chacha20poly1305 encryption failed".into()))?;
        self.nonce = self
            .nonce
            .checked_add(1)
            .ok_or_else(|| Error::CryptoFailure("nonce space exhausted".into()))?;
        Ok(ciphertext)
    }

    pub fn decrypt_with_ad(&mut self, ad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let Some(cipher) = &self.cipher else {
            return Ok(ciphertext.to_vec());
        };
        let nonce = self.nonce_bytes();
        let plaintext = cipher
            .decrypt(&nonce, Payload { msg: ciphertext, aad: ad })
            .map_err(|_| Error::CryptoFailure("chacha20poly1305 decryption failed".into()))?;
        self.nonce = self
            .nonce
            .checked_add(1)
            .ok_or_else(|| Error::CryptoFailure("nonce space exhausted".into()))?;
        Ok(plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_with_associated_data() {
        let mut enc = CipherState::empty();
        enc.initialize_key([7u8; 32]);
        let mut dec = CipherState::empty();
        dec.initialize_key([7u8; 32]);

        let ciphertext = enc.encrypt_with_ad(b"ad", b"hello").unwrap();
        let plaintext = dec.decrypt_with_ad(b"ad", &ciphertext).unwrap();
        assert_eq!(plaintext, b"hello");
    }

    #[test]
    fn nonce_increments_each_call() {
        let mut enc = CipherState::empty();
        enc.initialize_key([1u8; 32]);
        assert_eq!(enc.nonce, 0);
        enc.encrypt_with_ad(b"", b"a").unwrap();
        assert_eq!(enc.nonce, 1);
        enc.encrypt_with_ad(b"", b"b").unwrap();
        assert_eq!(enc.nonce, 2);
    }

    #[test]
    fn without_key_is_passthrough() {
        let mut cs = CipherState::empty();
        assert!(!cs.has_key());
        assert_eq!(cs.encrypt_with_ad(b"", b"plain").unwrap(), b"plain");
    }
}
