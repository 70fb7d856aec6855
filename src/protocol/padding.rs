//! Length-hiding padding. Payloads are padded up to a standard block size
//! before encryption so an observer cannot infer message length from ciphertext
//! size; the true length is carried as a 2-byte prefix and stripped on unpad.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use rand::RngCore;

use super::constants::{PADDING_ROUND_UP, STANDARD_BLOCK_SIZES};
use crate::error::{Error, Result};

fn target_size(true_len: usize) -> usize {
    for &block in &STANDARD_BLOCK_SIZES {
        if true_len <= block {
            return block;
        }
    }
    true_len.div_ceil(PADDING_ROUND_UP) * PADDING_ROUND_UP
}

/// Pads `payload` to the next standard block size (or 256-byte multiple past
/// 2048), prefixed with the true length.
pub fn pad(payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > u16::MAX as usize {
        return Err(Error::PayloadTooLarge(payload.len()));
    }

    let total = target_size(payload.len() + 2);
    let mut out = Vec::with_capacity(total);
    out.write_u16::<BigEndian>(payload.len() as u16)?;
    out.extend_from_slice(payload);
    let pad_start = out.len();
    out.resize(total, 0);
    rand::rngs::OsRng.fill_bytes(&mut out[pad_start..]);
    Ok(out)
}

/// Reverses [`pad`], returning the original payload.
pub fn unpad(padded: &[u8]) -> Result<Vec<u8>> {
    if padded.len() < 2 {
        return Err(Error::InvalidPacket("padded buffer shorter than length prefix".into()));
    }
    let mut cursor = std::io::Cursor::new(padded);
    let true_len = cursor.read_u16::<BigEndian>()? as usize;
    let start = 2;
    let end = start + true_len;
    if end > padded.len() {
        return Err(Error::InvalidPacket("padding length prefix exceeds buffer".into()));
    }
    Ok(padded[start..end].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pads_to_smallest_fitting_block() {
        let payload = vec![0xAB; 100];
        let padded = pad(&payload).unwrap();
        assert_eq!(padded.len(), 256);
    }

    #[test]
    fn pads_past_largest_block_to_next_256_multiple() {
        let payload = vec![0xAB; 2100];
        let padded = pad(&payload).unwrap();
        assert_eq!(padded.len() % 256, 0);
        assert!(padded.len() >= 2100 + 2);
    }

    #[test]
    fn round_trips() {
        let payload = b"short message".to_vec();
        let padded = pad(&payload).unwrap();
        let unpadded = unpad(&padded).unwrap();
        assert_eq!(unpadded, payload);
    }
}
