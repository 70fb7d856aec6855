//! Binary codec for [`Packet`]: 13-byte header, sender id, optional
//! recipient id, payload, optional signature.
//!
//! Layout (all integers big-endian):
//! `version(1) | type(1) | ttl(1) | timestamp(8) | flags(1) | payload_len(2)
//!  | sender(8) | recipient(8)? | payload(payload_len) | signature(64)?`

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

use super::constants::{
    FLAG_HAS_RECIPIENT, FLAG_HAS_SIGNATURE, HEADER_SIZE, MAX_TTL, PEER_ID_SIZE, SIGNATURE_SIZE,
};
use super::types::{Packet, PeerId};
use crate::error::{Error, Result};

pub struct BinaryProtocol;

impl BinaryProtocol {
    pub fn encode(packet: &Packet) -> Result<Vec<u8>> {
        if packet.payload.len() > u16::MAX as usize {
            return Err(Error::PayloadTooLarge(packet.payload.len()));
        }

        let mut buf = Vec::with_capacity(
            HEADER_SIZE + PEER_ID_SIZE * 2 + packet.payload.len() + SIGNATURE_SIZE,
        );

        buf.write_u8(packet.version)?;
        buf.write_u8(packet.packet_type)?;
        buf.write_u8(packet.ttl)?;
        buf.write_u64::<BigEndian>(packet.timestamp)?;
        buf.write_u8(packet.flags)?;
        buf.write_u16::<BigEndian>(packet.payload.len() as u16)?;

        buf.write_all(&packet.sender.0)?;

        if packet.has_recipient() {
            let recipient = packet
                .recipient
                .ok_or_else(|| Error::InvalidPacket("HAS_RECIPIENT set without recipient".into()))?;
            buf.write_all(&recipient.0)?;
        }

        buf.write_all(&packet.payload)?;

        if packet.has_signature() {
            let signature = packet
                .signature
                .ok_or_else(|| Error::InvalidPacket("HAS_SIGNATURE set without signature".into()))?;
            buf.write_all(&signature)?;
        }

        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Packet> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::InvalidPacket(format!(
                "truncated header: {} bytes",
                bytes.len()
            )));
        }

        let mut cursor = Cursor::new(bytes);

        let version = cursor.read_u8()?;
        if version != super::constants::PROTOCOL_VERSION {
            return Err(Error::InvalidPacket(format!("unknown version {version}")));
        }

        let packet_type = cursor.read_u8()?;
        let ttl = cursor.read_u8()?;
        if ttl > MAX_TTL {
            return Err(Error::InvalidPacket(format!("ttl {ttl} exceeds max {MAX_TTL}")));
        }
        let timestamp = cursor.read_u64::<BigEndian>()?;
        let flags = cursor.read_u8()?;
        let payload_len = cursor.read_u16::<BigEndian>()? as usize;

        let mut sender_bytes = [0u8; PEER_ID_SIZE];
        cursor
            .read_exact(&mut sender_bytes)
            .map_err(|_| Error::InvalidPacket("truncated sender id".into()))?;
        let sender = PeerId::from_bytes(sender_bytes);

        let has_recipient = flags & FLAG_HAS_RECIPIENT != 0;
        let recipient = if has_recipient {
            let mut recipient_bytes = [0u8; PEER_ID_SIZE];
            cursor
                .read_exact(&mut recipient_bytes)
                .map_err(|_| Error::InvalidPacket("truncated recipient id".into()))?;
            Some(PeerId::from_bytes(recipient_bytes))
        } else {
            None
        };

        let mut payload = vec![0u8; payload_len];
        cursor
            .read_exact(&mut payload)
            .map_err(|_| Error::InvalidPacket("truncated payload".into()))?;

        let has_signature = flags & FLAG_HAS_SIGNATURE != 0;
        let signature = if has_signature {
            let mut sig = [0u8; SIGNATURE_SIZE];
            cursor
                .read_exact(&mut sig)
                .map_err(|_| Error::InvalidPacket("truncated signature".into()))?;
            Some(sig)
        } else {
            None
        };

        Ok(Packet {
            version,
            packet_type,
            ttl,
            timestamp,
            flags,
            sender,
            recipient,
            payload,
            signature,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::TYPE_MESSAGE;

    #[test]
    fn encodes_exact_wire_layout_from_the_spec_scenario() {
        let sender = PeerId::from_bytes([0x12, 0x34, 0x56, 0x78, 0x90, 0xAB, 0xCD, 0xEF]);
        let packet = Packet::new(TYPE_MESSAGE, 7, 1_733_251_200_000, sender, b"Hello, BitChat!".to_vec());

        let encoded = BinaryProtocol::encode(&packet).unwrap();

        let expected_header: [u8; 13] = [
            0x01, 0x04, 0x07, 0x00, 0x00, 0x01, 0x92, 0x7C, 0x78, 0x38, 0x00, 0x00, 0x0F,
        ];
        assert_eq!(&encoded[..13], &expected_header);
        assert_eq!(&encoded[13..21], &sender.0);
        assert_eq!(&encoded[21..], b"Hello, BitChat!");
    }

    #[test]
    fn round_trips_with_recipient_and_signature() {
        let sender = PeerId::from_bytes([1; 8]);
        let recipient = PeerId::from_bytes([2; 8]);
        let packet = Packet::new(TYPE_MESSAGE, 3, 42, sender, b"hi".to_vec())
            .with_recipient(recipient)
            .with_signature([9u8; 64]);

        let encoded = BinaryProtocol::encode(&packet).unwrap();
        let decoded = BinaryProtocol::decode(&encoded).unwrap();

        assert_eq!(decoded, packet);
    }

    #[test]
    fn rejects_truncated_header() {
        let err = BinaryProtocol::decode(&[0x01, 0x04, 0x07]).unwrap_err();
        assert!(matches!(err, Error::InvalidPacket(_)));
    }

    #[test]
    fn rejects_unknown_version() {
        let sender = PeerId::from_bytes([1; 8]);
        let packet = Packet::new(TYPE_MESSAGE, 1, 0, sender, vec![]);
        let mut encoded = BinaryProtocol::encode(&packet).unwrap();
        encoded[0] = 9;
        let err = BinaryProtocol::decode(&encoded).unwrap_err();
        assert!(matches!(err, Error::InvalidPacket(_)));
    }

    #[test]
    fn rejects_ttl_above_max() {
        let sender = PeerId::from_bytes([1; 8]);
        let mut packet = Packet::new(TYPE_MESSAGE, 0, 0, sender, vec![]);
        packet.ttl = 8;
        let mut encoded = BinaryProtocol::encode(&packet).unwrap();
        encoded[2] = 8;
        let err = BinaryProtocol::decode(&encoded).unwrap_err();
        assert!(matches!(err, Error::InvalidPacket(_)));
    }

    #[test]
    fn rejects_oversized_payload() {
        let sender = PeerId::from_bytes([1; 8]);
        let packet = Packet::new(TYPE_MESSAGE, 1, 0, sender, vec![0u8; 70_000]);
        let err = BinaryProtocol::encode(&packet).unwrap_err();
        assert!(matches!(err, Error::PayloadTooLarge(_)));
    }
}
