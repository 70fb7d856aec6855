//! Wire-format constants: message types, flag bits, and sizing limits.

/// Current wire version. The decoder rejects anything else.
pub const PROTOCOL_VERSION: u8 = 1;

/// Fixed header size in bytes: version(1) type(1) ttl(1) timestamp(8) flags(1) payload_len(2).
pub const HEADER_SIZE: usize = 13;

/// Short peer-id length used on the wire (authoritative identity is the static public key).
pub const PEER_ID_SIZE: usize = 8;

/// Ed25519 signature length.
pub const SIGNATURE_SIZE: usize = 64;

pub const MAX_TTL: u8 = 7;
pub const BLE_MTU: usize = 512;
pub const MESSAGE_MAX_SIZE: usize = 65535;

/// Fragment payload header: message_id(8) | index(2 BE) | total(2 BE).
pub const FRAGMENT_HEADER_SIZE: usize = 12;
pub const FRAGMENT_CHUNK_SIZE: usize = BLE_MTU - FRAGMENT_HEADER_SIZE;

pub const STANDARD_BLOCK_SIZES: [usize; 4] = [256, 512, 1024, 2048];
pub const PADDING_ROUND_UP: usize = 256;

pub const BROADCAST_ID: [u8; PEER_ID_SIZE] = [0xFF; PEER_ID_SIZE];

// --- Message type constants ---
pub const TYPE_ANNOUNCE: u8 = 0x01;
pub const TYPE_LEAVE: u8 = 0x03;
pub const TYPE_MESSAGE: u8 = 0x04;
pub const TYPE_FRAGMENT_START: u8 = 0x05;
pub const TYPE_FRAGMENT_CONTINUE: u8 = 0x06;
pub const TYPE_FRAGMENT_END: u8 = 0x07;
pub const TYPE_DELIVERY_ACK: u8 = 0x0A;
pub const TYPE_DELIVERY_STATUS_REQUEST: u8 = 0x0B;
pub const TYPE_READ_RECEIPT: u8 = 0x0C;
pub const TYPE_NOISE_HANDSHAKE_INIT: u8 = 0x10;
pub const TYPE_NOISE_HANDSHAKE_RESP: u8 = 0x11;
pub const TYPE_NOISE_ENCRYPTED: u8 = 0x12;
pub const TYPE_NOISE_IDENTITY_ANNOUNCE: u8 = 0x13;
pub const TYPE_VERSION_HELLO: u8 = 0x20;
pub const TYPE_VERSION_ACK: u8 = 0x21;
pub const TYPE_PROTOCOL_ACK: u8 = 0x22;
pub const TYPE_PROTOCOL_NACK: u8 = 0x23;
pub const TYPE_MESH_RELAY: u8 = 0x26;
pub const TYPE_FAVORITED: u8 = 0x30;
pub const TYPE_UNFAVORITED: u8 = 0x31;

// --- Flag bits ---
pub const FLAG_HAS_RECIPIENT: u8 = 0x01;
pub const FLAG_HAS_SIGNATURE: u8 = 0x02;
pub const FLAG_IS_COMPRESSED: u8 = 0x04;
pub const FLAG_RESERVED_MASK: u8 = !(FLAG_HAS_RECIPIENT | FLAG_HAS_SIGNATURE | FLAG_IS_COMPRESSED);
