//! Wire protocol: packet framing, padding, and fragmentation.

pub mod binary;
pub mod constants;
pub mod fragment;
pub mod padding;
pub mod types;

pub use binary::BinaryProtocol;
pub use constants::*;
pub use fragment::{Fragment, Reassembler};
pub use types::{MessageId, Packet, PeerId};
