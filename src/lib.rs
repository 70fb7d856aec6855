//! meshline - a decentralized, end-to-end encrypted peer-to-peer messenger
//! with no central server: a Bluetooth LE mesh for nearby peers, backed by
//! gift-wrapped Nostr DMs for anyone mutually favorited but out of radio
//! range.

pub mod boundary;
pub mod config;
pub mod crypto;
pub mod error;
pub mod logging;
pub mod mesh;
pub mod message;
pub mod protocol;
pub mod resilience;
pub mod session;
pub mod transport;

pub use error::{Error, Result};
