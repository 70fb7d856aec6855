//! Transport trait definitions

use async_trait::async_trait;

use crate::error::Result;
use crate::protocol::PeerId;
use crate::transport::{TransportAddress, TransportEvent};

/// Core transport trait - defines what any transport must do
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start listening on the specified address
    async fn listen(&mut self, address: TransportAddress) -> Result<()>;

    /// Connect to a peer at the specified address
    async fn connect(&mut self, address: TransportAddress) -> Result<PeerId>;

    /// Send data to a connected peer
    async fn send(&mut self, peer_id: PeerId, data: Vec<u8>) -> Result<()>;

    /// Disconnect from a peer
    async fn disconnect(&mut self, peer_id: PeerId) -> Result<()>;

    /// Check if connected to a peer
    fn is_connected(&self, peer_id: &PeerId) -> bool;

    /// Get list of connected peers
    fn connected_peers(&self) -> Vec<PeerId>;

    /// Receive the next transport event
    async fn next_event(&mut self) -> Option<TransportEvent>;
}
