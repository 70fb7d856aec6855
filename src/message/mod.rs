//! Message manager: the outbound scheduling layer sitting above the
//! transport multiplexer. Every outbound message is persisted to the
//! durable outbox before it is queued in memory, so a crash between send
//! and delivery loses nothing. A single worker task drains the in-memory
//! priority queue, handing each message to the multiplexer and rescheduling
//! it with backoff on transient failure.

#[cfg(feature = "sqlite")]
pub mod outbox;

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};

use crate::error::{Error, Result};
use crate::protocol::{MessageId, PeerId};
use crate::transport::TransportMultiplexer;

#[cfg(feature = "sqlite")]
use outbox::{now_unix, OutboxRecord, OutboxStore};

const RETRY_BASE: Duration = Duration::from_secs(1);
const RETRY_MAX: Duration = Duration::from_secs(5 * 60);
const RETRY_MULTIPLIER: f64 = 2.0;

/// Coarser than the wire's single-byte type tag: what a message *is for*,
/// used only to order the outbound queue. Direct DMs jump ahead of mesh
/// chatter; receipts and status probes are best-effort housekeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i64)]
pub enum MessagePriority {
    StatusProbe = 0,
    Receipt = 1,
    BroadcastChatter = 2,
    DirectMessage = 3,
}

impl MessagePriority {
    #[cfg(feature = "sqlite")]
    fn from_i64(value: i64) -> Self {
        match value {
            3 => Self::DirectMessage,
            2 => Self::BroadcastChatter,
            1 => Self::Receipt,
            _ => Self::StatusProbe,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum MessageStatus {
    Pending = 0,
    Sent = 1,
    Delivered = 2,
    Read = 3,
    Failed = 4,
    Expired = 5,
}

impl MessageStatus {
    #[cfg(feature = "sqlite")]
    fn from_i64(value: i64) -> Self {
        match value {
            1 => Self::Sent,
            2 => Self::Delivered,
            3 => Self::Read,
            4 => Self::Failed,
            5 => Self::Expired,
            _ => Self::Pending,
        }
    }
}

#[derive(Debug, Clone)]
pub enum MessageEvent {
    Sent { message_id: MessageId },
    DeliveryAcked { message_id: MessageId },
    ReadReceipt { message_id: MessageId },
    Failed { message_id: MessageId, reason: String },
    Expired { message_id: MessageId },
}

#[derive(Clone)]
struct QueueItem {
    message_id: MessageId,
    recipient: PeerId,
    priority: MessagePriority,
    created_at: u64,
    ready_at: u64,
}

impl PartialEq for QueueItem {
    fn eq(&self, other: &Self) -> bool {
        self.message_id == other.message_id
    }
}
impl Eq for QueueItem {}

impl Ord for QueueItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.created_at.cmp(&self.created_at))
    }
}
impl PartialOrd for QueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Drives outbound delivery: persists each send to the outbox, serves the
/// highest-priority ready message to the transport multiplexer, and
/// reschedules transient failures with exponential backoff.
pub struct MessageManager {
    local_peer: PeerId,
    #[cfg(feature = "sqlite")]
    outbox: Arc<OutboxStore>,
    multiplexer: Arc<TransportMultiplexer>,
    queue: parking_lot::Mutex<BinaryHeap<QueueItem>>,
    notify: Notify,
    max_attempts: u32,
    events: mpsc::UnboundedSender<MessageEvent>,
}

impl MessageManager {
    #[cfg(feature = "sqlite")]
    pub fn new(
        local_peer: PeerId,
        outbox: Arc<OutboxStore>,
        multiplexer: Arc<TransportMultiplexer>,
        max_attempts: u32,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<MessageEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            local_peer,
            outbox,
            multiplexer,
            queue: parking_lot::Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            max_attempts,
            events,
        });
        (manager, rx)
    }

    /// Loads every outbox row not yet known-delivered into the in-memory
    /// queue. Called once at startup: a crash can leave a row `Sent` or
    /// `Failed` without the process ever having confirmed the outcome, so
    /// those are reset to `Pending` and retried rather than trusted as-is.
    #[cfg(feature = "sqlite")]
    pub fn rehydrate(&self) -> Result<()> {
        for mut record in self.outbox.pending_ordered()? {
            if record.status != MessageStatus::Pending {
                self.outbox.set_status(&record.message_id, MessageStatus::Pending)?;
                record.status = MessageStatus::Pending;
            }
            self.enqueue_item(&record);
        }
        Ok(())
    }

    #[cfg(feature = "sqlite")]
    fn enqueue_item(&self, record: &OutboxRecord) {
        self.queue.lock().push(QueueItem {
            message_id: record.message_id,
            recipient: record.recipient,
            priority: record.priority,
            created_at: record.created_at,
            ready_at: record.next_attempt_at,
        });
        self.notify.notify_one();
    }

    /// Persists `payload` to the outbox and enqueues it for delivery.
    /// Returns the assigned message id immediately; delivery outcome is
    /// reported asynchronously via the event channel.
    #[cfg(feature = "sqlite")]
    pub fn send(
        &self,
        recipient: PeerId,
        payload: Vec<u8>,
        priority: MessagePriority,
        expires_in: Duration,
    ) -> Result<MessageId> {
        let message_id = MessageId::new();
        let now = now_unix();
        let record = OutboxRecord {
            message_id,
            sender: self.local_peer,
            recipient,
            payload,
            priority,
            status: MessageStatus::Pending,
            attempts: 0,
            next_attempt_at: now,
            expires_at: now + expires_in.as_secs(),
            created_at: now,
        };
        self.outbox.insert(&record)?;
        self.enqueue_item(&record);
        Ok(message_id)
    }

    /// Marks a sent message as acknowledged by a `DELIVERY_ACK` from the
    /// recipient. No-op if the message has already left the outbox.
    #[cfg(feature = "sqlite")]
    pub fn mark_delivered(&self, message_id: &MessageId) -> Result<()> {
        self.outbox.set_status(message_id, MessageStatus::Delivered)?;
        let _ = self.events.send(MessageEvent::DeliveryAcked { message_id: *message_id });
        Ok(())
    }

    #[cfg(feature = "sqlite")]
    pub fn mark_read(&self, message_id: &MessageId) -> Result<()> {
        self.outbox.set_status(message_id, MessageStatus::Read)?;
        let _ = self.events.send(MessageEvent::ReadReceipt { message_id: *message_id });
        Ok(())
    }

    /// Re-queues every pending message addressed to `peer` for immediate
    /// retry, called once that peer's session reaches `Completed`.
    pub fn expedite(&self, peer: &PeerId) {
        let mut queue = self.queue.lock();
        let items: Vec<QueueItem> = queue.drain().collect();
        for mut item in items {
            if item.recipient == *peer {
                item.ready_at = 0;
            }
            queue.push(item);
        }
        drop(queue);
        self.notify.notify_one();
    }

    fn backoff_delay(attempts: u32) -> Duration {
        let multiplier = RETRY_MULTIPLIER.powi(attempts as i32);
        let delay_ms = (RETRY_BASE.as_millis() as f64 * multiplier) as u64;
        std::cmp::min(Duration::from_millis(delay_ms), RETRY_MAX)
    }

    /// Runs forever: pulls the highest-priority ready message, attempts
    /// delivery, and reschedules or finalizes it depending on the outcome.
    /// Spawn this once per `MessageManager` instance.
    #[cfg(feature = "sqlite")]
    pub async fn run_worker(self: Arc<Self>) {
        loop {
            let next = { self.queue.lock().peek().cloned() };

            let Some(item) = next else {
                self.notify.notified().await;
                continue;
            };

            let now = now_unix();
            if item.ready_at > now {
                let wait = Duration::from_secs(item.ready_at - now);
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = self.notify.notified() => {}
                }
                continue;
            }

            {
                let mut queue = self.queue.lock();
                if queue.peek().map(|top| top.message_id) == Some(item.message_id) {
                    queue.pop();
                }
            }

            self.process_one(item).await;
        }
    }

    #[cfg(feature = "sqlite")]
    async fn process_one(&self, item: QueueItem) {
        let Ok(Some(record)) = self.outbox.get(&item.message_id) else {
            return;
        };
        if matches!(
            record.status,
            MessageStatus::Sent | MessageStatus::Delivered | MessageStatus::Read | MessageStatus::Failed | MessageStatus::Expired
        ) {
            return;
        }

        let now = now_unix();
        if now > record.expires_at {
            let _ = self.outbox.set_status(&item.message_id, MessageStatus::Expired);
            let _ = self.events.send(MessageEvent::Expired { message_id: item.message_id });
            return;
        }

        match self.multiplexer.send(item.recipient, &record.payload, now * 1000).await {
            Ok(()) => {
                let _ = self.outbox.set_status(&item.message_id, MessageStatus::Sent);
                let _ = self.events.send(MessageEvent::Sent { message_id: item.message_id });
            }
            Err(err) => self.handle_failure(item, record.attempts, err).await,
        }
    }

    #[cfg(feature = "sqlite")]
    async fn handle_failure(&self, item: QueueItem, attempts: u32, err: Error) {
        if attempts + 1 >= self.max_attempts {
            let _ = self.outbox.set_status(&item.message_id, MessageStatus::Failed);
            let _ = self.events.send(MessageEvent::Failed {
                message_id: item.message_id,
                reason: err.to_string(),
            });
            return;
        }

        let delay = Self::backoff_delay(attempts + 1);
        let next_attempt_at = now_unix() + delay.as_secs();
        let _ = self.outbox.record_failed_attempt(&item.message_id, next_attempt_at);

        self.queue.lock().push(QueueItem {
            ready_at: next_attempt_at,
            ..item
        });
        self.notify.notify_one();
    }
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use crate::crypto::Identity;
    use crate::session::SessionManager;

    fn manager_with_unreachable_recipient() -> (Arc<MessageManager>, PeerId) {
        let identity = Arc::new(Identity::generate());
        let (sessions, _rx) = SessionManager::new(identity.clone());
        let multiplexer = Arc::new(TransportMultiplexer::new(identity.peer_id(), sessions));
        let outbox = Arc::new(OutboxStore::open_in_memory().unwrap());
        let (manager, _events) = MessageManager::new(identity.peer_id(), outbox, multiplexer, 3);
        (manager, PeerId::from_bytes([42; 8]))
    }

    #[test]
    fn send_persists_and_enqueues() {
        let (manager, recipient) = manager_with_unreachable_recipient();
        let id = manager
            .send(recipient, b"hi".to_vec(), MessagePriority::DirectMessage, Duration::from_secs(60))
            .unwrap();
        let record = manager.outbox.get(&id).unwrap().unwrap();
        assert_eq!(record.status, MessageStatus::Pending);
        assert_eq!(manager.queue.lock().len(), 1);
    }

    #[tokio::test]
    async fn unreachable_recipient_is_rescheduled_not_failed_immediately() {
        let (manager, recipient) = manager_with_unreachable_recipient();
        let id = manager
            .send(recipient, b"hi".to_vec(), MessagePriority::DirectMessage, Duration::from_secs(60))
            .unwrap();

        let item = manager.queue.lock().pop().unwrap();
        assert_eq!(item.message_id, id);
        manager.process_one(item).await;

        let record = manager.outbox.get(&id).unwrap().unwrap();
        assert_eq!(record.status, MessageStatus::Pending);
        assert_eq!(record.attempts, 1);
        assert_eq!(manager.queue.lock().len(), 1);
    }

    #[tokio::test]
    async fn expired_message_is_marked_expired_without_sending() {
        let (manager, recipient) = manager_with_unreachable_recipient();
        let id = manager
            .send(recipient, b"hi".to_vec(), MessagePriority::DirectMessage, Duration::from_secs(0))
            .unwrap();
        // force the expiry into the past
        manager.outbox.record_failed_attempt(&id, 0).unwrap();
        std::thread::sleep(Duration::from_secs(1));

        let item = manager.queue.lock().pop().unwrap();
        manager.process_one(item).await;

        let record = manager.outbox.get(&id).unwrap().unwrap();
        assert_eq!(record.status, MessageStatus::Expired);
    }
}
