//! Durable outbox store: a single SQLite table tracking every outbound
//! message that hasn't yet been confirmed delivered, surviving process
//! restarts. The in-memory priority queue in [`super`] is rebuilt from this
//! table on startup and kept in sync with it as messages move through their
//! lifecycle.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Error, Result};
use crate::protocol::{MessageId, PeerId};

use super::{MessagePriority, MessageStatus};

/// One row of the outbox table, matching its column layout exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxRecord {
    pub message_id: MessageId,
    pub sender: PeerId,
    pub recipient: PeerId,
    pub payload: Vec<u8>,
    pub priority: MessagePriority,
    pub status: MessageStatus,
    pub attempts: u32,
    pub next_attempt_at: u64,
    pub expires_at: u64,
    pub created_at: u64,
}

pub struct OutboxStore {
    conn: Mutex<Connection>,
}

impl OutboxStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(Error::Io)?;
        }
        let conn = Connection::open(path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS outbox (
                message_id      BLOB PRIMARY KEY,
                sender          BLOB NOT NULL,
                recipient       BLOB NOT NULL,
                payload         BLOB NOT NULL,
                priority        INTEGER NOT NULL,
                status          INTEGER NOT NULL,
                attempts        INTEGER NOT NULL,
                next_attempt_at INTEGER NOT NULL,
                expires_at      INTEGER NOT NULL,
                created_at      INTEGER NOT NULL
            )",
            [],
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute(
            "CREATE TABLE outbox (
                message_id      BLOB PRIMARY KEY,
                sender          BLOB NOT NULL,
                recipient       BLOB NOT NULL,
                payload         BLOB NOT NULL,
                priority        INTEGER NOT NULL,
                status          INTEGER NOT NULL,
                attempts        INTEGER NOT NULL,
                next_attempt_at INTEGER NOT NULL,
                expires_at      INTEGER NOT NULL,
                created_at      INTEGER NOT NULL
            )",
            [],
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn insert(&self, record: &OutboxRecord) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO outbox (message_id, sender, recipient, payload, priority, status, attempts, next_attempt_at, expires_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.message_id.0.to_vec(),
                record.sender.as_bytes().to_vec(),
                record.recipient.as_bytes().to_vec(),
                record.payload,
                record.priority as i64,
                record.status as i64,
                record.attempts,
                record.next_attempt_at as i64,
                record.expires_at as i64,
                record.created_at as i64,
            ],
        )?;
        Ok(())
    }

    pub fn set_status(&self, message_id: &MessageId, status: MessageStatus) -> Result<()> {
        self.conn.lock().execute(
            "UPDATE outbox SET status = ?1 WHERE message_id = ?2",
            params![status as i64, message_id.0.to_vec()],
        )?;
        Ok(())
    }

    pub fn record_failed_attempt(&self, message_id: &MessageId, next_attempt_at: u64) -> Result<()> {
        self.conn.lock().execute(
            "UPDATE outbox SET attempts = attempts + 1, next_attempt_at = ?1 WHERE message_id = ?2",
            params![next_attempt_at as i64, message_id.0.to_vec()],
        )?;
        Ok(())
    }

    pub fn get(&self, message_id: &MessageId) -> Result<Option<OutboxRecord>> {
        self.conn
            .lock()
            .query_row(
                "SELECT message_id, sender, recipient, payload, priority, status, attempts, next_attempt_at, expires_at, created_at
                 FROM outbox WHERE message_id = ?1",
                params![message_id.0.to_vec()],
                row_to_record,
            )
            .optional()
            .map_err(Error::from)
    }

    /// Every message still eligible for retry — anything not in
    /// `{Delivered, Read, Expired}` — ordered FIFO within priority, for
    /// rebuilding the in-memory queue after a restart. `Sent` rows are
    /// included: a crash before their `DELIVERY_ACK` arrives leaves actual
    /// delivery unconfirmed, so the durability invariant requires retrying
    /// them too. `Failed` rows are included for the same reason — a crash
    /// doesn't distinguish "genuinely undeliverable" from "about to succeed
    /// on the next attempt" any better than the in-memory state did.
    pub fn pending_ordered(&self) -> Result<Vec<OutboxRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT message_id, sender, recipient, payload, priority, status, attempts, next_attempt_at, expires_at, created_at
             FROM outbox WHERE status IN (?1, ?2, ?3) ORDER BY priority DESC, created_at ASC",
        )?;
        let rows = stmt
            .query_map(
                params![
                    MessageStatus::Pending as i64,
                    MessageStatus::Sent as i64,
                    MessageStatus::Failed as i64,
                ],
                row_to_record,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn delete(&self, message_id: &MessageId) -> Result<()> {
        self.conn
            .lock()
            .execute("DELETE FROM outbox WHERE message_id = ?1", params![message_id.0.to_vec()])?;
        Ok(())
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<OutboxRecord> {
    let message_id_bytes: Vec<u8> = row.get(0)?;
    let sender_bytes: Vec<u8> = row.get(1)?;
    let recipient_bytes: Vec<u8> = row.get(2)?;

    let message_id = MessageId::from_bytes(message_id_bytes.try_into().unwrap_or([0u8; 16]));
    let sender = PeerId::from_bytes(sender_bytes.try_into().unwrap_or([0u8; 8]));
    let recipient = PeerId::from_bytes(recipient_bytes.try_into().unwrap_or([0u8; 8]));

    Ok(OutboxRecord {
        message_id,
        sender,
        recipient,
        payload: row.get(3)?,
        priority: MessagePriority::from_i64(row.get(4)?),
        status: MessageStatus::from_i64(row.get(5)?),
        attempts: row.get(6)?,
        next_attempt_at: row.get::<_, i64>(7)? as u64,
        expires_at: row.get::<_, i64>(8)? as u64,
        created_at: row.get::<_, i64>(9)? as u64,
    })
}

pub fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(priority: MessagePriority, created_at: u64) -> OutboxRecord {
        OutboxRecord {
            message_id: MessageId::new(),
            sender: PeerId::from_bytes([1; 8]),
            recipient: PeerId::from_bytes([2; 8]),
            payload: b"hi".to_vec(),
            priority,
            status: MessageStatus::Pending,
            attempts: 0,
            next_attempt_at: 0,
            expires_at: u64::MAX,
            created_at,
        }
    }

    #[test]
    fn insert_and_fetch_round_trips() {
        let store = OutboxStore::open_in_memory().unwrap();
        let record = sample(MessagePriority::DirectMessage, 1);
        store.insert(&record).unwrap();
        let fetched = store.get(&record.message_id).unwrap().unwrap();
        assert_eq!(fetched.payload, record.payload);
        assert_eq!(fetched.status, MessageStatus::Pending);
    }

    #[test]
    fn pending_ordered_is_priority_then_fifo() {
        let store = OutboxStore::open_in_memory().unwrap();
        let low = sample(MessagePriority::StatusProbe, 1);
        let high = sample(MessagePriority::DirectMessage, 2);
        let high_earlier = sample(MessagePriority::DirectMessage, 0);
        store.insert(&low).unwrap();
        store.insert(&high).unwrap();
        store.insert(&high_earlier).unwrap();

        let ordered = store.pending_ordered().unwrap();
        assert_eq!(ordered[0].message_id, high_earlier.message_id);
        assert_eq!(ordered[1].message_id, high.message_id);
        assert_eq!(ordered[2].message_id, low.message_id);
    }

    #[test]
    fn status_transitions_persist() {
        let store = OutboxStore::open_in_memory().unwrap();
        let record = sample(MessagePriority::BroadcastChatter, 1);
        store.insert(&record).unwrap();
        store.set_status(&record.message_id, MessageStatus::Sent).unwrap();
        assert_eq!(store.get(&record.message_id).unwrap().unwrap().status, MessageStatus::Sent);
        assert_eq!(
            store.pending_ordered().unwrap().len(),
            1,
            "a Sent row is still retryable until it's acked or a restart confirms otherwise"
        );

        store.set_status(&record.message_id, MessageStatus::Delivered).unwrap();
        assert!(store.pending_ordered().unwrap().is_empty());
    }
}
