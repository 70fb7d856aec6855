//! The persistence contract the core depends on: a flat byte-string
//! key/value store with prefix scan. Whatever the UI layer uses for its own
//! storage (sqlite, a platform keychain, an embedded KV engine) only has to
//! implement this trait for the core to use it — the core never assumes a
//! particular backend.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection};

use crate::error::Result;

pub trait KvStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;
    fn delete(&self, key: &[u8]) -> Result<()>;
    fn scan(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;
}

/// The default `KvStore` implementation: a single SQLite table, reusing the
/// same engine the durable outbox already depends on.
pub struct SqliteKvStore {
    conn: Mutex<Connection>,
}

impl SqliteKvStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv (key BLOB PRIMARY KEY, value BLOB NOT NULL)",
            [],
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute(
            "CREATE TABLE kv (key BLOB PRIMARY KEY, value BLOB NOT NULL)",
            [],
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }
}

impl KvStore for SqliteKvStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        use rusqlite::OptionalExtension;
        self.conn
            .lock()
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| row.get(0))
            .optional()
            .map_err(crate::error::Error::from)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.conn.lock().execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn scan(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT key, value FROM kv WHERE substr(key, 1, ?1) = ?2")?;
        let rows = stmt
            .query_map(params![prefix.len() as i64, prefix], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_delete_round_trip() {
        let store = SqliteKvStore::open_in_memory().unwrap();
        store.put(b"favorites/alice", b"{}").unwrap();
        assert_eq!(store.get(b"favorites/alice").unwrap(), Some(b"{}".to_vec()));
        store.delete(b"favorites/alice").unwrap();
        assert_eq!(store.get(b"favorites/alice").unwrap(), None);
    }

    #[test]
    fn scan_matches_prefix_only() {
        let store = SqliteKvStore::open_in_memory().unwrap();
        store.put(b"favorites/alice", b"1").unwrap();
        store.put(b"favorites/bob", b"2").unwrap();
        store.put(b"blocks/carol", b"3").unwrap();

        let favorites = store.scan(b"favorites/").unwrap();
        assert_eq!(favorites.len(), 2);
    }
}
