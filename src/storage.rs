// src/storage.rs
// Durable transaction cache keyed by (network iso, tx hash). Callers treat
// this as opaque storage; failures propagate instead of retrying.

use rusqlite::{params, Connection, Error as RusqliteError};
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRecord {
    pub tx_hash: String,
    pub buff: Vec<u8>,
    pub block_height: u32,
    pub timestamp: u32,
    pub remark: String,
}

pub trait TransactionStore: Send + Sync + std::fmt::Debug {
    fn put_transaction(&self, iso: &str, record: &TransactionRecord) -> Result<(), RusqliteError>;
    fn update_transaction(&self, iso: &str, record: &TransactionRecord) -> Result<(), RusqliteError>;
    fn delete_transaction(&self, iso: &str, tx_hash: &str) -> Result<(), RusqliteError>;
    fn delete_all_transactions(&self, iso: &str) -> Result<(), RusqliteError>;
    fn get_transaction(&self, iso: &str, tx_hash: &str) -> Result<Option<TransactionRecord>, RusqliteError>;
    fn get_all_transactions(&self, iso: &str) -> Result<Vec<TransactionRecord>, RusqliteError>;
}

pub struct SqliteTransactionStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteTransactionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteTransactionStore")
            .field("conn", &"Mutex<Connection>")
            .finish()
    }
}

impl SqliteTransactionStore {
    pub fn new(db_path: &str) -> Result<Self, RusqliteError> {
        Self::with_connection(Connection::open(db_path)?)
    }

    pub fn open_in_memory() -> Result<Self, RusqliteError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, RusqliteError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS transactions (\
                tx_hash TEXT NOT NULL, \
                buff BLOB NOT NULL, \
                block_height INTEGER NOT NULL, \
                timestamp INTEGER NOT NULL, \
                remark TEXT NOT NULL DEFAULT '', \
                iso TEXT NOT NULL, \
                PRIMARY KEY (iso, tx_hash))",
            [],
        )?;
        Ok(SqliteTransactionStore { conn: Mutex::new(conn) })
    }
}

impl TransactionStore for SqliteTransactionStore {
    /// Insert, or update the existing row when the key is already present.
    /// A single upsert statement, so concurrent puts of the same key from
    /// two sessions cannot race a separate existence check.
    fn put_transaction(&self, iso: &str, record: &TransactionRecord) -> Result<(), RusqliteError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO transactions (tx_hash, buff, block_height, timestamp, remark, iso) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(iso, tx_hash) DO UPDATE SET \
                buff = excluded.buff, \
                block_height = excluded.block_height, \
                timestamp = excluded.timestamp, \
                remark = excluded.remark",
            params![record.tx_hash, record.buff, record.block_height, record.timestamp, record.remark, iso],
        )?;
        Ok(())
    }

    fn update_transaction(&self, iso: &str, record: &TransactionRecord) -> Result<(), RusqliteError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE transactions SET buff = ?1, block_height = ?2, timestamp = ?3, remark = ?4 \
             WHERE iso = ?5 AND tx_hash = ?6",
            params![record.buff, record.block_height, record.timestamp, record.remark, iso, record.tx_hash],
        )?;
        Ok(())
    }

    fn delete_transaction(&self, iso: &str, tx_hash: &str) -> Result<(), RusqliteError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM transactions WHERE iso = ?1 AND tx_hash = ?2",
            params![iso, tx_hash],
        )?;
        Ok(())
    }

    fn delete_all_transactions(&self, iso: &str) -> Result<(), RusqliteError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM transactions WHERE iso = ?1", params![iso])?;
        Ok(())
    }

    fn get_transaction(&self, iso: &str, tx_hash: &str) -> Result<Option<TransactionRecord>, RusqliteError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT buff, block_height, timestamp, remark FROM transactions \
             WHERE iso = ?1 AND tx_hash = ?2",
        )?;
        let mut rows = stmt.query(params![iso, tx_hash])?;
        if let Some(row) = rows.next()? {
            Ok(Some(TransactionRecord {
                tx_hash: tx_hash.to_string(),
                buff: row.get(0)?,
                block_height: row.get(1)?,
                timestamp: row.get(2)?,
                remark: row.get(3)?,
            }))
        } else {
            Ok(None)
        }
    }

    fn get_all_transactions(&self, iso: &str) -> Result<Vec<TransactionRecord>, RusqliteError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT tx_hash, buff, block_height, timestamp, remark FROM transactions WHERE iso = ?1",
        )?;
        let rows = stmt.query_map(params![iso], |row| {
            Ok(TransactionRecord {
                tx_hash: row.get(0)?,
                buff: row.get(1)?,
                block_height: row.get(2)?,
                timestamp: row.get(3)?,
                remark: row.get(4)?,
            })
        })?;
        rows.collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(hash: &str, height: u32) -> TransactionRecord {
        TransactionRecord {
            tx_hash: hash.to_string(),
            buff: vec![1, 2, 3],
            block_height: height,
            timestamp: 1_700_000_000,
            remark: "r".to_string(),
        }
    }

    #[test]
    fn put_then_get_round_trips() {
        let store = SqliteTransactionStore::open_in_memory().unwrap();
        let rec = record("abc", 5);
        store.put_transaction("ela", &rec).unwrap();
        assert_eq!(store.get_transaction("ela", "abc").unwrap(), Some(rec));
        assert_eq!(store.get_transaction("ela", "missing").unwrap(), None);
    }

    #[test]
    fn put_on_existing_key_updates_in_place() {
        let store = SqliteTransactionStore::open_in_memory().unwrap();
        store.put_transaction("ela", &record("abc", 5)).unwrap();
        store.put_transaction("ela", &record("abc", 9)).unwrap();
        let all = store.get_all_transactions("ela").unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].block_height, 9);
    }

    #[test]
    fn concurrent_puts_of_the_same_key_never_error() {
        let store = std::sync::Arc::new(SqliteTransactionStore::open_in_memory().unwrap());
        let mut workers = Vec::new();
        for height in 0..8u32 {
            let store = std::sync::Arc::clone(&store);
            workers.push(std::thread::spawn(move || {
                store.put_transaction("ela", &record("abc", height)).unwrap();
            }));
        }
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(store.get_all_transactions("ela").unwrap().len(), 1);
    }

    #[test]
    fn records_are_scoped_by_iso() {
        let store = SqliteTransactionStore::open_in_memory().unwrap();
        store.put_transaction("ela", &record("abc", 5)).unwrap();
        store.put_transaction("ela-test", &record("abc", 7)).unwrap();
        store.delete_all_transactions("ela").unwrap();
        assert!(store.get_all_transactions("ela").unwrap().is_empty());
        assert_eq!(store.get_all_transactions("ela-test").unwrap().len(), 1);
    }

    #[test]
    fn delete_removes_only_the_named_row() {
        let store = SqliteTransactionStore::open_in_memory().unwrap();
        store.put_transaction("ela", &record("a", 1)).unwrap();
        store.put_transaction("ela", &record("b", 2)).unwrap();
        store.delete_transaction("ela", "a").unwrap();
        let all = store.get_all_transactions("ela").unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].tx_hash, "b");
    }
}
