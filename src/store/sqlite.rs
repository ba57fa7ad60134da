//! SQLite-backed key-value store.
//!
//! A single `kv` table of blob keys and values. SQLite compares blobs with
//! `memcmp`, so `ORDER BY key` matches the in-memory byte ordering and prefix
//! scans are range queries.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use tracing::{debug, info};

use super::{prefix_end, KvStore, WriteOp};
use crate::types::StoreError;

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (or create) the database at `db_path`.
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;

        let store = Self { conn };
        store.init_schema()?;

        info!("Ledger store opened at {:?}", db_path.as_ref());
        Ok(store)
    }

    /// Ephemeral database, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn
            .execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS kv (
                    key BLOB PRIMARY KEY,
                    value BLOB NOT NULL
                ) WITHOUT ROWID;
                "#,
            )
            .context("Failed to initialize schema")?;

        debug!("Database schema initialized");
        Ok(())
    }
}

impl KvStore for SqliteStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let value = self
            .conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = ?2",
            params![key, value],
        )?;
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), StoreError> {
        self.conn
            .execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn prefix_scan(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<(Vec<u8>, Vec<u8>)> {
            Ok((row.get(0)?, row.get(1)?))
        };
        let entries = match prefix_end(prefix) {
            Some(end) => {
                let mut stmt = self.conn.prepare(
                    "SELECT key, value FROM kv WHERE key >= ?1 AND key < ?2 ORDER BY key",
                )?;
                let rows = stmt.query_map(params![prefix, end], map_row)?;
                let collected = rows.collect::<Result<Vec<_>, _>>()?;
                collected
            }
            None => {
                let mut stmt = self
                    .conn
                    .prepare("SELECT key, value FROM kv WHERE key >= ?1 ORDER BY key")?;
                let rows = stmt.query_map(params![prefix], map_row)?;
                let collected = rows.collect::<Result<Vec<_>, _>>()?;
                collected
            }
        };
        Ok(entries)
    }

    fn apply(&mut self, ops: Vec<WriteOp>) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        let count = ops.len();
        for op in ops {
            match op {
                WriteOp::Set(key, value) => {
                    tx.execute(
                        "INSERT INTO kv (key, value) VALUES (?1, ?2)
                         ON CONFLICT(key) DO UPDATE SET value = ?2",
                        params![key, value],
                    )?;
                }
                WriteOp::Delete(key) => {
                    tx.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
                }
            }
        }
        tx.commit()?;
        debug!(ops = count, "Applied write set");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreBranch;

    #[test]
    fn test_sqlite_get_set_delete() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        assert_eq!(store.get(b"a").unwrap(), None);

        store.set(b"a", b"1").unwrap();
        store.set(b"a", b"2").unwrap();
        assert_eq!(store.get(b"a").unwrap(), Some(b"2".to_vec()));

        store.delete(b"a").unwrap();
        assert_eq!(store.get(b"a").unwrap(), None);
    }

    #[test]
    fn test_sqlite_prefix_scan_matches_byte_order() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store.set(&[1, 0xff], b"x").unwrap();
        store.set(&[1, 0x00, 5], b"y").unwrap();
        store.set(&[2], b"z").unwrap();
        store.set(&[0xff, 0xff, 1], b"w").unwrap();

        let scanned = store.prefix_scan(&[1]).unwrap();
        assert_eq!(
            scanned,
            vec![
                (vec![1, 0x00, 5], b"y".to_vec()),
                (vec![1, 0xff], b"x".to_vec())
            ]
        );

        let tail = store.prefix_scan(&[0xff, 0xff]).unwrap();
        assert_eq!(tail.len(), 1);
    }

    #[test]
    fn test_sqlite_applies_branch_write_set() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store.set(b"k1", b"old").unwrap();

        let ops = {
            let mut branch = StoreBranch::new(&store);
            branch.set(b"k1", b"new").unwrap();
            branch.set(b"k2", b"added").unwrap();
            branch.into_write_set()
        };
        store.apply(ops).unwrap();

        assert_eq!(store.get(b"k1").unwrap(), Some(b"new".to_vec()));
        assert_eq!(store.get(b"k2").unwrap(), Some(b"added".to_vec()));
    }
}
