//! SQLite-backed snapshot store
//!
//! One row per storage key holding the serialized snapshot and the time it
//! was fetched. WAL mode so a CLI run can read while another process writes.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::sync::Arc;
use tracing::{info, warn};

use super::{SnapshotStore, StoredEntry};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS snapshot_cache (
    cache_key TEXT PRIMARY KEY,
    cache_json TEXT NOT NULL,
    fetched_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_snapshot_cache_fetched_at
    ON snapshot_cache(fetched_at DESC);
"#;

pub struct SqliteSnapshotStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSnapshotStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX; // guarded by our own mutex

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open snapshot cache at {}", db_path))?;

        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize snapshot cache schema")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        // in-memory databases report "memory"
        if db_path != ":memory:" && journal_mode.to_lowercase() != "wal" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        let entries: i64 = conn
            .query_row("SELECT COUNT(*) FROM snapshot_cache", [], |row| row.get(0))
            .unwrap_or(0);
        info!(path = db_path, entries, "snapshot cache opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

impl SnapshotStore for SqliteSnapshotStore {
    fn load(&self, storage_key: &str) -> Result<Option<StoredEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT cache_json, fetched_at FROM snapshot_cache WHERE cache_key = ?1",
        )?;
        let entry = stmt
            .query_row([storage_key], |row| {
                Ok(StoredEntry {
                    payload: row.get(0)?,
                    fetched_at: row.get(1)?,
                })
            })
            .optional()?;
        Ok(entry)
    }

    fn save(&self, storage_key: &str, payload: &str, fetched_at: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO snapshot_cache (cache_key, cache_json, fetched_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(cache_key) DO UPDATE SET cache_json=excluded.cache_json, fetched_at=excluded.fetched_at",
            params![storage_key, payload, fetched_at],
        )?;
        Ok(())
    }

    fn remove(&self, storage_key: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM snapshot_cache WHERE cache_key = ?1",
            params![storage_key],
        )?;
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare_cached("SELECT cache_key FROM snapshot_cache ORDER BY cache_key")?;
        let keys = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(keys)
    }

    fn purge_older_than(&self, cutoff: i64) -> Result<usize> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM snapshot_cache WHERE fetched_at < ?1",
            params![cutoff],
        )?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_load_overwrite() {
        let store = SqliteSnapshotStore::open(":memory:").expect("Failed to open store");
        assert!(store.load("v1:raid_loot").unwrap().is_none());

        store.save("v1:raid_loot", "{\"a\":1}", 10).unwrap();
        store.save("v1:raid_loot", "{\"a\":2}", 20).unwrap();

        let entry = store.load("v1:raid_loot").unwrap().unwrap();
        assert_eq!(entry.payload, "{\"a\":2}");
        assert_eq!(entry.fetched_at, 20);
        assert_eq!(store.keys().unwrap(), vec!["v1:raid_loot".to_string()]);
    }

    #[test]
    fn test_purge_older_than() {
        let store = SqliteSnapshotStore::open(":memory:").expect("Failed to open store");
        store.save("v1:a", "{}", 10).unwrap();
        store.save("v1:b", "{}", 50).unwrap();
        assert_eq!(store.purge_older_than(20).unwrap(), 1);
        assert_eq!(store.keys().unwrap(), vec!["v1:b".to_string()]);
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        let path = path.to_str().unwrap();
        {
            let store = SqliteSnapshotStore::open(path).unwrap();
            store.save("v1:raid_loot", "[1,2,3]", 99).unwrap();
        }
        let store = SqliteSnapshotStore::open(path).unwrap();
        assert_eq!(store.load("v1:raid_loot").unwrap().unwrap().payload, "[1,2,3]");
    }
}
