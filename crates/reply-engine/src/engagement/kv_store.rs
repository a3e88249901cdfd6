//! Durable key-value storage for engagement checkpoints

use chrono::Utc;
use dashmap::DashMap;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{EngineError, EngineResult};

/// Synchronous byte store. Writes must be durable when `save` returns.
pub trait KeyValueStore: Send + Sync {
    fn load(&self, key: &str) -> EngineResult<Option<Vec<u8>>>;
    fn save(&self, key: &str, value: &[u8]) -> EngineResult<()>;
    fn delete(&self, key: &str) -> EngineResult<()>;
}

const KV_SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL,
    updated_at TEXT NOT NULL
);
";

pub struct SqliteKeyValueStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl SqliteKeyValueStore {
    pub fn new(db_path: &Path) -> EngineResult<Self> {
        info!("Opening engagement store at: {}", db_path.display());
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| EngineError::Storage(format!("cannot create {}: {}", parent.display(), e)))?;
        }
        let manager = SqliteConnectionManager::file(db_path).with_flags(
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        );
        let pool = Pool::builder().max_size(4).build(manager)?;
        {
            let conn = pool.get()?;
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA busy_timeout = 5000;",
            )?;
            conn.execute_batch(KV_SCHEMA_SQL)?;
        }
        Ok(Self { pool: Arc::new(pool) })
    }

    /// Single-connection in-memory database; every pooled connection to
    /// `:memory:` would otherwise see its own empty database.
    pub fn new_in_memory() -> EngineResult<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder().max_size(1).build(manager)?;
        {
            let conn = pool.get()?;
            conn.execute_batch(KV_SCHEMA_SQL)?;
        }
        Ok(Self { pool: Arc::new(pool) })
    }

    /// Pool handle for other tables living in the same database.
    pub fn pool(&self) -> Arc<Pool<SqliteConnectionManager>> {
        self.pool.clone()
    }

    fn get_conn(&self) -> EngineResult<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(EngineError::from)
    }
}

impl KeyValueStore for SqliteKeyValueStore {
    fn load(&self, key: &str) -> EngineResult<Option<Vec<u8>>> {
        let conn = self.get_conn()?;
        let value = conn
            .query_row("SELECT value FROM kv_store WHERE key = ?1", params![key], |row| {
                row.get::<_, Vec<u8>>(0)
            })
            .optional()?;
        Ok(value)
    }

    fn save(&self, key: &str, value: &[u8]) -> EngineResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO kv_store (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, Utc::now().to_rfc3339()],
        )?;
        debug!("Saved {} bytes under {}", value.len(), key);
        Ok(())
    }

    fn delete(&self, key: &str) -> EngineResult<()> {
        let conn = self.get_conn()?;
        conn.execute("DELETE FROM kv_store WHERE key = ?1", params![key])?;
        Ok(())
    }
}

#[derive(Default, Clone)]
pub struct InMemoryKeyValueStore {
    entries: Arc<DashMap<String, Vec<u8>>>,
}

impl InMemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl KeyValueStore for InMemoryKeyValueStore {
    fn load(&self, key: &str) -> EngineResult<Option<Vec<u8>>> {
        Ok(self.entries.get(key).map(|v| v.clone()))
    }

    fn save(&self, key: &str, value: &[u8]) -> EngineResult<()> {
        self.entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> EngineResult<()> {
        self.entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_sqlite_save_load_delete() {
        let dir = tempdir().unwrap();
        let store = SqliteKeyValueStore::new(&dir.path().join("kv.db")).unwrap();

        assert!(store.load("a").unwrap().is_none());
        store.save("a", b"one").unwrap();
        store.save("a", b"two").unwrap();
        assert_eq!(store.load("a").unwrap().unwrap(), b"two".to_vec());

        store.delete("a").unwrap();
        assert!(store.load("a").unwrap().is_none());
    }

    #[test]
    fn test_sqlite_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("kv.db");
        {
            let store = SqliteKeyValueStore::new(&path).unwrap();
            store.save("key", b"value").unwrap();
        }
        let reopened = SqliteKeyValueStore::new(&path).unwrap();
        assert_eq!(reopened.load("key").unwrap().unwrap(), b"value".to_vec());
    }

    #[test]
    fn test_sqlite_in_memory() {
        let store = SqliteKeyValueStore::new_in_memory().unwrap();
        store.save("k", b"v").unwrap();
        assert_eq!(store.load("k").unwrap().unwrap(), b"v".to_vec());
    }

    #[test]
    fn test_in_memory_store() {
        let store = InMemoryKeyValueStore::new();
        store.save("k", b"v").unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.load("k").unwrap().unwrap(), b"v".to_vec());
        store.delete("k").unwrap();
        assert!(store.load("k").unwrap().is_none());
    }
}
