use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection};

use crate::database::Database;
use crate::error::StoreError;

/// Key prefix separating atom rows from source rows in the shared store.
pub const ATOM_PREFIX: &str = "atom:";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredRow {
    pub key: String,
    pub value: String,
}

impl StoredRow {
    /// The atom key, when this row belongs to the atom namespace.
    pub fn atom_key(&self) -> Option<&str> {
        self.key.strip_prefix(ATOM_PREFIX)
    }
}

/// Durable key/value storage behind the source store and atom registry.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn get_all(&self) -> Result<Vec<StoredRow>, StoreError>;
    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError>;
    async fn clear(&self) -> Result<(), StoreError>;
}

/// SQLite-backed durable store.
#[derive(Clone)]
pub struct SqliteStore {
    db: Database,
}

impl SqliteStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Run `f` against the connection on the blocking pool.
    async fn blocking<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || db.with_conn(f))
            .await
            .map_err(|e| StoreError::Unavailable(format!("sqlite task failed: {e}")))?
    }
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn get_all(&self) -> Result<Vec<StoredRow>, StoreError> {
        self.blocking(|conn| {
            let mut stmt = conn.prepare("SELECT key, value FROM entries ORDER BY key")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(StoredRow {
                        key: row.get(0)?,
                        value: row.get(1)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        }).await
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let now = chrono::Utc::now().to_rfc3339();
        let (key, value) = (key.to_owned(), value.to_owned());
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO entries (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, value, now],
            )?;
            Ok(())
        }).await
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.blocking(|conn| {
            conn.execute("DELETE FROM entries", [])?;
            Ok(())
        }).await
    }
}

/// In-memory durable store. Writes can be made to fail for exercising
/// persistence error paths.
#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<BTreeMap<String, String>>,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows<I, K, V>(rows: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let store = Self::new();
        {
            let mut map = store.rows.lock();
            for (k, v) in rows {
                map.insert(k.into(), v.into());
            }
        }
        store
    }

    /// Make every subsequent `put` fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn value(&self, key: &str) -> Option<String> {
        self.rows.lock().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn get_all(&self) -> Result<Vec<StoredRow>, StoreError> {
        Ok(self
            .rows
            .lock()
            .iter()
            .map(|(key, value)| StoredRow {
                key: key.clone(),
                value: value.clone(),
            })
            .collect())
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!("write to {key} rejected")));
        }
        self.rows.lock().insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.rows.lock().clear();
        Ok(())
    }
}
