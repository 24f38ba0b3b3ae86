//! Virtual source store: a durable map of virtual file path to source text.
//!
//! Reads are served from memory. Writes update memory first and then write
//! through to the durable store; a persistence failure is logged and does
//! not undo the in-memory write. There is no locking beyond the map itself:
//! authoring-driven writes are serialized by the engine's authoring queue.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::durable::{DurableStore, ATOM_PREFIX};
use crate::error::StoreError;

pub struct SourceStore {
    files: RwLock<BTreeMap<String, String>>,
    store: Arc<dyn DurableStore>,
}

impl SourceStore {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self {
            files: RwLock::new(BTreeMap::new()),
            store,
        }
    }

    /// Load every non-atom row from durable storage into memory.
    pub async fn hydrate(&self) -> Result<usize, StoreError> {
        let rows = self.store.get_all().await?;
        let mut files = self.files.write();
        let mut loaded = 0;
        for row in rows {
            if row.key.starts_with(ATOM_PREFIX) {
                continue;
            }
            files.insert(row.key, row.value);
            loaded += 1;
        }
        debug!(loaded, "source store hydrated");
        Ok(loaded)
    }

    pub fn get(&self, path: &str) -> Option<String> {
        self.files.read().get(&normalize_path(path)).cloned()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.read().contains_key(&normalize_path(path))
    }

    /// Write `text` at `path`, last write wins.
    pub async fn set(&self, path: &str, text: &str) {
        let path = normalize_path(path);
        self.files.write().insert(path.clone(), text.to_owned());
        if let Err(e) = self.store.put(&path, text).await {
            warn!(path = %path, error = %e, "failed to persist source row");
        }
    }

    /// All paths, sorted.
    pub fn list(&self) -> Vec<String> {
        self.files.read().keys().cloned().collect()
    }

    /// Paths under a directory prefix, sorted.
    pub fn list_dir(&self, dir: &str) -> Vec<String> {
        let mut prefix = normalize_path(dir);
        if !prefix.ends_with('/') {
            prefix.push('/');
        }
        self.files
            .read()
            .keys()
            .filter(|p| p.starts_with(&prefix))
            .cloned()
            .collect()
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.files.read().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.files.read().is_empty()
    }

    /// Wipe durable storage and the in-memory view. Atom rows share the
    /// durable store and are wiped too; callers reload or restart afterwards.
    pub async fn clear(&self) -> Result<(), StoreError> {
        self.files.write().clear();
        self.store.clear().await
    }
}

/// Virtual paths are absolute; `a/b.lua` and `/a/b.lua` name the same file.
pub fn normalize_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_owned()
    } else {
        format!("/{path}")
    }
}
