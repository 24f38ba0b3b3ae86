//! Shared atom registry: named, persisted, pub/sub reactive cells.
//!
//! `get`, `set` and `subscribe` are synchronous. Listeners run inside the
//! `set` call, before it returns. Persistence goes through a single writer
//! task fed by an unbounded channel, so writes land in `set` order and a
//! failed write never rolls back the in-memory value.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::durable::{DurableStore, ATOM_PREFIX};
use crate::error::StoreError;

pub type Listener = Arc<dyn Fn(&Value) + Send + Sync>;

enum PersistOp {
    Write { key: String, value: Value },
    Flush(oneshot::Sender<()>),
}

pub struct Atom {
    key: String,
    default_value: Value,
    value: RwLock<Value>,
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_listener: AtomicU64,
    persist: Option<mpsc::UnboundedSender<PersistOp>>,
}

impl Atom {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn default_value(&self) -> &Value {
        &self.default_value
    }

    pub fn get(&self) -> Value {
        self.value.read().clone()
    }

    /// Replace the value. Returns `false` (and notifies nobody) when the new
    /// value is structurally equal to the current one.
    pub fn set(&self, value: Value) -> bool {
        if !self.replace(value.clone()) {
            return false;
        }
        if let Some(tx) = &self.persist {
            let op = PersistOp::Write {
                key: self.key.clone(),
                value,
            };
            if tx.send(op).is_err() {
                warn!(key = %self.key, "atom writer stopped, value not persisted");
            }
        }
        true
    }

    /// Set without persisting; used when the value came from storage.
    fn apply_hydrated(&self, value: Value) {
        self.replace(value);
    }

    fn replace(&self, value: Value) -> bool {
        {
            let mut current = self.value.write();
            if *current == value {
                return false;
            }
            *current = value.clone();
        }
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(&value);
        }
        true
    }

    /// Register a listener. It stays registered until the returned
    /// subscription is dropped or unsubscribed.
    #[must_use = "dropping the subscription unsubscribes the listener"]
    pub fn subscribe<F>(self: &Arc<Self>, listener: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push((id, Arc::new(listener)));
        Subscription {
            atom: Arc::downgrade(self),
            id,
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }
}

pub struct Subscription {
    atom: Weak<Atom>,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(atom) = self.atom.upgrade() {
            atom.listeners.lock().retain(|(id, _)| *id != self.id);
        }
    }
}

pub struct AtomRegistry {
    atoms: DashMap<String, Arc<Atom>>,
    pending: Mutex<HashMap<String, Value>>,
    store: Arc<dyn DurableStore>,
    persist: Option<mpsc::UnboundedSender<PersistOp>>,
}

impl AtomRegistry {
    /// Build a registry persisting into `store`. The writer task is spawned
    /// on the current tokio runtime; outside a runtime, atoms stay
    /// memory-only.
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        let persist = match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let (tx, rx) = mpsc::unbounded_channel();
                handle.spawn(run_writer(Arc::clone(&store), rx));
                Some(tx)
            }
            Err(_) => {
                warn!("no tokio runtime, atom persistence disabled");
                None
            }
        };
        Self {
            atoms: DashMap::new(),
            pending: Mutex::new(HashMap::new()),
            store,
            persist,
        }
    }

    /// Load persisted atom values. Values for atoms that already exist are
    /// applied immediately, the rest are stashed until `create` is called.
    pub async fn hydrate(&self) -> Result<usize, StoreError> {
        let rows = self.store.get_all().await?;
        let mut loaded = 0;
        for row in rows {
            let Some(key) = row.atom_key() else { continue };
            let value: Value = match serde_json::from_str(&row.value) {
                Ok(v) => v,
                Err(e) => {
                    warn!(key, error = %e, "skipping corrupt atom row");
                    continue;
                }
            };
            loaded += 1;
            match self.atoms.get(key) {
                Some(atom) => atom.apply_hydrated(value),
                None => {
                    self.pending.lock().insert(key.to_owned(), value);
                }
            }
        }
        debug!(loaded, "atom registry hydrated");
        Ok(loaded)
    }

    /// Return the atom for `key`, creating it on first use. A stashed
    /// hydrated value takes precedence over `default_value`.
    pub fn create(&self, key: &str, default_value: Value) -> Arc<Atom> {
        if let Some(atom) = self.atoms.get(key) {
            return Arc::clone(atom.value());
        }
        let entry = self.atoms.entry(key.to_owned()).or_insert_with(|| {
            let initial = self
                .pending
                .lock()
                .remove(key)
                .unwrap_or_else(|| default_value.clone());
            Arc::new(Atom {
                key: key.to_owned(),
                default_value,
                value: RwLock::new(initial),
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(0),
                persist: self.persist.clone(),
            })
        });
        Arc::clone(entry.value())
    }

    pub fn get(&self, key: &str) -> Option<Arc<Atom>> {
        self.atoms.get(key).map(|a| Arc::clone(a.value()))
    }

    /// Current value of `key`, including values hydrated but not yet claimed
    /// by `create`.
    pub fn value(&self, key: &str) -> Option<Value> {
        if let Some(atom) = self.atoms.get(key) {
            return Some(atom.get());
        }
        self.pending.lock().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.snapshot().into_keys().collect()
    }

    /// Every known key with its current value, sorted by key.
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        let mut out: BTreeMap<String, Value> = self
            .pending
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for entry in self.atoms.iter() {
            out.insert(entry.key().clone(), entry.value().get());
        }
        out
    }

    /// Wait until every write queued so far has reached the durable store.
    pub async fn flush(&self) {
        let Some(tx) = &self.persist else { return };
        let (done_tx, done_rx) = oneshot::channel();
        if tx.send(PersistOp::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

async fn run_writer(store: Arc<dyn DurableStore>, mut rx: mpsc::UnboundedReceiver<PersistOp>) {
    while let Some(op) = rx.recv().await {
        match op {
            PersistOp::Write { key, value } => {
                let row_key = format!("{ATOM_PREFIX}{key}");
                if let Err(e) = store.put(&row_key, &value.to_string()).await {
                    warn!(key = %key, error = %e, "failed to persist atom");
                }
            }
            PersistOp::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}
