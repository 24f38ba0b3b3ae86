pub mod atoms;
pub mod database;
pub mod durable;
pub mod error;
pub mod schema;
pub mod sources;

pub use atoms::{Atom, AtomRegistry, Subscription};
pub use database::Database;
pub use durable::{DurableStore, MemoryStore, SqliteStore, StoredRow, ATOM_PREFIX};
pub use error::StoreError;
pub use sources::SourceStore;
