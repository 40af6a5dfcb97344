//! Local persistence primitives
//!
//! - `KeyValueStore`: the small generic key-value surface used for settings,
//!   recent-vault lists and integrity manifests
//! - `LocalStore`: sled-backed append-only log plus content-addressed blob table

mod kv;
mod local;

pub use kv::{JsonFileKv, MemoryKv};
pub use local::{content_id, LocalStore, LogEntry, StoreStats};

use crate::error::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Generic byte-oriented key-value store
pub trait KeyValueStore: Send + Sync {
    /// Get the value for a key
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Insert or overwrite a value
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Remove a key (no-op if absent)
    fn remove(&self, key: &str) -> Result<()>;
}

/// Read a JSON value stored under `key`
pub fn get_json<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> Result<Option<T>> {
    match store.get(key)? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Store a value as JSON under `key`
pub fn put_json<T: Serialize>(store: &dyn KeyValueStore, key: &str, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec(value)?;
    store.put(key, &bytes)
}
