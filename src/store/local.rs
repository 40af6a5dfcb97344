//! Sled-based local log and blob store
//!
//! Three trees:
//! - `log`: append-only entries keyed by big-endian timestamp followed by id,
//!   so sled's key order is timestamp order
//! - `blobs`: arbitrary payloads keyed by an opaque content identifier
//! - `kv`: generic key-value entries (see `KeyValueStore`)

use crate::error::{Error, Result};
use crate::store::KeyValueStore;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};
use uuid::Uuid;

/// A single log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Caller-provided identifier
    pub id: String,
    /// Milliseconds since the Unix epoch
    pub timestamp_ms: u64,
    /// Free-form entry kind, e.g. `vault.write`
    pub kind: String,
    /// Opaque payload
    pub payload: Vec<u8>,
}

impl LogEntry {
    /// Create an entry stamped with the current time and a random id
    pub fn new(kind: impl Into<String>, payload: Vec<u8>) -> Self {
        LogEntry {
            id: Uuid::new_v4().to_string(),
            timestamp_ms: now_ms(),
            kind: kind.into(),
            payload,
        }
    }
}

fn now_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// Content identifier for a blob (BLAKE3, hex)
pub fn content_id(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// Local store statistics
#[derive(Debug, Clone)]
pub struct StoreStats {
    pub log_entries: u64,
    pub blobs: u64,
}

/// Append-only log plus content-addressed blob table on sled
pub struct LocalStore {
    db: Db,
    log: Tree,
    blobs: Tree,
    kv: Tree,
    /// Highest timestamp handed out by `append_now`
    last_ts: AtomicU64,
}

impl LocalStore {
    /// Open or create a store at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path.as_ref())?;
        let store = Self::from_db(db)?;
        info!(
            "Local store opened at {:?}, {} log entries",
            path.as_ref(),
            store.log.len()
        );
        Ok(store)
    }

    /// Create a temporary store (for testing)
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> Result<Self> {
        let log = db.open_tree("log")?;
        let blobs = db.open_tree("blobs")?;
        let kv = db.open_tree("kv")?;

        let last_ts = match log.last()? {
            Some((key, _)) => Self::timestamp_of(&key)?,
            None => 0,
        };

        Ok(LocalStore {
            db,
            log,
            blobs,
            kv,
            last_ts: AtomicU64::new(last_ts),
        })
    }

    fn log_key(entry: &LogEntry) -> Vec<u8> {
        let mut key = Vec::with_capacity(8 + entry.id.len());
        key.extend_from_slice(&entry.timestamp_ms.to_be_bytes());
        key.extend_from_slice(entry.id.as_bytes());
        key
    }

    fn timestamp_of(key: &[u8]) -> Result<u64> {
        let prefix: [u8; 8] = key
            .get(..8)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| Error::Deserialization("Malformed log key".to_string()))?;
        Ok(u64::from_be_bytes(prefix))
    }

    /// Append an entry as given
    pub fn append(&self, entry: &LogEntry) -> Result<()> {
        let value = bincode::serialize(entry)?;
        self.log.insert(Self::log_key(entry), value)?;
        self.last_ts.fetch_max(entry.timestamp_ms, Ordering::SeqCst);
        debug!("Appended log entry {} ({})", entry.id, entry.kind);
        Ok(())
    }

    /// Append with a timestamp strictly greater than any handed out before
    pub fn append_now(&self, kind: &str, payload: Vec<u8>) -> Result<LogEntry> {
        let mut entry = LogEntry::new(kind, payload);
        let now = entry.timestamp_ms;
        let prev = self
            .last_ts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .map_err(|_| Error::Internal("Timestamp update failed".to_string()))?;
        entry.timestamp_ms = now.max(prev + 1);

        self.append(&entry)?;
        Ok(entry)
    }

    /// List entries newest-first, optionally only those newer than `after`
    pub fn list(&self, after: Option<u64>, limit: usize) -> Result<Vec<LogEntry>> {
        let mut entries = Vec::new();

        for result in self.log.iter().rev() {
            if entries.len() >= limit {
                break;
            }

            let (key, value) = result?;
            if let Some(cursor) = after {
                if Self::timestamp_of(&key)? <= cursor {
                    break;
                }
            }

            entries.push(bincode::deserialize(&value)?);
        }

        Ok(entries)
    }

    /// Store a blob under `id`, overwriting any previous payload
    pub fn put_blob(&self, id: &str, data: &[u8]) -> Result<()> {
        self.blobs.insert(id.as_bytes(), data)?;
        debug!("Stored blob {} ({} bytes)", id, data.len());
        Ok(())
    }

    /// Store a blob under its BLAKE3 content id and return the id
    pub fn store_blob(&self, data: &[u8]) -> Result<String> {
        let id = content_id(data);
        self.put_blob(&id, data)?;
        Ok(id)
    }

    /// Get a blob
    pub fn get_blob(&self, id: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.get(id.as_bytes())?.map(|v| v.to_vec()))
    }

    /// Check whether a blob exists
    pub fn has_blob(&self, id: &str) -> Result<bool> {
        Ok(self.blobs.contains_key(id.as_bytes())?)
    }

    /// Delete a blob
    pub fn delete_blob(&self, id: &str) -> Result<()> {
        self.blobs.remove(id.as_bytes())?;
        Ok(())
    }

    /// Get store statistics
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            log_entries: self.log.len() as u64,
            blobs: self.blobs.len() as u64,
        }
    }

    /// Flush to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl KeyValueStore for LocalStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.kv.get(key.as_bytes())?.map(|v| v.to_vec()))
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.kv.insert(key.as_bytes(), value)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.kv.remove(key.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_at(id: &str, ts: u64) -> LogEntry {
        LogEntry {
            id: id.to_string(),
            timestamp_ms: ts,
            kind: "test".to_string(),
            payload: id.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_list_newest_first() {
        let store = LocalStore::temporary().unwrap();
        store.append(&entry_at("b", 200)).unwrap();
        store.append(&entry_at("a", 100)).unwrap();
        store.append(&entry_at("c", 300)).unwrap();

        let ids: Vec<_> = store
            .list(None, 10)
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec!["c", "b", "a"]);
    }

    #[test]
    fn test_list_cursor_and_limit() {
        let store = LocalStore::temporary().unwrap();
        for (i, ts) in [100u64, 200, 300, 400].iter().enumerate() {
            store.append(&entry_at(&format!("e{}", i), *ts)).unwrap();
        }

        let newer = store.list(Some(200), 10).unwrap();
        assert_eq!(newer.len(), 2);
        assert!(newer.iter().all(|e| e.timestamp_ms > 200));

        let capped = store.list(None, 3).unwrap();
        assert_eq!(capped.len(), 3);
        assert_eq!(capped[0].timestamp_ms, 400);
    }

    #[test]
    fn test_append_now_is_strictly_increasing() {
        let store = LocalStore::temporary().unwrap();
        let a = store.append_now("k", vec![]).unwrap();
        let b = store.append_now("k", vec![]).unwrap();
        let c = store.append_now("k", vec![]).unwrap();
        assert!(a.timestamp_ms < b.timestamp_ms);
        assert!(b.timestamp_ms < c.timestamp_ms);

        let newest = store.list(None, 1).unwrap();
        assert_eq!(newest[0].id, c.id);
    }

    #[test]
    fn test_blob_overwrite() {
        let store = LocalStore::temporary().unwrap();
        store.put_blob("id1", b"first").unwrap();
        store.put_blob("id1", b"second").unwrap();

        assert_eq!(store.get_blob("id1").unwrap().unwrap(), b"second");
        assert_eq!(store.stats().blobs, 1);

        store.delete_blob("id1").unwrap();
        assert!(!store.has_blob("id1").unwrap());
    }

    #[test]
    fn test_store_blob_content_addressed() {
        let store = LocalStore::temporary().unwrap();
        let id1 = store.store_blob(b"payload").unwrap();
        let id2 = store.store_blob(b"payload").unwrap();

        assert_eq!(id1, id2);
        assert_eq!(id1, content_id(b"payload"));
        assert_eq!(store.stats().blobs, 1);
    }

    #[test]
    fn test_reopen_keeps_timestamp_order() {
        let dir = tempfile::tempdir().unwrap();
        let far_future = now_ms() + 60_000;
        {
            let store = LocalStore::open(dir.path().join("db")).unwrap();
            store.append(&entry_at("future", far_future)).unwrap();
            store.flush().unwrap();
        }

        let store = LocalStore::open(dir.path().join("db")).unwrap();
        let next = store.append_now("k", vec![]).unwrap();
        assert!(next.timestamp_ms > far_future);
    }

    #[test]
    fn test_kv_tree() {
        let store = LocalStore::temporary().unwrap();
        store.put("settings", b"{}").unwrap();
        assert_eq!(KeyValueStore::get(&store, "settings").unwrap().unwrap(), b"{}");
        store.remove("settings").unwrap();
        assert!(KeyValueStore::get(&store, "settings").unwrap().is_none());
    }
}
