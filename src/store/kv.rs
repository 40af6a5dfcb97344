//! Simple key-value store implementations

use crate::error::{Error, Result};
use crate::store::KeyValueStore;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::debug;

/// In-memory store, used for tests and unsupported environments
#[derive(Default)]
pub struct MemoryKv {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl KeyValueStore for MemoryKv {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.entries.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }
}

/// Key-value store persisted as a single JSON file (values base64-encoded)
///
/// The whole map is rewritten on each change; it is meant for a handful of
/// small entries such as the recent-vaults list.
pub struct JsonFileKv {
    path: PathBuf,
    entries: RwLock<BTreeMap<String, String>>,
}

impl JsonFileKv {
    /// Open (or lazily create) the store at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let entries = if path.exists() {
            let content = std::fs::read(&path)?;
            serde_json::from_slice(&content)
                .map_err(|e| Error::Deserialization(format!("{}: {}", path.display(), e)))?
        } else {
            BTreeMap::new()
        };

        debug!("Opened key-value file {:?}", path);
        Ok(JsonFileKv {
            path,
            entries: RwLock::new(entries),
        })
    }

    fn persist(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_vec_pretty(entries)?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl KeyValueStore for JsonFileKv {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.entries.read().get(key) {
            Some(encoded) => STANDARD
                .decode(encoded)
                .map(Some)
                .map_err(|e| Error::Deserialization(e.to_string())),
            None => Ok(None),
        }
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut entries = self.entries.write();
        entries.insert(key.to_string(), STANDARD.encode(value));
        self.persist(&entries)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.write();
        if entries.remove(key).is_some() {
            self.persist(&entries)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_kv() {
        let kv = MemoryKv::new();
        assert!(kv.get("a").unwrap().is_none());

        kv.put("a", b"one").unwrap();
        kv.put("a", b"two").unwrap();
        assert_eq!(kv.get("a").unwrap().unwrap(), b"two");
        assert_eq!(kv.len(), 1);

        kv.remove("a").unwrap();
        assert!(kv.is_empty());
    }

    #[test]
    fn test_json_file_kv_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.json");

        {
            let kv = JsonFileKv::open(&path).unwrap();
            kv.put("recent", &[0, 1, 2, 255]).unwrap();
        }

        let kv = JsonFileKv::open(&path).unwrap();
        assert_eq!(kv.get("recent").unwrap().unwrap(), vec![0, 1, 2, 255]);

        kv.remove("recent").unwrap();
        let kv = JsonFileKv::open(&path).unwrap();
        assert!(kv.get("recent").unwrap().is_none());
    }

    #[test]
    fn test_json_helpers() {
        let kv = MemoryKv::new();
        crate::store::put_json(&kv, "n", &vec![1u32, 2, 3]).unwrap();
        let back: Option<Vec<u32>> = crate::store::get_json(&kv, "n").unwrap();
        assert_eq!(back, Some(vec![1, 2, 3]));
    }
}
