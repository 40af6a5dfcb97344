//! In-memory adapter
//!
//! Holds a single container buffer for the open vault. Opening a different
//! vault discards it. This is the fallback for environments with no durable
//! storage and the baseline the other adapters are tested against.
//! The recents list lives in whatever store it is given, so it can outlast
//! the process even though the container does not.

use crate::error::{Error, Result};
use crate::storage::{
    export_bytes, resolve_open, AdapterKind, ExportOptions, ImportSource, OpenOptions,
    RecentVaultRecord, RecentVaults, StorageAdapter, VaultHandle,
};
use crate::store::{KeyValueStore, MemoryKv};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

#[derive(Default)]
struct Slot {
    current: Option<VaultHandle>,
    buffer: Option<Vec<u8>>,
}

pub struct MemoryAdapter {
    slot: Mutex<Slot>,
    recents: RecentVaults,
}

impl MemoryAdapter {
    /// Adapter keeping its recents list in `kv`
    pub fn new(kv: Arc<dyn KeyValueStore>, recents_limit: usize) -> Self {
        MemoryAdapter {
            slot: Mutex::new(Slot::default()),
            recents: RecentVaults::new(kv, recents_limit),
        }
    }

    /// Adapter with nothing persisted at all
    pub fn volatile(recents_limit: usize) -> Self {
        Self::new(Arc::new(MemoryKv::new()), recents_limit)
    }

    fn current(&self) -> Result<VaultHandle> {
        self.slot.lock().current.clone().ok_or(Error::NoVaultOpen)
    }
}

#[async_trait]
impl StorageAdapter for MemoryAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Memory
    }

    fn current_vault(&self) -> Option<VaultHandle> {
        self.slot.lock().current.clone()
    }

    async fn open_vault(&self, options: OpenOptions) -> Result<VaultHandle> {
        let exists = {
            let slot = self.slot.lock();
            match (&slot.current, &options.id) {
                (Some(current), Some(id)) => current.id == *id && slot.buffer.is_some(),
                _ => false,
            }
        };
        let remembered = match &options.id {
            Some(id) => self.recents.name_of(id)?,
            None => None,
        };

        let handle = resolve_open(options, exists, remembered)?;

        {
            let mut slot = self.slot.lock();
            let same = slot.current.as_ref().map(|c| c.id == handle.id) == Some(true);
            if !same {
                slot.buffer = None;
            }
            slot.current = Some(handle.clone());
        }

        self.recents.touch(&handle, self.kind())?;
        debug!("Opened in-memory vault {}", handle.id);
        Ok(handle)
    }

    async fn read_vault(&self) -> Result<Vec<u8>> {
        let slot = self.slot.lock();
        let current = slot.current.as_ref().ok_or(Error::NoVaultOpen)?;
        slot.buffer
            .clone()
            .ok_or_else(|| Error::NotFound(format!("vault {} has no data", current.id)))
    }

    async fn write_vault(&self, bytes: &[u8]) -> Result<()> {
        let mut slot = self.slot.lock();
        if slot.current.is_none() {
            return Err(Error::NoVaultOpen);
        }
        slot.buffer = Some(bytes.to_vec());
        Ok(())
    }

    async fn export_vault(&self, options: ExportOptions) -> Result<()> {
        let handle = self.current()?;
        let bytes = self.read_vault().await?;
        export_bytes(&handle, &bytes, options).await
    }

    async fn import_vault(&self, source: ImportSource) -> Result<VaultHandle> {
        let (name, bytes) = source.load().await?;
        let handle = self.open_vault(OpenOptions::create(name)).await?;
        self.write_vault(&bytes).await?;
        Ok(handle)
    }

    async fn list_recent_vaults(&self) -> Result<Vec<RecentVaultRecord>> {
        self.recents.list()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_before_open() {
        let adapter = MemoryAdapter::volatile(10);
        assert!(matches!(adapter.read_vault().await, Err(Error::NoVaultOpen)));
        assert!(matches!(
            adapter.write_vault(b"x").await,
            Err(Error::NoVaultOpen)
        ));
    }

    #[tokio::test]
    async fn test_read_unwritten_vault() {
        let adapter = MemoryAdapter::volatile(10);
        adapter.open_vault(OpenOptions::create("A")).await.unwrap();
        assert!(matches!(adapter.read_vault().await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_switching_vaults_drops_buffer() {
        let adapter = MemoryAdapter::volatile(10);
        let a = adapter.open_vault(OpenOptions::create("A")).await.unwrap();
        adapter.write_vault(b"first").await.unwrap();

        adapter.open_vault(OpenOptions::existing(a.id.clone())).await.unwrap();
        assert_eq!(adapter.read_vault().await.unwrap(), b"first");

        adapter.open_vault(OpenOptions::create("B")).await.unwrap();
        assert!(adapter.read_vault().await.is_err());
        assert!(adapter.open_vault(OpenOptions::existing(a.id)).await.is_err());
    }

    #[tokio::test]
    async fn test_recents_survive_in_kv() {
        let kv: Arc<MemoryKv> = Arc::new(MemoryKv::new());
        let first = MemoryAdapter::new(kv.clone(), 10);
        first.open_vault(OpenOptions::create("A")).await.unwrap();

        let second = MemoryAdapter::new(kv, 10);
        let recents = second.list_recent_vaults().await.unwrap();
        assert_eq!(recents.len(), 1);
        assert_eq!(recents[0].name, "A");
    }
}
