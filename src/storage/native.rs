//! Native local-store adapter
//!
//! Container bytes go into the local store's blob table under their content
//! id, and every write appends a `vault.write` log entry pointing at the
//! blob. A per-vault head pointer in the store's key-value tree names the
//! latest write, so reads never scan the log; earlier versions stay
//! reachable through it.

use crate::error::{Error, Result};
use crate::storage::{
    export_bytes, resolve_open, AdapterKind, ExportOptions, ImportSource, OpenOptions,
    RecentVaultRecord, RecentVaults, StorageAdapter, VaultHandle,
};
use crate::store::{content_id, get_json, put_json, LocalStore, LogEntry};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Log entry kind for container writes
pub const WRITE_KIND: &str = "vault.write";

/// Key of the head pointer for `vault_id`
fn head_key(vault_id: &str) -> String {
    format!("vault.head:{}", vault_id)
}

/// Payload of a `vault.write` log entry, also stored as the vault's head
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteRecord {
    pub vault_id: String,
    pub blob_id: String,
    pub size: u64,
}

impl WriteRecord {
    /// Read a record back from its log entry
    pub fn decode(entry: &LogEntry) -> Option<Self> {
        serde_json::from_slice(&entry.payload).ok()
    }
}

pub struct NativeAdapter {
    store: Arc<LocalStore>,
    current: Mutex<Option<VaultHandle>>,
    recents: RecentVaults,
}

impl NativeAdapter {
    pub fn new(store: Arc<LocalStore>, recents_limit: usize) -> Self {
        let recents = RecentVaults::new(store.clone(), recents_limit);
        NativeAdapter {
            store,
            current: Mutex::new(None),
            recents,
        }
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    fn current(&self) -> Result<VaultHandle> {
        self.current.lock().clone().ok_or(Error::NoVaultOpen)
    }

    fn latest_write(&self, vault_id: &str) -> Result<Option<WriteRecord>> {
        get_json(self.store.as_ref(), &head_key(vault_id))
    }

    /// Log the write and move the vault's head to it
    fn record_write(&self, record: &WriteRecord) -> Result<u64> {
        let entry = self
            .store
            .append_now(WRITE_KIND, serde_json::to_vec(record)?)?;
        put_json(self.store.as_ref(), &head_key(&record.vault_id), record)?;
        self.store.flush()?;
        Ok(entry.timestamp_ms)
    }
}

#[async_trait]
impl StorageAdapter for NativeAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Native
    }

    fn current_vault(&self) -> Option<VaultHandle> {
        self.current.lock().clone()
    }

    async fn open_vault(&self, options: OpenOptions) -> Result<VaultHandle> {
        let (exists, remembered) = match &options.id {
            Some(id) => (
                self.latest_write(id)?.is_some(),
                self.recents.name_of(id)?,
            ),
            None => (false, None),
        };

        let handle = resolve_open(options, exists, remembered)?;
        *self.current.lock() = Some(handle.clone());
        self.recents.touch(&handle, self.kind())?;
        Ok(handle)
    }

    async fn read_vault(&self) -> Result<Vec<u8>> {
        let handle = self.current()?;
        let record = self
            .latest_write(&handle.id)?
            .ok_or_else(|| Error::NotFound(format!("vault {} has no data", handle.id)))?;

        self.store
            .get_blob(&record.blob_id)?
            .ok_or_else(|| Error::NotFound(format!("blob {}", record.blob_id)))
    }

    async fn write_vault(&self, bytes: &[u8]) -> Result<()> {
        let handle = self.current()?;
        let blob_id = content_id(bytes);
        let fresh = !self.store.has_blob(&blob_id)?;
        self.store.put_blob(&blob_id, bytes)?;

        let record = WriteRecord {
            vault_id: handle.id.clone(),
            blob_id,
            size: bytes.len() as u64,
        };
        match self.record_write(&record) {
            Ok(timestamp_ms) => {
                debug!(
                    "Recorded write of vault {} as blob {} at {}",
                    handle.id, record.blob_id, timestamp_ms
                );
                Ok(())
            }
            Err(e) => {
                // Nothing points at a blob this write introduced
                if fresh {
                    if let Err(cleanup) = self.store.delete_blob(&record.blob_id) {
                        warn!("Failed to drop blob {}: {}", record.blob_id, cleanup);
                    }
                }
                Err(e)
            }
        }
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
