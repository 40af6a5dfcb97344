//! Host-provided storage adapter
//!
//! Used when embedded in an application that exposes its own key-value
//! storage surface. Container bytes live under `vault:<id>` and the recents
//! list under `vault.recents`.

use crate::error::{Error, Result};
use crate::storage::recents::{touch, RECENTS_KEY};
use crate::storage::{
    check_vault_id, export_bytes, resolve_open, AdapterKind, ExportOptions, ImportSource,
    OpenOptions, RecentVaultRecord, StorageAdapter, VaultHandle,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// Storage surface supplied by the embedding application
#[async_trait]
pub trait HostStorage: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Bytes still available, if the host reports it
    async fn quota(&self) -> Result<Option<u64>> {
        Ok(None)
    }
}

pub struct HostAdapter {
    host: Arc<dyn HostStorage>,
    recents_limit: usize,
    current: Mutex<Option<VaultHandle>>,
}

fn vault_key(id: &str) -> String {
    format!("vault:{}", id)
}

impl HostAdapter {
    pub fn new(host: Arc<dyn HostStorage>, recents_limit: usize) -> Self {
        HostAdapter {
            host,
            recents_limit,
            current: Mutex::new(None),
        }
    }

    fn current(&self) -> Result<VaultHandle> {
        self.current.lock().clone().ok_or(Error::NoVaultOpen)
    }

    async fn recents(&self) -> Result<Vec<RecentVaultRecord>> {
        match self.host.get(RECENTS_KEY).await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(Vec::new()),
        }
    }

    async fn touch_recent(&self, handle: &VaultHandle) -> Result<()> {
        let mut list = self.recents().await?;
        touch(&mut list, handle, self.kind(), self.recents_limit);
        self.host.set(RECENTS_KEY, serde_json::to_vec(&list)?).await
    }
}

#[async_trait]
impl StorageAdapter for HostAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Host
    }

    fn current_vault(&self) -> Option<VaultHandle> {
        self.current.lock().clone()
    }

    async fn open_vault(&self, options: OpenOptions) -> Result<VaultHandle> {
        let (exists, remembered) = match &options.id {
            Some(id) => {
                check_vault_id(id)?;
                let exists = self.host.get(&vault_key(id)).await?.is_some();
                let remembered = self
                    .recents()
                    .await?
                    .into_iter()
                    .find(|record| record.id == *id)
                    .map(|record| record.name);
                (exists, remembered)
            }
            None => (false, None),
        };

        let handle = resolve_open(options, exists, remembered)?;
        *self.current.lock() = Some(handle.clone());
        self.touch_recent(&handle).await?;

        debug!("Opened host vault {}", handle.id);
        Ok(handle)
    }

    async fn read_vault(&self) -> Result<Vec<u8>> {
        let handle = self.current()?;
        self.host
            .get(&vault_key(&handle.id))
            .await?
            .ok_or_else(|| Error::NotFound(format!("vault {} has no data", handle.id)))
    }

    async fn write_vault(&self, bytes: &[u8]) -> Result<()> {
        let handle = self.current()?;

        if let Some(available) = self.host.quota().await? {
            if bytes.len() as u64 > available {
                return Err(Error::StorageQuotaExceeded {
                    required: bytes.len() as u64,
                    available,
                });
            }
        }

        self.host.set(&vault_key(&handle.id), bytes.to_vec()).await
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
        self.recents().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct TestHost {
        entries: Mutex<HashMap<String, Vec<u8>>>,
        quota: Option<u64>,
    }

    #[async_trait]
    impl HostStorage for TestHost {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            Ok(self.entries.lock().get(key).cloned())
        }

        async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
            self.entries.lock().insert(key.to_string(), value);
            Ok(())
        }

        async fn quota(&self) -> Result<Option<u64>> {
            Ok(self.quota)
        }
    }

    #[tokio::test]
    async fn test_bytes_stored_under_vault_key() {
        let host = Arc::new(TestHost::default());
        let adapter = HostAdapter::new(host.clone(), 10);

        let handle = adapter.open_vault(OpenOptions::create("A")).await.unwrap();
        adapter.write_vault(b"abc").await.unwrap();

        let stored = host.get(&format!("vault:{}", handle.id)).await.unwrap();
        assert_eq!(stored.unwrap(), b"abc");
        assert!(host.get(RECENTS_KEY).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_host_quota() {
        let host = Arc::new(TestHost {
            quota: Some(4),
            ..TestHost::default()
        });
        let adapter = HostAdapter::new(host, 10);
        adapter.open_vault(OpenOptions::create("A")).await.unwrap();

        adapter.write_vault(b"1234").await.unwrap();
        assert!(matches!(
            adapter.write_vault(b"12345").await,
            Err(Error::StorageQuotaExceeded { .. })
        ));
    }
}
