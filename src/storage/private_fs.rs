//! Private filesystem adapter
//!
//! One `<id>.mvlt` file per vault in a directory owned by this application.
//! Writes go through a temp file and rename so a crash never leaves a
//! half-written container behind. Total container bytes are capped by a quota.

use crate::error::{Error, Result};
use crate::storage::{
    check_vault_id, export_bytes, resolve_open, AdapterKind, ExportOptions, ImportSource,
    OpenOptions, RecentVaultRecord, RecentVaults, StorageAdapter, VaultHandle,
    CONTAINER_EXTENSION,
};
use crate::store::JsonFileKv;
use async_trait::async_trait;
use futures::future::try_join_all;
use parking_lot::Mutex;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

const RECENTS_FILE: &str = "recents.json";

pub struct PrivateFsAdapter {
    root: PathBuf,
    quota_bytes: u64,
    current: Mutex<Option<VaultHandle>>,
    recents: RecentVaults,
}

impl PrivateFsAdapter {
    /// Adapter rooted at `root`, creating it if needed
    pub fn new<P: AsRef<Path>>(root: P, quota_bytes: u64, recents_limit: usize) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;

        let kv = JsonFileKv::open(root.join(RECENTS_FILE))?;
        info!("Private vault directory at {:?}", root);

        Ok(PrivateFsAdapter {
            root,
            quota_bytes,
            current: Mutex::new(None),
            recents: RecentVaults::new(Arc::new(kv), recents_limit),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn vault_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{}.{}", id, CONTAINER_EXTENSION))
    }

    fn current(&self) -> Result<VaultHandle> {
        self.current.lock().clone().ok_or(Error::NoVaultOpen)
    }

    /// Bytes currently held by all containers in the directory
    pub async fn usage(&self) -> Result<u64> {
        let mut paths = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some(CONTAINER_EXTENSION) {
                paths.push(path);
            }
        }

        let sizes = try_join_all(paths.iter().map(tokio::fs::metadata)).await?;
        Ok(sizes.iter().map(|m| m.len()).sum())
    }

    async fn existing_size(path: &Path) -> Result<u64> {
        match tokio::fs::metadata(path).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    async fn check_quota(&self, path: &Path, incoming: u64) -> Result<()> {
        let others = self
            .usage()
            .await?
            .saturating_sub(Self::existing_size(path).await?);
        let available = self.quota_bytes.saturating_sub(others);

        if incoming > available {
            return Err(Error::StorageQuotaExceeded {
                required: incoming,
                available,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl StorageAdapter for PrivateFsAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::PrivateFs
    }

    fn current_vault(&self) -> Option<VaultHandle> {
        self.current.lock().clone()
    }

    async fn open_vault(&self, options: OpenOptions) -> Result<VaultHandle> {
        let (exists, remembered) = match &options.id {
            Some(id) => {
                check_vault_id(id)?;
                let exists = tokio::fs::try_exists(self.vault_path(id)).await?;
                (exists, self.recents.name_of(id)?)
            }
            None => (false, None),
        };

        let handle = resolve_open(options, exists, remembered)?;
        *self.current.lock() = Some(handle.clone());
        self.recents.touch(&handle, self.kind())?;

        debug!("Opened vault {} at {:?}", handle.id, self.vault_path(&handle.id));
        Ok(handle)
    }

    async fn read_vault(&self) -> Result<Vec<u8>> {
        let handle = self.current()?;
        match tokio::fs::read(self.vault_path(&handle.id)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(Error::NotFound(format!("vault {} has no data", handle.id)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write_vault(&self, bytes: &[u8]) -> Result<()> {
        let handle = self.current()?;
        let path = self.vault_path(&handle.id);

        self.check_quota(&path, bytes.len() as u64).await?;

        let tmp = path.with_extension(format!("{}.tmp", CONTAINER_EXTENSION));
        let written = match tokio::fs::write(&tmp, bytes).await {
            Ok(()) => tokio::fs::rename(&tmp, &path).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            if let Err(cleanup) = tokio::fs::remove_file(&tmp).await {
                if cleanup.kind() != ErrorKind::NotFound {
                    warn!("Failed to remove {:?}: {}", tmp, cleanup);
                }
            }
            return Err(e.into());
        }

        debug!("Wrote {} bytes to {:?}", bytes.len(), path);
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
        info!("Imported vault {} ({} bytes)", handle.id, bytes.len());
        Ok(handle)
    }

    async fn list_recent_vaults(&self) -> Result<Vec<RecentVaultRecord>> {
        self.recents.list()
    }
}
