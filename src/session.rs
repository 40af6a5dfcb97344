//! Vault session
//!
//! Ties one keyring to one storage adapter. Saving seals the document under
//! the session key and records an integrity manifest; loading checks the
//! manifest and opens the container. Any cryptographic failure on load
//! locks the keyring.

use crate::config::{Config, IntegrityConfig};
use crate::container::{ContainerCodec, VaultDocument};
use crate::crypto::MasterKey;
use crate::error::{Error, Result};
use crate::integrity::{check_manifest, create_manifest_with_chunk_size, IntegrityManifest};
use crate::keyring::Keyring;
use crate::storage::{
    ExportOptions, ImportSource, OpenOptions, RecentVaultRecord, StorageAdapter, VaultHandle,
};
use crate::store::{get_json, put_json, KeyValueStore};
use crate::worker::WorkerClient;
use std::sync::Arc;
use tracing::{debug, info, warn};

fn manifest_key(vault_id: &str) -> String {
    format!("manifest:{}", vault_id)
}

pub struct VaultSession {
    keyring: Arc<Keyring>,
    adapter: Arc<dyn StorageAdapter>,
    metadata: Arc<dyn KeyValueStore>,
    integrity: IntegrityConfig,
    worker: Option<WorkerClient>,
}

impl VaultSession {
    pub fn new(keyring: Arc<Keyring>, adapter: Arc<dyn StorageAdapter>, config: &Config) -> Self {
        let metadata = keyring.store();
        VaultSession {
            keyring,
            adapter,
            metadata,
            integrity: config.integrity.clone(),
            worker: None,
        }
    }

    /// Run container AEAD on the crypto worker
    pub fn with_worker(mut self, worker: WorkerClient) -> Self {
        self.worker = Some(worker);
        self
    }

    pub fn keyring(&self) -> &Arc<Keyring> {
        &self.keyring
    }

    pub fn adapter(&self) -> &Arc<dyn StorageAdapter> {
        &self.adapter
    }

    pub async fn unlock(&self, passphrase: &str) -> Result<()> {
        self.keyring.unlock_with_passphrase(passphrase).await
    }

    pub fn lock(&self) {
        self.keyring.lock();
    }

    pub fn is_unlocked(&self) -> bool {
        self.keyring.is_unlocked()
    }

    pub async fn open(&self, options: OpenOptions) -> Result<VaultHandle> {
        self.adapter.open_vault(options).await
    }

    fn current(&self) -> Result<VaultHandle> {
        self.adapter.current_vault().ok_or(Error::NoVaultOpen)
    }

    /// Seal `doc` under the session key and write it to the open vault
    pub async fn save(&self, doc: &VaultDocument) -> Result<()> {
        let key = self.keyring.master_key()?;
        let handle = self.current()?;
        let salt = self.keyring.settings().ok_or(Error::Locked)?.salt;

        let bytes = match &self.worker {
            Some(worker) => ContainerCodec::seal_with_key_offloaded(worker, doc, &key, &salt).await?,
            None => {
                let doc = doc.clone();
                tokio::task::spawn_blocking(move || {
                    ContainerCodec::seal_with_key(&doc, &key, &salt)
                })
                .await??
            }
        };

        // A manifest left over from the previous write would fail the next load
        self.metadata.remove(&manifest_key(&handle.id))?;
        self.adapter.write_vault(&bytes).await?;
        if self.integrity.manifest_on_write {
            self.record_manifest(&handle, &bytes)?;
        }

        info!("Saved vault {} ({} bytes)", handle.id, bytes.len());
        Ok(())
    }

    fn record_manifest(&self, handle: &VaultHandle, bytes: &[u8]) -> Result<()> {
        let manifest = create_manifest_with_chunk_size(bytes, self.integrity.chunk_size)?;
        put_json(self.metadata.as_ref(), &manifest_key(&handle.id), &manifest)?;
        debug!(
            "Recorded manifest for vault {}: {} chunks",
            handle.id, manifest.chunk_count
        );
        Ok(())
    }

    /// Stored manifest for the open vault
    pub fn manifest(&self) -> Result<Option<IntegrityManifest>> {
        let handle = self.current()?;
        get_json(self.metadata.as_ref(), &manifest_key(&handle.id))
    }

    /// Read, verify and decrypt the open vault
    pub async fn load(&self) -> Result<VaultDocument> {
        let key = self.keyring.master_key()?;
        let handle = self.current()?;
        let bytes = self.adapter.read_vault().await?;

        let result = self.verify_and_open(&handle, &bytes, key).await;
        if let Err(e) = &result {
            if e.is_crypto_failure() {
                warn!("Loading vault {} failed, locking: {}", handle.id, e);
                self.keyring.lock();
            }
        }
        result
    }

    async fn verify_and_open(
        &self,
        handle: &VaultHandle,
        bytes: &[u8],
        key: Arc<MasterKey>,
    ) -> Result<VaultDocument> {
        if self.integrity.verify_on_read {
            let stored: Option<IntegrityManifest> =
                get_json(self.metadata.as_ref(), &manifest_key(&handle.id))?;
            match stored {
                Some(manifest) => check_manifest(bytes, &manifest)?,
                None => debug!("No manifest recorded for vault {}", handle.id),
            }
        }

        match &self.worker {
            Some(worker) => ContainerCodec::open_with_key_offloaded(worker, bytes, &key).await,
            None => {
                let bytes = bytes.to_vec();
                tokio::task::spawn_blocking(move || ContainerCodec::open_with_key(&bytes, &key))
                    .await?
            }
        }
    }

    pub async fn export(&self, options: ExportOptions) -> Result<()> {
        self.adapter.export_vault(options).await
    }

    /// Import container bytes as a new vault and make it the open one
    pub async fn import(&self, source: ImportSource) -> Result<VaultHandle> {
        let handle = self.adapter.import_vault(source).await?;
        if self.integrity.manifest_on_write {
            let bytes = self.adapter.read_vault().await?;
            self.record_manifest(&handle, &bytes)?;
        }
        Ok(handle)
    }

    pub async fn recent(&self) -> Result<Vec<RecentVaultRecord>> {
        self.adapter.list_recent_vaults().await
    }
}
