//! Storage adapters
//!
//! One async interface over the places a vault container can live. Every
//! adapter moves opaque container bytes; none of them look inside beyond
//! the header check on import. "write then read returns the same bytes" holds
//! for all of them.

mod host;
mod memory;
mod native;
mod private_fs;
mod recents;
mod select;

pub use host::{HostAdapter, HostStorage};
pub use memory::MemoryAdapter;
pub use native::{NativeAdapter, WriteRecord, WRITE_KIND};
pub use private_fs::PrivateFsAdapter;
pub use recents::{RecentVaultRecord, RecentVaults};
pub use select::{select_adapter, Environment, MEMORY_RECENTS_FILE};

use crate::container::ContainerHeader;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// File extension for exported and private-fs containers
pub const CONTAINER_EXTENSION: &str = "mvlt";

/// Which backend an adapter writes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdapterKind {
    Memory,
    PrivateFs,
    Host,
    Native,
}

impl AdapterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdapterKind::Memory => "memory",
            AdapterKind::PrivateFs => "private-fs",
            AdapterKind::Host => "host",
            AdapterKind::Native => "native",
        }
    }
}

/// The vault an adapter currently has open
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultHandle {
    pub id: String,
    pub name: String,
}

/// Arguments to `open_vault`
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    /// Existing vault id; `None` creates a new vault
    pub id: Option<String>,
    /// Display name; empty keeps the remembered name
    pub name: String,
    /// Allow opening an id that has never been written
    pub create: bool,
}

impl OpenOptions {
    /// Open a brand-new vault
    pub fn create(name: impl Into<String>) -> Self {
        OpenOptions {
            id: None,
            name: name.into(),
            create: true,
        }
    }

    /// Open a vault that must already exist
    pub fn existing(id: impl Into<String>) -> Self {
        OpenOptions {
            id: Some(id.into()),
            name: String::new(),
            create: false,
        }
    }
}

/// Destination for exported bytes (save dialog, share sheet, directory)
#[async_trait]
pub trait ExportSink: Send + Sync {
    async fn deliver(&self, file_name: &str, bytes: &[u8]) -> Result<()>;
}

/// Writes exports into a directory
pub struct FileSink {
    dir: PathBuf,
}

impl FileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FileSink { dir: dir.into() }
    }
}

#[async_trait]
impl ExportSink for FileSink {
    async fn deliver(&self, file_name: &str, bytes: &[u8]) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(file_name);
        tokio::fs::write(&path, bytes).await?;
        debug!("Exported {} bytes to {:?}", bytes.len(), path);
        Ok(())
    }
}

/// Arguments to `export_vault`
#[derive(Clone)]
pub struct ExportOptions {
    /// Defaults to `<vault name>.mvlt`
    pub file_name: Option<String>,
    pub sink: Arc<dyn ExportSink>,
}

/// Where imported bytes come from
#[derive(Debug, Clone)]
pub enum ImportSource {
    Bytes { name: String, bytes: Vec<u8> },
    File(PathBuf),
}

impl ImportSource {
    /// Resolve to a display name and validated container bytes
    pub async fn load(self) -> Result<(String, Vec<u8>)> {
        let (name, bytes) = match self {
            ImportSource::Bytes { name, bytes } => (name, bytes),
            ImportSource::File(path) => {
                let bytes = tokio::fs::read(&path).await?;
                let name = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or("imported")
                    .to_string();
                (name, bytes)
            }
        };

        ContainerHeader::parse(&bytes)?;
        Ok((name, bytes))
    }
}

/// Capability-polymorphic vault storage
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    fn kind(&self) -> AdapterKind;

    /// The open vault, if any
    fn current_vault(&self) -> Option<VaultHandle>;

    async fn open_vault(&self, options: OpenOptions) -> Result<VaultHandle>;

    /// Bytes last written to the open vault
    async fn read_vault(&self) -> Result<Vec<u8>>;

    /// Replace the open vault's bytes
    async fn write_vault(&self, bytes: &[u8]) -> Result<()>;

    async fn export_vault(&self, options: ExportOptions) -> Result<()>;

    /// Ingest container bytes as a new vault and open it
    async fn import_vault(&self, source: ImportSource) -> Result<VaultHandle>;

    /// Most recently opened first
    async fn list_recent_vaults(&self) -> Result<Vec<RecentVaultRecord>>;
}

/// Export helper shared by adapters
pub(crate) async fn export_bytes(
    handle: &VaultHandle,
    bytes: &[u8],
    options: ExportOptions,
) -> Result<()> {
    let file_name = options
        .file_name
        .unwrap_or_else(|| format!("{}.{}", sanitize(&handle.name), CONTAINER_EXTENSION));
    options.sink.deliver(&file_name, bytes).await
}

fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if cleaned.trim().is_empty() {
        "vault".to_string()
    } else {
        cleaned
    }
}

pub(crate) fn new_vault_id() -> String {
    Uuid::new_v4().to_string()
}

/// Vault ids double as file names, so keep them to a safe alphabet
pub(crate) fn check_vault_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');

    if valid {
        Ok(())
    } else {
        Err(Error::NotFound(format!("invalid vault id {:?}", id)))
    }
}

/// Decide the handle for an open request
pub(crate) fn resolve_open(
    options: OpenOptions,
    exists: bool,
    remembered_name: Option<String>,
) -> Result<VaultHandle> {
    let id = match options.id {
        Some(id) => {
            check_vault_id(&id)?;
            if !exists && !options.create {
                return Err(Error::NotFound(format!("vault {}", id)));
            }
            id
        }
        None => new_vault_id(),
    };

    let name = if options.name.is_empty() {
        remembered_name.unwrap_or_else(|| id.clone())
    } else {
        options.name
    };

    Ok(VaultHandle { id, name })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_vault_id() {
        assert!(check_vault_id("3f2a-b_9").is_ok());
        assert!(check_vault_id("").is_err());
        assert!(check_vault_id("../etc/passwd").is_err());
        assert!(check_vault_id("a/b").is_err());
    }

    #[test]
    fn test_resolve_open() {
        let created = resolve_open(OpenOptions::create("Journal"), false, None).unwrap();
        assert_eq!(created.name, "Journal");
        assert!(check_vault_id(&created.id).is_ok());

        assert!(matches!(
            resolve_open(OpenOptions::existing("abc"), false, None),
            Err(Error::NotFound(_))
        ));

        let reopened =
            resolve_open(OpenOptions::existing("abc"), true, Some("Old".to_string())).unwrap();
        assert_eq!(reopened.name, "Old");
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("My Vault"), "My Vault");
        assert_eq!(sanitize("a/b\\c"), "a_b_c");
        assert_eq!(sanitize("  "), "vault");
    }

    #[tokio::test]
    async fn test_import_source_validates_header() {
        let err = ImportSource::Bytes {
            name: "x".to_string(),
            bytes: b"not a container".to_vec(),
        }
        .load()
        .await
        .unwrap_err();
        assert!(matches!(err, Error::CorruptContainer(_)));
    }

    #[tokio::test]
    async fn test_file_sink() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::new(dir.path().join("out"));
        sink.deliver("v.mvlt", b"bytes").await.unwrap();
        assert_eq!(
            std::fs::read(dir.path().join("out/v.mvlt")).unwrap(),
            b"bytes"
        );
    }
}
