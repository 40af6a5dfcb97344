//! Adapter selection
//!
//! Capabilities are checked once at startup, in priority order: private
//! filesystem, host storage, native local store, then memory.

use crate::config::{BackendPreference, Config};
use crate::error::{Error, Result};
use crate::storage::{
    HostAdapter, HostStorage, MemoryAdapter, NativeAdapter, PrivateFsAdapter, StorageAdapter,
};
use crate::store::{JsonFileKv, LocalStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Storage capabilities of the running environment
#[derive(Clone, Default)]
pub struct Environment {
    /// Directory private to this application
    pub private_root: Option<PathBuf>,
    /// Embedding application's storage surface
    pub host: Option<Arc<dyn HostStorage>>,
    /// Directory for the native local store
    pub native_root: Option<PathBuf>,
    /// File keeping the memory adapter's recents across runs
    pub memory_recents: Option<PathBuf>,
}

/// Recents file for the memory adapter, relative to the data directory
pub const MEMORY_RECENTS_FILE: &str = "memory-recents.json";

impl Environment {
    /// Filesystem capabilities taken from the config directories
    pub fn from_config(config: &Config) -> Self {
        Environment {
            private_root: Some(config.private_dir()),
            host: None,
            native_root: Some(config.native_dir()),
            memory_recents: Some(config.data_dir.join(MEMORY_RECENTS_FILE)),
        }
    }

    pub fn with_host(mut self, host: Arc<dyn HostStorage>) -> Self {
        self.host = Some(host);
        self
    }
}

const PRIORITY: [BackendPreference; 3] = [
    BackendPreference::PrivateFs,
    BackendPreference::Host,
    BackendPreference::Native,
];

/// Build an adapter for `backend`; `Ok(None)` means the capability is absent
fn build(
    backend: BackendPreference,
    env: &Environment,
    config: &Config,
) -> Result<Option<Arc<dyn StorageAdapter>>> {
    let limit = config.storage.recents_limit;

    let adapter: Arc<dyn StorageAdapter> = match backend {
        BackendPreference::PrivateFs => match &env.private_root {
            Some(root) => Arc::new(PrivateFsAdapter::new(
                root,
                config.storage.quota_bytes,
                limit,
            )?),
            None => return Ok(None),
        },
        BackendPreference::Host => match &env.host {
            Some(host) => Arc::new(HostAdapter::new(host.clone(), limit)),
            None => return Ok(None),
        },
        BackendPreference::Native => match &env.native_root {
            Some(root) => {
                let store = LocalStore::open(root)?;
                Arc::new(NativeAdapter::new(Arc::new(store), limit))
            }
            None => return Ok(None),
        },
        BackendPreference::Memory | BackendPreference::Auto => {
            Arc::new(memory_adapter(env.memory_recents.as_deref(), limit))
        }
    };

    Ok(Some(adapter))
}

/// Memory adapter whose recents survive restarts when a file is available
fn memory_adapter(recents: Option<&Path>, limit: usize) -> MemoryAdapter {
    match recents.map(JsonFileKv::open) {
        Some(Ok(kv)) => MemoryAdapter::new(Arc::new(kv), limit),
        Some(Err(e)) => {
            warn!("Memory recents not persisted: {}", e);
            MemoryAdapter::volatile(limit)
        }
        None => MemoryAdapter::volatile(limit),
    }
}

/// Pick the storage adapter for this session
pub fn select_adapter(env: &Environment, config: &Config) -> Result<Arc<dyn StorageAdapter>> {
    let preference = config.storage.backend;

    if preference != BackendPreference::Auto {
        return match build(preference, env, config) {
            Ok(Some(adapter)) => {
                info!("Using {} storage (configured)", preference.as_str());
                Ok(adapter)
            }
            Ok(None) => Err(Error::AdapterUnavailable(format!(
                "{} storage is not available in this environment",
                preference.as_str()
            ))),
            Err(e) => Err(Error::AdapterUnavailable(format!(
                "{} storage failed to start: {}",
                preference.as_str(),
                e
            ))),
        };
    }

    for candidate in PRIORITY {
        match build(candidate, env, config) {
            Ok(Some(adapter)) => {
                info!("Using {} storage", candidate.as_str());
                return Ok(adapter);
            }
            Ok(None) => {}
            Err(e) => warn!("{} storage unavailable: {}", candidate.as_str(), e),
        }
    }

    warn!("No durable storage available, vaults will not persist");
    Ok(Arc::new(memory_adapter(
        env.memory_recents.as_deref(),
        config.storage.recents_limit,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{AdapterKind, OpenOptions};
    use async_trait::async_trait;

    struct NullHost;

    #[async_trait]
    impl HostStorage for NullHost {
        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
            Ok(None)
        }

        async fn set(&self, _key: &str, _value: Vec<u8>) -> Result<()> {
            Ok(())
        }
    }

    fn config() -> Config {
        Config::default()
    }

    #[test]
    fn test_priority_order() {
        let dir = tempfile::tempdir().unwrap();
        let config = config();

        let env = Environment {
            private_root: Some(dir.path().join("private")),
            host: Some(Arc::new(NullHost)),
            native_root: Some(dir.path().join("native")),
            memory_recents: None,
        };
        assert_eq!(
            select_adapter(&env, &config).unwrap().kind(),
            AdapterKind::PrivateFs
        );

        let env = Environment {
            private_root: None,
            ..env
        };
        assert_eq!(
            select_adapter(&env, &config).unwrap().kind(),
            AdapterKind::Host
        );

        let env = Environment { host: None, ..env };
        assert_eq!(
            select_adapter(&env, &config).unwrap().kind(),
            AdapterKind::Native
        );

        assert_eq!(
            select_adapter(&Environment::default(), &config)
                .unwrap()
                .kind(),
            AdapterKind::Memory
        );
    }

    #[test]
    fn test_forced_backend_missing_capability() {
        let mut config = config();
        config.storage.backend = BackendPreference::Host;

        assert!(matches!(
            select_adapter(&Environment::default(), &config),
            Err(Error::AdapterUnavailable(_))
        ));

        config.storage.backend = BackendPreference::Memory;
        assert_eq!(
            select_adapter(&Environment::default(), &config)
                .unwrap()
                .kind(),
            AdapterKind::Memory
        );
    }

    #[test]
    fn test_broken_backend_falls_through() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let env = Environment {
            private_root: Some(blocker.join("vaults")),
            host: Some(Arc::new(NullHost)),
            native_root: None,
            memory_recents: None,
        };
        assert_eq!(
            select_adapter(&env, &config()).unwrap().kind(),
            AdapterKind::Host
        );
    }

    #[tokio::test]
    async fn test_memory_recents_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let env = Environment {
            memory_recents: Some(dir.path().join(MEMORY_RECENTS_FILE)),
            ..Environment::default()
        };

        let first = select_adapter(&env, &config()).unwrap();
        assert_eq!(first.kind(), AdapterKind::Memory);
        let handle = first.open_vault(OpenOptions::create("A")).await.unwrap();
        drop(first);

        let second = select_adapter(&env, &config()).unwrap();
        let recent = second.list_recent_vaults().await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, handle.id);
        assert_eq!(recent[0].name, "A");
    }

    #[tokio::test]
    async fn test_unreadable_memory_recents_fall_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(MEMORY_RECENTS_FILE);
        std::fs::write(&path, b"not json").unwrap();

        let env = Environment {
            memory_recents: Some(path),
            ..Environment::default()
        };
        let adapter = select_adapter(&env, &config()).unwrap();
        assert_eq!(adapter.kind(), AdapterKind::Memory);
        assert!(adapter.list_recent_vaults().await.unwrap().is_empty());
    }
}
