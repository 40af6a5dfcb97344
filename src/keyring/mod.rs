//! Session keyring
//!
//! Holds the session master key derived from the user's passphrase. The key
//! never touches storage: only the KDF settings and an encrypted verifier
//! sentinel are persisted, under `vault.settings`.
//!
//! State is either locked (no key) or unlocked (key held). A wrong
//! passphrase, a failed verifier check or an explicit `lock` all leave the
//! keyring locked.

use crate::config::KdfConfig;
use crate::crypto::{
    decrypt, derive_key, encrypt, random_salt, EncryptedData, KdfAlgorithm, KdfParams, MasterKey,
    SALT_SIZE,
};
use crate::error::{Error, Result};
use crate::store::{get_json, put_json, KeyValueStore};
use crate::worker::WorkerClient;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Key under which settings are persisted
pub const SETTINGS_KEY: &str = "vault.settings";

/// Plaintext sealed into the verifier
pub const VERIFIER_SENTINEL: &[u8] = b"memvault:verifier:v1";

const VERIFIER_AAD: &[u8] = b"vault.settings.verifier";

/// Encrypted sentinel used to check a candidate key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verifier {
    pub iv: Vec<u8>,
    pub data: Vec<u8>,
}

/// Persisted KDF parameters for a vault
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultSettings {
    pub kdf: KdfAlgorithm,
    pub iterations: u32,
    #[serde(with = "base64_bytes")]
    pub salt: Vec<u8>,
    pub verifier: Option<Verifier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub argon2_memory_kib: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub argon2_parallelism: Option<u32>,
}

impl VaultSettings {
    /// Fresh settings with a new random salt
    pub fn generate(kdf: &KdfConfig) -> Self {
        let params = kdf.params();
        let argon2 = params.algorithm == KdfAlgorithm::Argon2id;
        VaultSettings {
            kdf: params.algorithm,
            iterations: params.iterations,
            salt: random_salt().to_vec(),
            verifier: None,
            argon2_memory_kib: argon2.then_some(params.argon2_memory_kib),
            argon2_parallelism: argon2.then_some(params.argon2_parallelism),
        }
    }

    /// Derivation parameters these settings describe
    pub fn kdf_params(&self) -> KdfParams {
        let defaults = KdfParams::pbkdf2(self.iterations);
        KdfParams {
            algorithm: self.kdf,
            iterations: self.iterations,
            argon2_memory_kib: self
                .argon2_memory_kib
                .unwrap_or(defaults.argon2_memory_kib),
            argon2_parallelism: self
                .argon2_parallelism
                .unwrap_or(defaults.argon2_parallelism),
        }
    }

    fn check(&self) -> Result<()> {
        if self.salt.len() != SALT_SIZE {
            return Err(Error::Deserialization(format!(
                "Stored settings salt is {} bytes, expected {}",
                self.salt.len(),
                SALT_SIZE
            )));
        }
        if self.iterations == 0 {
            return Err(Error::Deserialization(
                "Stored settings have zero iterations".to_string(),
            ));
        }
        Ok(())
    }
}

/// Passphrase-derived key holder for one session
pub struct Keyring {
    store: Arc<dyn KeyValueStore>,
    kdf: KdfConfig,
    worker: Option<WorkerClient>,
    settings: RwLock<Option<VaultSettings>>,
    key: RwLock<Option<Arc<MasterKey>>>,
}

impl Keyring {
    /// Create a locked keyring persisting settings in `store`
    pub fn new(store: Arc<dyn KeyValueStore>, kdf: KdfConfig) -> Self {
        Keyring {
            store,
            kdf,
            worker: None,
            settings: RwLock::new(None),
            key: RwLock::new(None),
        }
    }

    /// Run PBKDF2 on the crypto worker
    pub fn with_worker(mut self, worker: WorkerClient) -> Self {
        self.worker = Some(worker);
        self
    }

    /// Store holding the settings; also used for per-vault metadata
    pub fn store(&self) -> Arc<dyn KeyValueStore> {
        self.store.clone()
    }

    /// Load persisted settings, creating and persisting them on first use
    pub fn ensure_settings(&self) -> Result<VaultSettings> {
        if let Some(settings) = self.settings.read().as_ref() {
            return Ok(settings.clone());
        }

        let mut cached = self.settings.write();
        if let Some(settings) = cached.as_ref() {
            return Ok(settings.clone());
        }

        let settings = match get_json::<VaultSettings>(self.store.as_ref(), SETTINGS_KEY)? {
            Some(settings) => {
                settings.check()?;
                debug!("Loaded vault settings ({})", settings.kdf.as_str());
                settings
            }
            None => {
                let settings = VaultSettings::generate(&self.kdf);
                put_json(self.store.as_ref(), SETTINGS_KEY, &settings)?;
                info!(
                    "Created vault settings: {} with {} iterations",
                    settings.kdf.as_str(),
                    settings.iterations
                );
                settings
            }
        };

        *cached = Some(settings.clone());
        Ok(settings)
    }

    /// Cached settings, if loaded
    pub fn settings(&self) -> Option<VaultSettings> {
        self.settings.read().clone()
    }

    /// Derive a key from `passphrase` and, if it checks out, unlock
    pub async fn unlock_with_passphrase(&self, passphrase: &str) -> Result<()> {
        let settings = self.ensure_settings()?;
        let bypass = dev_bypass_requested(passphrase);

        let candidate = match self.derive(passphrase, &settings).await {
            Ok(key) => key,
            Err(e) => {
                self.lock();
                warn!("Key derivation failed: {}", e);
                return Err(e);
            }
        };

        match &settings.verifier {
            Some(_) if bypass => {
                warn!("Development bypass passphrase used; verifier not checked");
            }
            Some(verifier) => {
                if !verifier_matches(&candidate, verifier) {
                    self.lock();
                    warn!("Passphrase rejected");
                    return Err(Error::InvalidPassphrase);
                }
            }
            None if bypass => {
                warn!("Development bypass passphrase used; no verifier enrolled");
            }
            None => self.enroll(&candidate, settings.clone())?,
        }

        *self.key.write() = Some(Arc::new(candidate));
        info!("Keyring unlocked");
        Ok(())
    }

    async fn derive(&self, passphrase: &str, settings: &VaultSettings) -> Result<MasterKey> {
        let params = settings.kdf_params();

        if let Some(worker) = &self.worker {
            if params.algorithm == KdfAlgorithm::Pbkdf2Sha256 {
                return worker
                    .pbkdf2(passphrase.to_string(), settings.salt.clone(), params.iterations)
                    .await;
            }
        }

        let passphrase = Zeroizing::new(passphrase.as_bytes().to_vec());
        let salt = settings.salt.clone();
        tokio::task::spawn_blocking(move || derive_key(&passphrase, &salt, &params)).await?
    }

    fn enroll(&self, key: &MasterKey, mut settings: VaultSettings) -> Result<()> {
        let sealed = encrypt(key.key(), VERIFIER_SENTINEL, VERIFIER_AAD)?;
        settings.verifier = Some(Verifier {
            iv: sealed.nonce,
            data: sealed.ciphertext,
        });

        put_json(self.store.as_ref(), SETTINGS_KEY, &settings)?;
        *self.settings.write() = Some(settings);
        info!("Enrolled passphrase verifier");
        Ok(())
    }

    /// Drop the session key; safe in any state
    pub fn lock(&self) {
        if self.key.write().take().is_some() {
            info!("Keyring locked");
        }
    }

    pub fn is_unlocked(&self) -> bool {
        self.key.read().is_some()
    }

    /// The session key, or `Locked`
    pub fn master_key(&self) -> Result<Arc<MasterKey>> {
        self.key.read().clone().ok_or(Error::Locked)
    }
}

fn verifier_matches(candidate: &MasterKey, verifier: &Verifier) -> bool {
    let sealed = match EncryptedData::from_parts(&verifier.iv, verifier.data.clone()) {
        Ok(sealed) => sealed,
        Err(_) => return false,
    };

    match decrypt(candidate.key(), &sealed, VERIFIER_AAD) {
        Ok(plaintext) => plaintext == VERIFIER_SENTINEL,
        Err(_) => false,
    }
}

#[cfg(all(feature = "dev-bypass", debug_assertions))]
fn dev_bypass_requested(passphrase: &str) -> bool {
    const DEV_BYPASS_PASSPHRASE: &str = "memvault-dev-unlock";

    passphrase == DEV_BYPASS_PASSPHRASE
        && std::env::var("MEMVAULT_DEV_BYPASS").map_or(false, |v| v == "1")
}

#[cfg(not(all(feature = "dev-bypass", debug_assertions)))]
fn dev_bypass_requested(_passphrase: &str) -> bool {
    false
}

/// Base64 (standard alphabet) for byte fields
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKv;
    use crate::worker::CryptoWorker;

    fn test_kdf() -> KdfConfig {
        KdfConfig {
            iterations: 1_000,
            ..KdfConfig::default()
        }
    }

    fn keyring(store: &Arc<MemoryKv>) -> Keyring {
        Keyring::new(store.clone(), test_kdf())
    }

    #[test]
    fn test_ensure_settings_is_idempotent() {
        let store = Arc::new(MemoryKv::new());
        let kr = keyring(&store);

        let first = kr.ensure_settings().unwrap();
        let second = kr.ensure_settings().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.salt.len(), 32);
        assert_eq!(first.iterations, 1_000);
        assert!(first.verifier.is_none());

        // A second keyring over the same store sees the same settings
        assert_eq!(keyring(&store).ensure_settings().unwrap(), first);
    }

    #[test]
    fn test_fresh_vaults_get_fresh_salts() {
        let a = keyring(&Arc::new(MemoryKv::new())).ensure_settings().unwrap();
        let b = keyring(&Arc::new(MemoryKv::new())).ensure_settings().unwrap();
        assert_ne!(a.salt, b.salt);
    }

    #[test]
    fn test_settings_schema() {
        let store = Arc::new(MemoryKv::new());
        keyring(&store).ensure_settings().unwrap();

        let raw = store.get(SETTINGS_KEY).unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&raw).unwrap();

        assert_eq!(value["kdf"], "PBKDF2-SHA256");
        assert_eq!(value["iterations"], 1_000);
        assert!(value["salt"].is_string());
        assert!(value["verifier"].is_null());
        assert!(value.get("argon2MemoryKib").is_none());
    }

    #[tokio::test]
    async fn test_first_unlock_enrolls_verifier() {
        let store = Arc::new(MemoryKv::new());
        let kr = keyring(&store);

        kr.unlock_with_passphrase("correct horse").await.unwrap();
        assert!(kr.is_unlocked());

        let stored: VaultSettings = get_json(store.as_ref(), SETTINGS_KEY).unwrap().unwrap();
        let verifier = stored.verifier.unwrap();
        assert_eq!(verifier.iv.len(), 12);
        assert_eq!(verifier.data.len(), VERIFIER_SENTINEL.len() + 16);
    }

    #[tokio::test]
    async fn test_wrong_passphrase_stays_locked() {
        let store = Arc::new(MemoryKv::new());
        keyring(&store)
            .unlock_with_passphrase("correct horse")
            .await
            .unwrap();

        let kr = keyring(&store);
        let err = kr.unlock_with_passphrase("wrong").await.unwrap_err();
        assert!(matches!(err, Error::InvalidPassphrase));
        assert!(!kr.is_unlocked());
        assert!(matches!(kr.master_key(), Err(Error::Locked)));

        kr.unlock_with_passphrase("correct horse").await.unwrap();
        assert!(kr.is_unlocked());
    }

    #[tokio::test]
    async fn test_failed_unlock_drops_existing_key() {
        let store = Arc::new(MemoryKv::new());
        let kr = keyring(&store);
        kr.unlock_with_passphrase("pw").await.unwrap();

        assert!(kr.unlock_with_passphrase("not pw").await.is_err());
        assert!(!kr.is_unlocked());
    }

    #[tokio::test]
    async fn test_same_passphrase_same_key() {
        let store = Arc::new(MemoryKv::new());
        let a = keyring(&store);
        let b = keyring(&store);
        a.unlock_with_passphrase("pw").await.unwrap();
        b.unlock_with_passphrase("pw").await.unwrap();

        assert_eq!(a.master_key().unwrap().key(), b.master_key().unwrap().key());
    }

    #[tokio::test]
    async fn test_lock_from_any_state() {
        let kr = keyring(&Arc::new(MemoryKv::new()));
        kr.lock();
        assert!(!kr.is_unlocked());

        kr.unlock_with_passphrase("pw").await.unwrap();
        kr.lock();
        kr.lock();
        assert!(!kr.is_unlocked());
    }

    #[tokio::test]
    async fn test_unlock_via_worker_matches_inline() {
        let (worker, client) = CryptoWorker::spawn(1).unwrap();
        let store = Arc::new(MemoryKv::new());

        let inline = keyring(&store);
        inline.unlock_with_passphrase("pw").await.unwrap();

        let offloaded = keyring(&store).with_worker(client);
        offloaded.unlock_with_passphrase("pw").await.unwrap();
        assert_eq!(
            inline.master_key().unwrap().key(),
            offloaded.master_key().unwrap().key()
        );
        assert!(offloaded.unlock_with_passphrase("nope").await.is_err());

        worker.shutdown();
    }

    #[tokio::test]
    async fn test_derivation_failure_locks() {
        let (worker, client) = CryptoWorker::spawn(1).unwrap();
        let store = Arc::new(MemoryKv::new());

        let kr = keyring(&store).with_worker(client);
        kr.unlock_with_passphrase("pw").await.unwrap();
        assert!(kr.is_unlocked());

        worker.shutdown();
        let err = kr.unlock_with_passphrase("other").await.unwrap_err();
        assert!(matches!(err, Error::WorkerError(_)));
        assert!(!kr.is_unlocked());
        assert!(kr.master_key().is_err());
    }

    #[tokio::test]
    async fn test_argon2id_settings() {
        let store = Arc::new(MemoryKv::new());
        let kdf = KdfConfig {
            algorithm: KdfAlgorithm::Argon2id,
            iterations: 1,
            argon2_memory_kib: 1024,
            argon2_parallelism: 1,
            ..KdfConfig::default()
        };

        let kr = Keyring::new(store.clone(), kdf.clone());
        kr.unlock_with_passphrase("pw").await.unwrap();

        let raw = store.get(SETTINGS_KEY).unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(value["kdf"], "ARGON2ID");
        assert_eq!(value["argon2MemoryKib"], 1024);

        assert_eq!(kr.settings().unwrap().kdf_params(), kdf.params());

        let again = Keyring::new(store, kdf);
        assert!(matches!(
            again.unlock_with_passphrase("wrong").await,
            Err(Error::InvalidPassphrase)
        ));
    }

    #[tokio::test]
    async fn test_corrupt_stored_settings_rejected() {
        let store = Arc::new(MemoryKv::new());
        store
            .put(
                SETTINGS_KEY,
                br#"{"kdf":"PBKDF2-SHA256","iterations":1000,"salt":"AAEC","verifier":null}"#,
            )
            .unwrap();

        assert!(keyring(&store).ensure_settings().is_err());
    }

    #[cfg(not(feature = "dev-bypass"))]
    #[tokio::test]
    async fn test_dev_bypass_is_inert() {
        std::env::set_var("MEMVAULT_DEV_BYPASS", "1");

        let store = Arc::new(MemoryKv::new());
        keyring(&store).unlock_with_passphrase("real").await.unwrap();

        let kr = keyring(&store);
        let err = kr
            .unlock_with_passphrase("memvault-dev-unlock")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidPassphrase));
        assert!(!kr.is_unlocked());
    }
}
