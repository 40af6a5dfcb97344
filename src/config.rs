//! Configuration management for memvault

use crate::crypto::{
    KdfAlgorithm, KdfParams, DEFAULT_ARGON2_MEMORY_KIB, DEFAULT_ARGON2_PARALLELISM,
};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

/// Default PBKDF2 iterations
pub const DEFAULT_ITERATIONS: u32 = 250_000;

/// Lowest PBKDF2 iteration count accepted by `validate`
pub const MIN_PBKDF2_ITERATIONS: u32 = 10_000;

/// Default storage quota: 512 MiB
pub const DEFAULT_QUOTA_BYTES: u64 = 512 * 1024 * 1024;

/// Default number of recent vaults remembered
pub const DEFAULT_RECENTS_LIMIT: usize = 10;

/// Default integrity chunk size: 64 KiB
pub const DEFAULT_INTEGRITY_CHUNK_SIZE: usize = 64 * 1024;

/// Default crypto worker thread count
pub const DEFAULT_WORKER_THREADS: usize = 2;

/// Key derivation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KdfConfig {
    /// KDF used for newly enrolled keyring settings
    pub algorithm: KdfAlgorithm,

    /// PBKDF2 iterations, or Argon2 time cost
    pub iterations: u32,

    /// Argon2 memory cost in KiB
    pub argon2_memory_kib: u32,

    /// Argon2 parallelism
    pub argon2_parallelism: u32,

    /// Target unlock latency for `tune`
    pub target_unlock_ms: u64,
}

impl Default for KdfConfig {
    fn default() -> Self {
        KdfConfig {
            algorithm: KdfAlgorithm::Pbkdf2Sha256,
            iterations: DEFAULT_ITERATIONS,
            argon2_memory_kib: DEFAULT_ARGON2_MEMORY_KIB,
            argon2_parallelism: DEFAULT_ARGON2_PARALLELISM,
            target_unlock_ms: 500,
        }
    }
}

impl KdfConfig {
    /// Derivation parameters for new settings
    pub fn params(&self) -> KdfParams {
        KdfParams {
            algorithm: self.algorithm,
            iterations: self.iterations,
            argon2_memory_kib: self.argon2_memory_kib,
            argon2_parallelism: self.argon2_parallelism,
        }
    }
}

/// Which storage backend to use
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BackendPreference {
    /// Pick the best available backend
    #[default]
    Auto,

    /// Volatile in-process storage
    Memory,

    /// Private sandboxed directory
    PrivateFs,

    /// Host-provided key-value storage
    Host,

    /// Native local store
    Native,
}

impl BackendPreference {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendPreference::Auto => "auto",
            BackendPreference::Memory => "memory",
            BackendPreference::PrivateFs => "private-fs",
            BackendPreference::Host => "host",
            BackendPreference::Native => "native",
        }
    }
}

impl FromStr for BackendPreference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(BackendPreference::Auto),
            "memory" => Ok(BackendPreference::Memory),
            "private-fs" | "private_fs" | "opfs" => Ok(BackendPreference::PrivateFs),
            "host" => Ok(BackendPreference::Host),
            "native" => Ok(BackendPreference::Native),
            other => Err(Error::InvalidConfig(format!(
                "Unknown storage backend: {}",
                other
            ))),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend preference
    pub backend: BackendPreference,

    /// Private vault directory (defaults to `<data_dir>/vaults`)
    pub private_dir: Option<PathBuf>,

    /// Native store directory (defaults to `<data_dir>/native`)
    pub native_dir: Option<PathBuf>,

    /// Maximum bytes the private directory may hold
    pub quota_bytes: u64,

    /// Maximum recent-vault records kept
    pub recents_limit: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            backend: BackendPreference::Auto,
            private_dir: None,
            native_dir: None,
            quota_bytes: DEFAULT_QUOTA_BYTES,
            recents_limit: DEFAULT_RECENTS_LIMIT,
        }
    }
}

/// Integrity journal configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrityConfig {
    /// Manifest chunk size in bytes
    pub chunk_size: usize,

    /// Record a manifest on every save
    pub manifest_on_write: bool,

    /// Verify the stored manifest on every load
    pub verify_on_read: bool,
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        IntegrityConfig {
            chunk_size: DEFAULT_INTEGRITY_CHUNK_SIZE,
            manifest_on_write: true,
            verify_on_read: true,
        }
    }
}

/// Crypto worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Run KDF and bulk crypto on the worker pool
    pub enabled: bool,

    /// Number of worker threads
    pub threads: usize,

    /// Per-request timeout; none waits indefinitely
    pub request_timeout_ms: Option<u64>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            enabled: true,
            threads: DEFAULT_WORKER_THREADS,
            request_timeout_ms: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log file path
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            file: None,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Config version
    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default)]
    pub kdf: KdfConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub integrity: IntegrityConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Path to the data directory
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_version() -> u32 {
    1
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("memvault")
}

impl Default for Config {
    fn default() -> Self {
        Config {
            version: default_version(),
            kdf: KdfConfig::default(),
            storage: StorageConfig::default(),
            integrity: IntegrityConfig::default(),
            worker: WorkerConfig::default(),
            logging: LoggingConfig::default(),
            data_dir: default_data_dir(),
        }
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|s| s.to_str()),
        Some("yaml") | Some("yml")
    )
}

impl Config {
    /// Load configuration from a file (YAML or JSON), with environment variable
    /// substitution and overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let content = std::fs::read_to_string(path_ref)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let content = Self::substitute_env_vars(&content)?;

        let mut config: Config = if is_yaml(path_ref) {
            serde_yaml::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse YAML config: {}", e)))?
        } else {
            serde_json::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse JSON config: {}", e)))?
        };

        if config.data_dir == PathBuf::new() {
            config.data_dir = default_data_dir();
        }

        config.apply_env_overrides()?;
        config.validate()?;

        debug!("Loaded config from {:?}", path_ref);
        Ok(config)
    }

    /// Defaults plus environment overrides, for running without a config file
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Substitute `${VAR_NAME}` references with environment values
    ///
    /// Unset variables are left as written.
    fn substitute_env_vars(content: &str) -> Result<String> {
        let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}")
            .map_err(|e| Error::Internal(format!("Bad substitution pattern: {}", e)))?;

        let mut result = content.to_string();
        for cap in re.captures_iter(content) {
            let full_match = &cap[0];
            let var_name = &cap[1];

            if let Ok(value) = std::env::var(var_name) {
                result = result.replace(full_match, &value);
            }
        }

        Ok(result)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(dir) = std::env::var("MEMVAULT_DATA_DIR") {
            let dir = dir.trim();
            if !dir.is_empty() {
                self.data_dir = PathBuf::from(dir);
            }
        }

        if let Ok(iterations) = std::env::var("MEMVAULT_ITERATIONS") {
            self.kdf.iterations = iterations.trim().parse().map_err(|_| {
                Error::InvalidConfig(format!("Invalid MEMVAULT_ITERATIONS: {}", iterations))
            })?;
        }

        if let Ok(backend) = std::env::var("MEMVAULT_BACKEND") {
            self.storage.backend = backend.parse()?;
        }

        if let Ok(quota) = std::env::var("MEMVAULT_QUOTA_BYTES") {
            self.storage.quota_bytes = quota.trim().parse().map_err(|_| {
                Error::InvalidConfig(format!("Invalid MEMVAULT_QUOTA_BYTES: {}", quota))
            })?;
        }

        if let Ok(level) = std::env::var("MEMVAULT_LOG") {
            let level = level.trim().to_string();
            if !level.is_empty() {
                self.logging.level = level;
            }
        }

        Ok(())
    }

    /// Save configuration to a file (format determined by extension)
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path_ref = path.as_ref();

        let content = if is_yaml(path_ref) {
            serde_yaml::to_string(self).map_err(|e| {
                Error::Config(format!("Failed to serialize config to YAML: {}", e))
            })?
        } else {
            serde_json::to_string_pretty(self).map_err(|e| {
                Error::Config(format!("Failed to serialize config to JSON: {}", e))
            })?
        };

        std::fs::write(path_ref, content)
            .map_err(|e| Error::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.kdf.iterations == 0 {
            return Err(Error::InvalidConfig(
                "KDF iterations must be greater than 0".to_string(),
            ));
        }

        if self.kdf.algorithm == KdfAlgorithm::Pbkdf2Sha256
            && self.kdf.iterations < MIN_PBKDF2_ITERATIONS
        {
            return Err(Error::InvalidConfig(format!(
                "PBKDF2 iterations must be at least {}",
                MIN_PBKDF2_ITERATIONS
            )));
        }

        if self.integrity.chunk_size == 0 {
            return Err(Error::InvalidConfig(
                "Integrity chunk size must be greater than 0".to_string(),
            ));
        }

        if self.worker.enabled && self.worker.threads == 0 {
            return Err(Error::InvalidConfig(
                "Worker threads must be greater than 0 when the worker is enabled".to_string(),
            ));
        }

        if self.storage.recents_limit == 0 {
            return Err(Error::InvalidConfig(
                "Recents limit must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Private vault directory
    pub fn private_dir(&self) -> PathBuf {
        self.storage
            .private_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("vaults"))
    }

    /// Native store directory
    pub fn native_dir(&self) -> PathBuf {
        self.storage
            .native_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("native"))
    }

    /// Keyring settings store path
    pub fn keyring_path(&self) -> PathBuf {
        self.data_dir.join("keyring.json")
    }

    /// Ensure all required directories exist
    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(self.private_dir())?;
        std::fs::create_dir_all(self.native_dir())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.kdf.iterations, 250_000);
        assert_eq!(config.kdf.algorithm, KdfAlgorithm::Pbkdf2Sha256);
        assert_eq!(config.storage.backend, BackendPreference::Auto);
        assert_eq!(config.storage.quota_bytes, 512 * 1024 * 1024);
        assert_eq!(config.integrity.chunk_size, 65_536);
        assert!(config.worker.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects() {
        let mut config = Config::default();
        config.kdf.iterations = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.kdf.iterations = 5_000;
        assert!(config.validate().is_err());

        config.kdf.algorithm = KdfAlgorithm::Argon2id;
        config.kdf.iterations = 3;
        assert!(config.validate().is_ok());

        let mut config = Config::default();
        config.integrity.chunk_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.worker.threads = 0;
        assert!(config.validate().is_err());
        config.worker.enabled = false;
        assert!(config.validate().is_ok());

        let mut config = Config::default();
        config.storage.recents_limit = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"storage": {"backend": "private-fs"}, "data_dir": "/tmp/mv"}"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.storage.backend, BackendPreference::PrivateFs);
        assert_eq!(config.storage.recents_limit, DEFAULT_RECENTS_LIMIT);
        assert_eq!(config.private_dir(), PathBuf::from("/tmp/mv/vaults"));
    }

    #[test]
    fn test_yaml_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");

        let mut config = Config::default();
        config.kdf.iterations = 300_000;
        config.data_dir = dir.path().to_path_buf();
        config.save(&path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("iterations: 300000"));

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.data_dir, dir.path());
    }

    #[test]
    fn test_substitute_env_vars() {
        std::env::set_var("MEMVAULT_TEST_SUBST_DIR", "/srv/vaults");
        let out =
            Config::substitute_env_vars("dir: ${MEMVAULT_TEST_SUBST_DIR}/x ${MEMVAULT_TEST_UNSET}")
                .unwrap();
        assert_eq!(out, "dir: /srv/vaults/x ${MEMVAULT_TEST_UNSET}");
    }

    #[test]
    fn test_backend_parse() {
        assert_eq!(
            "private-fs".parse::<BackendPreference>().unwrap(),
            BackendPreference::PrivateFs
        );
        assert_eq!(
            "NATIVE".parse::<BackendPreference>().unwrap(),
            BackendPreference::Native
        );
        assert!("cloud".parse::<BackendPreference>().is_err());
        assert_eq!(BackendPreference::Host.as_str(), "host");
    }

    #[test]
    fn test_ensure_directories() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = dir.path().join("data");
        config.ensure_directories().unwrap();

        assert!(config.private_dir().is_dir());
        assert!(config.native_dir().is_dir());
    }
}
