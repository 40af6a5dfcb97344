//! Error types for memvault

use std::io;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for memvault
#[derive(Error, Debug)]
pub enum Error {
    // Passphrase / crypto errors
    /// Deliberately says nothing about which part of the unlock failed.
    #[error("Invalid passphrase")]
    InvalidPassphrase,

    #[error("Corrupt container: {0}")]
    CorruptContainer(String),

    #[error("Decryption failed - data corrupted or wrong key")]
    DecryptionFailure,

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Key derivation error: {0}")]
    KeyDerivation(String),

    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("Keyring is locked")]
    Locked,

    // Integrity errors
    #[error("Integrity manifest mismatch: {0}")]
    ManifestMismatch(String),

    // Storage errors
    #[error("No storage adapter available: {0}")]
    AdapterUnavailable(String),

    #[error("Storage quota exceeded: {required} bytes required, {available} bytes available")]
    StorageQuotaExceeded { required: u64, available: u64 },

    #[error("No vault is open")]
    NoVaultOpen,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    // Worker errors
    #[error("Worker error: {0}")]
    WorkerError(String),

    // Config errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True when the failure means "this passphrase does not open this data".
    ///
    /// A wrong passphrase on a bare container surfaces as an AEAD failure,
    /// while the keyring reports it as `InvalidPassphrase`.
    pub fn is_passphrase_rejection(&self) -> bool {
        matches!(self, Error::InvalidPassphrase | Error::DecryptionFailure)
    }

    /// True for failures that must drop the session key.
    pub fn is_crypto_failure(&self) -> bool {
        matches!(
            self,
            Error::InvalidPassphrase
                | Error::DecryptionFailure
                | Error::CorruptContainer(_)
                | Error::ManifestMismatch(_)
        )
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Internal(format!("Blocking task failed: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_passphrase_message_is_opaque() {
        let msg = Error::InvalidPassphrase.to_string();
        assert_eq!(msg, "Invalid passphrase");
        assert!(!msg.contains("salt"));
        assert!(!msg.contains("iteration"));
    }

    #[test]
    fn test_classification() {
        assert!(Error::DecryptionFailure.is_passphrase_rejection());
        assert!(Error::InvalidPassphrase.is_passphrase_rejection());
        assert!(!Error::CorruptContainer("bad magic".into()).is_passphrase_rejection());

        assert!(Error::ManifestMismatch("root".into()).is_crypto_failure());
        assert!(!Error::NoVaultOpen.is_crypto_failure());
    }
}
