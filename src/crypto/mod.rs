//! Cryptography module for memvault
//!
//! Provides AES-256-GCM encryption with PBKDF2-HMAC-SHA256 (or Argon2id)
//! key derivation. Raw key material never leaves process memory.

mod encryption;
mod kdf;
mod keys;

pub use encryption::{decrypt, encrypt, EncryptedData};
pub use kdf::{
    derive_key, pbkdf2_sha256, profile_pbkdf2, tune_iterations, KdfAlgorithm, KdfParams,
    DEFAULT_ARGON2_MEMORY_KIB, DEFAULT_ARGON2_PARALLELISM,
};
pub use keys::MasterKey;

/// Size of AES-256 key in bytes
pub const KEY_SIZE: usize = 32;

/// Size of GCM nonce in bytes
pub const NONCE_SIZE: usize = 12;

/// Size of GCM authentication tag in bytes
pub const TAG_SIZE: usize = 16;

/// Size of salt for key derivation
pub const SALT_SIZE: usize = 32;

/// Fill a fresh random salt
pub fn random_salt() -> [u8; SALT_SIZE] {
    use rand::RngCore;

    let mut salt = [0u8; SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}
