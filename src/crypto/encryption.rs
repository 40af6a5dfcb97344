//! AES-256-GCM Encryption Implementation
//!
//! Every payload (vault containers, the passphrase verifier, worker requests)
//! goes through these two functions.

use crate::crypto::{KEY_SIZE, NONCE_SIZE, TAG_SIZE};
use crate::error::{Error, Result};
use rand::RngCore;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use serde::{Deserialize, Serialize};

/// Encrypted data with the nonce it was sealed under
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedData {
    /// Nonce used for encryption (unique per encryption)
    pub nonce: Vec<u8>,
    /// Ciphertext with appended authentication tag
    pub ciphertext: Vec<u8>,
}

impl EncryptedData {
    /// Build from parts, checking the nonce length
    pub fn from_parts(nonce: &[u8], ciphertext: Vec<u8>) -> Result<Self> {
        if nonce.len() != NONCE_SIZE {
            return Err(Error::InvalidKeyLength {
                expected: NONCE_SIZE,
                got: nonce.len(),
            });
        }

        Ok(EncryptedData {
            nonce: nonce.to_vec(),
            ciphertext,
        })
    }
}

fn aead_key(key: &[u8]) -> Result<LessSafeKey> {
    if key.len() != KEY_SIZE {
        return Err(Error::InvalidKeyLength {
            expected: KEY_SIZE,
            got: key.len(),
        });
    }

    let unbound_key = UnboundKey::new(&AES_256_GCM, key)
        .map_err(|_| Error::Encryption("Failed to create AEAD key".to_string()))?;
    Ok(LessSafeKey::new(unbound_key))
}

/// Encrypt data using AES-256-GCM under a fresh random nonce
///
/// # Arguments
/// * `key` - 256-bit encryption key
/// * `plaintext` - Data to encrypt
/// * `aad` - Additional authenticated data (authenticated but not encrypted)
pub fn encrypt(key: &[u8], plaintext: &[u8], aad: &[u8]) -> Result<EncryptedData> {
    let sealing_key = aead_key(key)?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::assume_unique_for_key(nonce_bytes);

    let mut in_out = Vec::with_capacity(plaintext.len() + TAG_SIZE);
    in_out.extend_from_slice(plaintext);

    sealing_key
        .seal_in_place_append_tag(nonce, Aad::from(aad), &mut in_out)
        .map_err(|_| Error::Encryption("Encryption failed".to_string()))?;

    Ok(EncryptedData {
        nonce: nonce_bytes.to_vec(),
        ciphertext: in_out,
    })
}

/// Decrypt data using AES-256-GCM
///
/// Authentication failure of any kind is reported as `DecryptionFailure`;
/// no partial plaintext is ever returned.
pub fn decrypt(key: &[u8], encrypted: &EncryptedData, aad: &[u8]) -> Result<Vec<u8>> {
    if encrypted.nonce.len() != NONCE_SIZE {
        return Err(Error::CorruptContainer(format!(
            "Invalid nonce length: {}",
            encrypted.nonce.len()
        )));
    }

    if encrypted.ciphertext.len() < TAG_SIZE {
        return Err(Error::CorruptContainer("Ciphertext too short".to_string()));
    }

    let opening_key = aead_key(key)?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    nonce_bytes.copy_from_slice(&encrypted.nonce);
    let nonce = Nonce::assume_unique_for_key(nonce_bytes);

    let mut in_out = encrypted.ciphertext.clone();
    let plaintext = opening_key
        .open_in_place(nonce, Aad::from(aad), &mut in_out)
        .map_err(|_| Error::DecryptionFailure)?;

    Ok(plaintext.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> [u8; KEY_SIZE] {
        let mut key = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut key);
        key
    }

    #[test]
    fn test_encrypt_decrypt() {
        let key = test_key();
        let plaintext = b"Hello, memvault!";

        let encrypted = encrypt(&key, plaintext, &[]).unwrap();
        let decrypted = decrypt(&key, &encrypted, &[]).unwrap();

        assert_eq!(decrypted, plaintext);
        assert_eq!(encrypted.ciphertext.len(), plaintext.len() + TAG_SIZE);
    }

    #[test]
    fn test_wrong_aad_fails() {
        let key = test_key();
        let encrypted = encrypt(&key, b"Secret data", b"vault:1").unwrap();
        let result = decrypt(&key, &encrypted, b"vault:2");

        assert!(matches!(result, Err(Error::DecryptionFailure)));
    }

    #[test]
    fn test_wrong_key_fails() {
        let encrypted = encrypt(&test_key(), b"Secret data", &[]).unwrap();
        let result = decrypt(&test_key(), &encrypted, &[]);

        assert!(matches!(result, Err(Error::DecryptionFailure)));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = test_key();
        let mut encrypted = encrypt(&key, b"Secret data", &[]).unwrap();
        encrypted.ciphertext[0] ^= 0x01;

        assert!(matches!(
            decrypt(&key, &encrypted, &[]),
            Err(Error::DecryptionFailure)
        ));
    }

    #[test]
    fn test_short_key_rejected() {
        let result = encrypt(&[0u8; 16], b"data", &[]);
        assert!(matches!(
            result,
            Err(Error::InvalidKeyLength { expected: 32, got: 16 })
        ));
    }

    #[test]
    fn test_nonces_are_fresh() {
        let key = test_key();
        let a = encrypt(&key, b"same", &[]).unwrap();
        let b = encrypt(&key, b"same", &[]).unwrap();

        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_empty_plaintext() {
        let key = test_key();
        let encrypted = encrypt(&key, b"", &[]).unwrap();
        assert!(decrypt(&key, &encrypted, &[]).unwrap().is_empty());
    }
}
