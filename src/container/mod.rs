//! Vault container codec
//!
//! Binary layout of a container:
//!
//! ```text
//! [0..4)    magic "MVLT"
//! [4..36)   PBKDF2 salt (32 bytes)
//! [36..48)  AES-GCM IV (12 bytes)
//! [48..)    ciphertext with 16-byte authentication tag
//! ```
//!
//! The plaintext is the document's canonical JSON encoding. The key is
//! PBKDF2-HMAC-SHA256 over the passphrase and the embedded salt.

mod document;

pub use document::{VaultContent, VaultDocument};

use crate::crypto::{
    decrypt, encrypt, pbkdf2_sha256, random_salt, EncryptedData, MasterKey, NONCE_SIZE, SALT_SIZE,
    TAG_SIZE,
};
use crate::error::{Error, Result};
use crate::worker::WorkerClient;
use tracing::debug;

/// Container magic marker
pub const MAGIC: &[u8; 4] = b"MVLT";

/// Bytes before the ciphertext
pub const HEADER_SIZE: usize = MAGIC.len() + SALT_SIZE + NONCE_SIZE;

/// Smallest well-formed container (empty plaintext)
pub const MIN_CONTAINER_SIZE: usize = HEADER_SIZE + TAG_SIZE;

/// Default PBKDF2 work factor for containers
pub const DEFAULT_CONTAINER_ITERATIONS: u32 = 250_000;

/// Borrowed view of a container's regions
#[derive(Debug, Clone, Copy)]
pub struct ContainerHeader<'a> {
    pub salt: &'a [u8],
    pub iv: &'a [u8],
    pub ciphertext: &'a [u8],
}

impl<'a> ContainerHeader<'a> {
    /// Validate the magic and length, then slice the regions
    pub fn parse(bytes: &'a [u8]) -> Result<Self> {
        if bytes.len() < MAGIC.len() || &bytes[..MAGIC.len()] != MAGIC {
            return Err(Error::CorruptContainer("Bad magic".to_string()));
        }

        if bytes.len() < MIN_CONTAINER_SIZE {
            return Err(Error::CorruptContainer(format!(
                "Truncated container: {} bytes",
                bytes.len()
            )));
        }

        let salt_end = MAGIC.len() + SALT_SIZE;
        Ok(ContainerHeader {
            salt: &bytes[MAGIC.len()..salt_end],
            iv: &bytes[salt_end..HEADER_SIZE],
            ciphertext: &bytes[HEADER_SIZE..],
        })
    }

    fn encrypted(&self) -> Result<EncryptedData> {
        EncryptedData::from_parts(self.iv, self.ciphertext.to_vec())
    }
}

fn frame(salt: &[u8], encrypted: &EncryptedData) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_SIZE + encrypted.ciphertext.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(salt);
    out.extend_from_slice(&encrypted.nonce);
    out.extend_from_slice(&encrypted.ciphertext);
    out
}

/// Encrypts documents into containers and back
#[derive(Debug, Clone, Copy)]
pub struct ContainerCodec {
    iterations: u32,
}

impl Default for ContainerCodec {
    fn default() -> Self {
        ContainerCodec {
            iterations: DEFAULT_CONTAINER_ITERATIONS,
        }
    }
}

impl ContainerCodec {
    /// Codec with a non-default PBKDF2 work factor
    pub fn new(iterations: u32) -> Self {
        ContainerCodec { iterations }
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    /// Serialize, encrypt under a fresh salt and IV, and frame
    pub fn encrypt_container(&self, doc: &VaultDocument, passphrase: &str) -> Result<Vec<u8>> {
        let salt = random_salt();
        let key = pbkdf2_sha256(passphrase.as_bytes(), &salt, self.iterations)?;
        let plaintext = doc.to_bytes()?;

        let encrypted = encrypt(&key[..], &plaintext, &[])?;
        let container = frame(&salt, &encrypted);

        debug!("Encrypted container: {} bytes", container.len());
        Ok(container)
    }

    /// Validate, derive, authenticate-decrypt and parse
    pub fn decrypt_container(&self, bytes: &[u8], passphrase: &str) -> Result<VaultDocument> {
        let header = ContainerHeader::parse(bytes)?;
        let key = pbkdf2_sha256(passphrase.as_bytes(), header.salt, self.iterations)?;

        let plaintext = decrypt(&key[..], &header.encrypted()?, &[])?;
        VaultDocument::from_bytes(&plaintext)
    }

    /// Seal with an already-derived key; `salt` must be the salt it came from
    pub fn seal_with_key(doc: &VaultDocument, key: &MasterKey, salt: &[u8]) -> Result<Vec<u8>> {
        if salt.len() != SALT_SIZE {
            return Err(Error::InvalidKeyLength {
                expected: SALT_SIZE,
                got: salt.len(),
            });
        }

        let plaintext = doc.to_bytes()?;
        let encrypted = encrypt(key.key(), &plaintext, &[])?;
        Ok(frame(salt, &encrypted))
    }

    /// Open with an already-derived key, ignoring the embedded salt
    pub fn open_with_key(bytes: &[u8], key: &MasterKey) -> Result<VaultDocument> {
        let header = ContainerHeader::parse(bytes)?;
        let plaintext = decrypt(key.key(), &header.encrypted()?, &[])?;
        VaultDocument::from_bytes(&plaintext)
    }

    /// `encrypt_container` with the KDF and AEAD running on the crypto worker
    pub async fn encrypt_container_offloaded(
        &self,
        client: &WorkerClient,
        doc: &VaultDocument,
        passphrase: &str,
    ) -> Result<Vec<u8>> {
        let salt = random_salt();
        let key = client
            .pbkdf2(passphrase.to_string(), salt.to_vec(), self.iterations)
            .await?;

        let encrypted = client.encrypt(&key, doc.to_bytes()?).await?;
        Ok(frame(&salt, &encrypted))
    }

    /// `decrypt_container` with the KDF and AEAD running on the crypto worker
    pub async fn decrypt_container_offloaded(
        &self,
        client: &WorkerClient,
        bytes: &[u8],
        passphrase: &str,
    ) -> Result<VaultDocument> {
        let header = ContainerHeader::parse(bytes)?;
        let key = client
            .pbkdf2(passphrase.to_string(), header.salt.to_vec(), self.iterations)
            .await?;

        let plaintext = client
            .decrypt(&key, header.iv.to_vec(), header.ciphertext.to_vec())
            .await?;
        VaultDocument::from_bytes(&plaintext)
    }

    /// `seal_with_key` with the AEAD running on the crypto worker
    pub async fn seal_with_key_offloaded(
        client: &WorkerClient,
        doc: &VaultDocument,
        key: &MasterKey,
        salt: &[u8],
    ) -> Result<Vec<u8>> {
        if salt.len() != SALT_SIZE {
            return Err(Error::InvalidKeyLength {
                expected: SALT_SIZE,
                got: salt.len(),
            });
        }

        let encrypted = client.encrypt(key, doc.to_bytes()?).await?;
        Ok(frame(salt, &encrypted))
    }

    /// `open_with_key` with the AEAD running on the crypto worker
    pub async fn open_with_key_offloaded(
        client: &WorkerClient,
        bytes: &[u8],
        key: &MasterKey,
    ) -> Result<VaultDocument> {
        let header = ContainerHeader::parse(bytes)?;
        let plaintext = client
            .decrypt(key, header.iv.to_vec(), header.ciphertext.to_vec())
            .await?;
        VaultDocument::from_bytes(&plaintext)
    }
}

/// Encrypt with the default codec
pub fn encrypt_container(doc: &VaultDocument, passphrase: &str) -> Result<Vec<u8>> {
    ContainerCodec::default().encrypt_container(doc, passphrase)
}

/// Decrypt with the default codec
pub fn decrypt_container(bytes: &[u8], passphrase: &str) -> Result<VaultDocument> {
    ContainerCodec::default().decrypt_container(bytes, passphrase)
}
