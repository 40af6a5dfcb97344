//! Integrity journal
//!
//! A chunked tamper-evidence manifest over arbitrary byte payloads, independent
//! of any cipher. Each fixed-size chunk gets a SHA-256 digest, and the whole
//! payload gets one more digest of its own. The root hash is computed over
//! the raw payload, not over the chunk digests, so it is a second check
//! unrelated to the first.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use ring::digest::{digest, SHA256};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Current manifest format version
pub const MANIFEST_VERSION: u32 = 1;

/// Default chunk size: 64 KiB
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Digest of a single chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDigest {
    pub index: u64,
    pub size: u64,
    /// Hex SHA-256
    pub hash: String,
}

/// Tamper-evidence manifest for a payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityManifest {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub total_bytes: u64,
    pub chunk_size: u64,
    pub chunk_count: u64,
    /// Hex SHA-256 of the entire payload
    pub root_hash: String,
    pub chunks: Vec<ChunkDigest>,
}

impl IntegrityManifest {
    /// Serialize to pretty JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse from JSON
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Deserialization(e.to_string()))
    }
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(digest(&SHA256, data).as_ref())
}

/// Build a manifest with the default 64 KiB chunk size
pub fn create_manifest(data: &[u8]) -> IntegrityManifest {
    build(data, DEFAULT_CHUNK_SIZE)
}

/// Build a manifest with a caller-chosen chunk size
pub fn create_manifest_with_chunk_size(data: &[u8], chunk_size: usize) -> Result<IntegrityManifest> {
    if chunk_size == 0 {
        return Err(Error::InvalidConfig(
            "Chunk size must be greater than 0".to_string(),
        ));
    }
    Ok(build(data, chunk_size))
}

fn build(data: &[u8], chunk_size: usize) -> IntegrityManifest {
    let chunks: Vec<ChunkDigest> = data
        .chunks(chunk_size)
        .enumerate()
        .map(|(index, chunk)| ChunkDigest {
            index: index as u64,
            size: chunk.len() as u64,
            hash: sha256_hex(chunk),
        })
        .collect();

    debug!(
        "Created manifest: {} bytes in {} chunks",
        data.len(),
        chunks.len()
    );

    IntegrityManifest {
        version: MANIFEST_VERSION,
        created_at: Utc::now(),
        total_bytes: data.len() as u64,
        chunk_size: chunk_size as u64,
        chunk_count: chunks.len() as u64,
        root_hash: sha256_hex(data),
        chunks,
    }
}

/// Check `data` against `manifest`, naming the first mismatch found
pub fn check_manifest(data: &[u8], manifest: &IntegrityManifest) -> Result<()> {
    let mismatch = |reason: String| -> Result<()> { Err(Error::ManifestMismatch(reason)) };

    if manifest.version != MANIFEST_VERSION {
        return mismatch(format!("unsupported version {}", manifest.version));
    }

    if manifest.total_bytes != data.len() as u64 {
        return mismatch(format!(
            "length {} does not match recorded {}",
            data.len(),
            manifest.total_bytes
        ));
    }

    if manifest.chunk_count != manifest.chunks.len() as u64 {
        return mismatch(format!(
            "chunk count {} does not match {} recorded chunks",
            manifest.chunk_count,
            manifest.chunks.len()
        ));
    }

    let mut offset = 0u64;
    for (expected_index, chunk) in manifest.chunks.iter().enumerate() {
        if chunk.index != expected_index as u64 {
            return mismatch(format!("chunk {} out of order", chunk.index));
        }

        let end = offset
            .checked_add(chunk.size)
            .filter(|end| *end <= manifest.total_bytes);
        let end = match end {
            Some(end) => end,
            None => return mismatch(format!("chunk {} exceeds payload", chunk.index)),
        };

        let slice = &data[offset as usize..end as usize];
        if sha256_hex(slice) != chunk.hash {
            return mismatch(format!("chunk {} digest differs", chunk.index));
        }
        offset = end;
    }

    if offset != manifest.total_bytes {
        return mismatch(format!(
            "chunks cover {} of {} bytes",
            offset, manifest.total_bytes
        ));
    }

    if sha256_hex(data) != manifest.root_hash {
        return mismatch("root hash differs".to_string());
    }

    Ok(())
}

/// Verify `data` against `manifest`; any mismatch at all yields `false`
pub fn verify_manifest(data: &[u8], manifest: &IntegrityManifest) -> bool {
    match check_manifest(data, manifest) {
        Ok(()) => true,
        Err(e) => {
            warn!("Integrity check failed: {}", e);
            false
        }
    }
}
