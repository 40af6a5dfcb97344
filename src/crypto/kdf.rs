//! Passphrase key derivation
//!
//! PBKDF2-HMAC-SHA256 is the container format's KDF. Argon2id is accepted as
//! an alternative algorithm for keyring settings.

use crate::crypto::{random_salt, MasterKey, KEY_SIZE};
use crate::error::{Error, Result};
use argon2::{Algorithm, Argon2, Params, Version};
use ring::pbkdf2;
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::time::{Duration, Instant};
use tracing::debug;
use zeroize::Zeroizing;

/// Iterations timed by `tune_iterations` before scaling
const SAMPLE_ITERATIONS: u32 = 20_000;

/// Lower bound returned by `tune_iterations`
const MIN_TUNED_ITERATIONS: u32 = 100_000;

/// Default Argon2 memory cost (64 MiB)
pub const DEFAULT_ARGON2_MEMORY_KIB: u32 = 65536;

/// Default Argon2 lanes
pub const DEFAULT_ARGON2_PARALLELISM: u32 = 1;

/// KDF algorithm identifier as persisted in vault settings
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum KdfAlgorithm {
    #[serde(rename = "PBKDF2-SHA256", alias = "pbkdf2-sha256")]
    Pbkdf2Sha256,
    #[serde(rename = "ARGON2ID", alias = "argon2id")]
    Argon2id,
}

impl KdfAlgorithm {
    /// Identifier string written into settings
    pub fn as_str(&self) -> &'static str {
        match self {
            KdfAlgorithm::Pbkdf2Sha256 => "PBKDF2-SHA256",
            KdfAlgorithm::Argon2id => "ARGON2ID",
        }
    }
}

impl std::str::FromStr for KdfAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PBKDF2-SHA256" | "PBKDF2" => Ok(KdfAlgorithm::Pbkdf2Sha256),
            "ARGON2ID" => Ok(KdfAlgorithm::Argon2id),
            other => Err(Error::InvalidConfig(format!("Unknown KDF algorithm: {}", other))),
        }
    }
}

/// Full parameter set for one derivation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KdfParams {
    pub algorithm: KdfAlgorithm,
    /// PBKDF2 iteration count, or Argon2 time cost
    pub iterations: u32,
    pub argon2_memory_kib: u32,
    pub argon2_parallelism: u32,
}

impl KdfParams {
    /// PBKDF2-HMAC-SHA256 with the given iteration count
    pub fn pbkdf2(iterations: u32) -> Self {
        KdfParams {
            algorithm: KdfAlgorithm::Pbkdf2Sha256,
            iterations,
            argon2_memory_kib: DEFAULT_ARGON2_MEMORY_KIB,
            argon2_parallelism: DEFAULT_ARGON2_PARALLELISM,
        }
    }
}

/// Raw PBKDF2-HMAC-SHA256 into a 32-byte buffer
pub fn pbkdf2_sha256(
    passphrase: &[u8],
    salt: &[u8],
    iterations: u32,
) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
    let iterations = NonZeroU32::new(iterations)
        .ok_or_else(|| Error::KeyDerivation("Iteration count must be non-zero".to_string()))?;

    let mut out = Zeroizing::new([0u8; KEY_SIZE]);
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        salt,
        passphrase,
        out.as_mut(),
    );
    Ok(out)
}

fn argon2id(passphrase: &[u8], salt: &[u8], params: &KdfParams) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
    let argon_params = Params::new(
        params.argon2_memory_kib,
        params.iterations,
        params.argon2_parallelism,
        Some(KEY_SIZE),
    )
    .map_err(|e| Error::KeyDerivation(format!("Invalid Argon2 params: {}", e)))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);

    let mut out = Zeroizing::new([0u8; KEY_SIZE]);
    argon2
        .hash_password_into(passphrase, salt, out.as_mut())
        .map_err(|e| Error::KeyDerivation(format!("Argon2 derivation failed: {}", e)))?;
    Ok(out)
}

/// Derive a master key from a passphrase and salt
pub fn derive_key(passphrase: &[u8], salt: &[u8], params: &KdfParams) -> Result<MasterKey> {
    let key = match params.algorithm {
        KdfAlgorithm::Pbkdf2Sha256 => pbkdf2_sha256(passphrase, salt, params.iterations)?,
        KdfAlgorithm::Argon2id => argon2id(passphrase, salt, params)?,
    };

    MasterKey::from_bytes(&key[..])
}

/// PBKDF2 plus the wall-clock time it took
pub fn profile_pbkdf2(
    passphrase: &[u8],
    salt: &[u8],
    iterations: u32,
) -> Result<(MasterKey, Duration)> {
    let started = Instant::now();
    let key = pbkdf2_sha256(passphrase, salt, iterations)?;
    let elapsed = started.elapsed();

    debug!("PBKDF2 with {} iterations took {:?}", iterations, elapsed);
    Ok((MasterKey::from_bytes(&key[..])?, elapsed))
}

/// Pick a PBKDF2 iteration count that takes roughly `target` on this machine
pub fn tune_iterations(target: Duration) -> Result<u32> {
    let salt = random_salt();
    let (_, elapsed) = profile_pbkdf2(b"memvault-calibration", &salt, SAMPLE_ITERATIONS)?;
    Ok(scale_iterations(SAMPLE_ITERATIONS, elapsed, target))
}

fn scale_iterations(sampled: u32, elapsed: Duration, target: Duration) -> u32 {
    let elapsed_us = elapsed.as_micros().max(1);
    let scaled = sampled as u128 * target.as_micros() / elapsed_us;
    let rounded = (scaled / 1_000 * 1_000).min(u32::MAX as u128) as u32;
    rounded.max(MIN_TUNED_ITERATIONS)
}
