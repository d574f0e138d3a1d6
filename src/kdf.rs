//! Key derivation.
//!
//! Supported functions:
//! - scrypt (memory-hard, always available)
//! - PBKDF2-HMAC-SHA256 / PBKDF2-HMAC-SHA512 (via `ring`)
//! - Argon2id (behind the `argon2` cargo feature)
//!
//! When the requested function is not available in this build, or is named
//! but unknown, derivation falls back to scrypt. The fallback is never silent:
//! it logs at `warn` and the returned [`DerivedSecret`] carries the warning.

use std::num::NonZeroU32;

use ring::pbkdf2;
use serde::{Deserialize, Serialize};
use tracing::warn;
use zeroize::Zeroizing;

use crate::error::{HsmError, Result};

/// Minimum salt length accepted by every function.
pub const MIN_SALT_LEN: usize = 8;

/// Largest derived output accepted.
pub const MAX_OUTPUT_LEN: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KdfAlgorithm {
    #[serde(rename = "scrypt")]
    Scrypt,
    #[serde(rename = "PBKDF2-SHA256")]
    Pbkdf2Sha256,
    #[serde(rename = "PBKDF2-SHA512")]
    Pbkdf2Sha512,
    #[serde(rename = "Argon2id")]
    Argon2id,
}

impl KdfAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Scrypt => "scrypt",
            Self::Pbkdf2Sha256 => "PBKDF2-SHA256",
            Self::Pbkdf2Sha512 => "PBKDF2-SHA512",
            Self::Argon2id => "Argon2id",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "scrypt" => Some(Self::Scrypt),
            "pbkdf2" | "pbkdf2-sha256" | "pbkdf2-hmac-sha256" => Some(Self::Pbkdf2Sha256),
            "pbkdf2-sha512" | "pbkdf2-hmac-sha512" => Some(Self::Pbkdf2Sha512),
            "argon2id" | "argon2" => Some(Self::Argon2id),
            _ => None,
        }
    }

    /// Whether this build can run the function natively.
    pub fn is_available(&self) -> bool {
        match self {
            Self::Argon2id => cfg!(feature = "argon2"),
            _ => true,
        }
    }
}

/// Tuning parameters. Fields not used by the chosen function are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KdfParams {
    pub algorithm: KdfAlgorithm,
    pub output_len: usize,
    /// PBKDF2 rounds, or Argon2 time cost.
    pub iterations: u32,
    /// Argon2 memory cost in KiB.
    pub memory_kib: u32,
    /// Argon2 lanes.
    pub parallelism: u32,
    pub scrypt_log_n: u8,
    pub scrypt_r: u32,
    pub scrypt_p: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            algorithm: KdfAlgorithm::Scrypt,
            output_len: 32,
            iterations: 210_000,
            memory_kib: 19 * 1024,
            parallelism: 1,
            scrypt_log_n: 15,
            scrypt_r: 8,
            scrypt_p: 1,
        }
    }
}

impl KdfParams {
    pub fn for_algorithm(algorithm: KdfAlgorithm) -> Self {
        let mut params = Self {
            algorithm,
            ..Self::default()
        };
        if algorithm == KdfAlgorithm::Argon2id {
            params.iterations = 2;
        }
        params
    }
}

/// Output of a derivation.
pub struct DerivedSecret {
    pub key: Zeroizing<Vec<u8>>,
    /// The function that actually ran.
    pub algorithm: KdfAlgorithm,
    /// Set when the requested function was replaced by scrypt.
    pub fallback_warning: Option<String>,
}

impl std::fmt::Debug for DerivedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedSecret")
            .field("key", &"<redacted>")
            .field("algorithm", &self.algorithm)
            .field("fallback_warning", &self.fallback_warning)
            .finish()
    }
}

fn check_inputs(secret: &[u8], salt: &[u8], params: &KdfParams) -> Result<()> {
    if secret.is_empty() {
        return Err(HsmError::Validation("key derivation secret is empty".into()));
    }
    if salt.len() < MIN_SALT_LEN {
        return Err(HsmError::Validation(format!(
            "salt must be at least {} bytes",
            MIN_SALT_LEN
        )));
    }
    if params.output_len == 0 || params.output_len > MAX_OUTPUT_LEN {
        return Err(HsmError::Validation(format!(
            "derived length must be between 1 and {}",
            MAX_OUTPUT_LEN
        )));
    }
    Ok(())
}

/// Derive key material with `params.algorithm`.
pub fn derive_key(secret: &[u8], salt: &[u8], params: &KdfParams) -> Result<DerivedSecret> {
    check_inputs(secret, salt, params)?;

    if !params.algorithm.is_available() {
        let msg = format!(
            "{} is not available in this build; falling back to scrypt",
            params.algorithm.name()
        );
        warn!(requested = params.algorithm.name(), "{}", msg);
        return Ok(DerivedSecret {
            key: run_scrypt(secret, salt, params)?,
            algorithm: KdfAlgorithm::Scrypt,
            fallback_warning: Some(msg),
        });
    }

    let key = match params.algorithm {
        KdfAlgorithm::Scrypt => run_scrypt(secret, salt, params)?,
        KdfAlgorithm::Pbkdf2Sha256 => run_pbkdf2(pbkdf2::PBKDF2_HMAC_SHA256, secret, salt, params)?,
        KdfAlgorithm::Pbkdf2Sha512 => run_pbkdf2(pbkdf2::PBKDF2_HMAC_SHA512, secret, salt, params)?,
        KdfAlgorithm::Argon2id => run_argon2id(secret, salt, params)?,
    };

    Ok(DerivedSecret {
        key,
        algorithm: params.algorithm,
        fallback_warning: None,
    })
}

/// Derive key material with a function named at runtime (e.g. from a config
/// allow-list). Unknown names fall back to scrypt with a warning.
pub fn derive_key_named(
    name: &str,
    secret: &[u8],
    salt: &[u8],
    params: &KdfParams,
) -> Result<DerivedSecret> {
    match KdfAlgorithm::parse(name) {
        Some(algorithm) => derive_key(secret, salt, &KdfParams { algorithm, ..*params }),
        None => {
            check_inputs(secret, salt, params)?;
            let msg = format!("unknown key derivation function {:?}; falling back to scrypt", name);
            warn!(requested = name, "{}", msg);
            Ok(DerivedSecret {
                key: run_scrypt(secret, salt, params)?,
                algorithm: KdfAlgorithm::Scrypt,
                fallback_warning: Some(msg),
            })
        }
    }
}

fn run_scrypt(secret: &[u8], salt: &[u8], params: &KdfParams) -> Result<Zeroizing<Vec<u8>>> {
    // `len` on scrypt::Params only matters for PHC strings; it is clamped to
    // the range the crate accepts.
    let scrypt_params = scrypt::Params::new(
        params.scrypt_log_n,
        params.scrypt_r,
        params.scrypt_p,
        params.output_len.clamp(10, 64),
    )
    .map_err(|_| HsmError::Validation("invalid scrypt parameters".into()))?;

    let mut out = Zeroizing::new(vec![0u8; params.output_len]);
    scrypt::scrypt(secret, salt, &scrypt_params, &mut out)
        .map_err(|_| HsmError::KeyDerivationFailure)?;
    Ok(out)
}

fn run_pbkdf2(
    algorithm: pbkdf2::Algorithm,
    secret: &[u8],
    salt: &[u8],
    params: &KdfParams,
) -> Result<Zeroizing<Vec<u8>>> {
    let rounds = NonZeroU32::new(params.iterations)
        .ok_or_else(|| HsmError::Validation("PBKDF2 iterations must be non-zero".into()))?;
    let mut out = Zeroizing::new(vec![0u8; params.output_len]);
    pbkdf2::derive(algorithm, rounds, salt, secret, &mut out);
    Ok(out)
}

#[cfg(feature = "argon2")]
fn run_argon2id(secret: &[u8], salt: &[u8], params: &KdfParams) -> Result<Zeroizing<Vec<u8>>> {
    use argon2::{Algorithm, Argon2, Params, Version};

    let argon_params = Params::new(
        params.memory_kib,
        params.iterations,
        params.parallelism,
        Some(params.output_len),
    )
    .map_err(|_| HsmError::Validation("invalid Argon2 parameters".into()))?;

    let mut out = Zeroizing::new(vec![0u8; params.output_len]);
    Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params)
        .hash_password_into(secret, salt, &mut out)
        .map_err(|_| HsmError::KeyDerivationFailure)?;
    Ok(out)
}

#[cfg(not(feature = "argon2"))]
fn run_argon2id(_secret: &[u8], _salt: &[u8], _params: &KdfParams) -> Result<Zeroizing<Vec<u8>>> {
    // Unreachable through `derive_key`, which checks availability first.
    Err(HsmError::KeyDerivationFailure)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast(algorithm: KdfAlgorithm) -> KdfParams {
        KdfParams {
            algorithm,
            output_len: 32,
            iterations: if algorithm == KdfAlgorithm::Argon2id { 1 } else { 1000 },
            memory_kib: 64,
            parallelism: 1,
            scrypt_log_n: 4,
            scrypt_r: 8,
            scrypt_p: 1,
        }
    }

    #[test]
    fn test_deterministic_per_algorithm() {
        for alg in [
            KdfAlgorithm::Scrypt,
            KdfAlgorithm::Pbkdf2Sha256,
            KdfAlgorithm::Pbkdf2Sha512,
            KdfAlgorithm::Argon2id,
        ] {
            let a = derive_key(b"passphrase", b"saltsalt", &fast(alg)).unwrap();
            let b = derive_key(b"passphrase", b"saltsalt", &fast(alg)).unwrap();
            assert_eq!(*a.key, *b.key);
            assert_eq!(a.key.len(), 32);
            let c = derive_key(b"passphrase", b"othersalt", &fast(alg)).unwrap();
            assert_ne!(*a.key, *c.key);
        }
    }

    #[test]
    fn test_algorithms_disagree() {
        let s = derive_key(b"pw", b"saltsalt", &fast(KdfAlgorithm::Scrypt)).unwrap();
        let p = derive_key(b"pw", b"saltsalt", &fast(KdfAlgorithm::Pbkdf2Sha256)).unwrap();
        assert_ne!(*s.key, *p.key);
    }

    #[test]
    fn test_unknown_name_falls_back_with_warning() {
        let out = derive_key_named("bcrypt", b"pw", b"saltsalt", &fast(KdfAlgorithm::Scrypt)).unwrap();
        assert_eq!(out.algorithm, KdfAlgorithm::Scrypt);
        assert!(out.fallback_warning.unwrap().contains("bcrypt"));

        let direct = derive_key(b"pw", b"saltsalt", &fast(KdfAlgorithm::Scrypt)).unwrap();
        assert_eq!(*direct.key, *derive_key_named("bcrypt", b"pw", b"saltsalt", &fast(KdfAlgorithm::Scrypt)).unwrap().key);
    }

    #[cfg(not(feature = "argon2"))]
    #[test]
    fn test_missing_argon2_falls_back() {
        let out = derive_key(b"pw", b"saltsalt", &fast(KdfAlgorithm::Argon2id)).unwrap();
        assert_eq!(out.algorithm, KdfAlgorithm::Scrypt);
        assert!(out.fallback_warning.is_some());
    }

    #[test]
    fn test_rejects_short_salt_and_empty_secret() {
        assert!(derive_key(b"pw", b"short", &fast(KdfAlgorithm::Scrypt)).is_err());
        assert!(derive_key(b"", b"saltsalt", &fast(KdfAlgorithm::Scrypt)).is_err());
        let mut zero = fast(KdfAlgorithm::Pbkdf2Sha256);
        zero.iterations = 0;
        assert!(derive_key(b"pw", b"saltsalt", &zero).is_err());
    }
}
