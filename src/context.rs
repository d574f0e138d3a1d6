//! The crypto context.
//!
//! One `CryptoContext` is built per subsystem instance and shared by
//! reference (`Arc`) with every component that hashes, draws randomness or
//! derives keys. It owns the entropy pool and its reseed interval; nothing in
//! the crate keeps process-wide crypto state.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use subtle::ConstantTimeEq;

use crate::error::{HsmError, Result};
use crate::hash::{self, HashOptions};
use crate::kdf::{self, DerivedSecret, KdfParams};
use crate::random::{self, HardwareRng, RandomSource, SecureRandom, SimulatedHardwareRng};

/// Width of the timestamp prefix in generated nonces.
pub const NONCE_TIMESTAMP_LEN: usize = 8;

/// Shortest nonce [`CryptoContext::generate_nonce`] will produce.
pub const MIN_NONCE_LEN: usize = 12;

pub struct CryptoContext {
    random: SecureRandom,
    default_source: RandomSource,
}

impl CryptoContext {
    /// A context with the simulated hardware device, hourly reseeding and
    /// hybrid randomness by default.
    pub fn new() -> Self {
        Self::with_hardware(
            Box::new(SimulatedHardwareRng::new()),
            random::DEFAULT_RESEED_INTERVAL,
            RandomSource::Hybrid,
        )
    }

    pub fn with_hardware(
        hardware: Box<dyn HardwareRng>,
        reseed_interval: Duration,
        default_source: RandomSource,
    ) -> Self {
        Self {
            random: SecureRandom::new(hardware, reseed_interval),
            default_source,
        }
    }

    pub fn default_source(&self) -> RandomSource {
        self.default_source
    }

    pub fn random(&self) -> &SecureRandom {
        &self.random
    }

    /// `len` random bytes from the default source.
    pub fn secure_random(&self, len: usize) -> Result<Vec<u8>> {
        self.random.generate(len, self.default_source, None)
    }

    pub fn secure_random_from(
        &self,
        len: usize,
        source: RandomSource,
        extra_entropy: Option<&[u8]>,
    ) -> Result<Vec<u8>> {
        self.random.generate(len, source, extra_entropy)
    }

    pub fn secure_hash(&self, data: &[u8], opts: &HashOptions<'_>) -> Result<Vec<u8>> {
        hash::secure_hash(data, opts)
    }

    pub fn derive_key(&self, secret: &[u8], salt: &[u8], params: &KdfParams) -> Result<DerivedSecret> {
        kdf::derive_key(secret, salt, params)
    }

    /// A nonce of `len` bytes: an 8-byte big-endian nanosecond timestamp
    /// followed by a hybrid-random suffix.
    pub fn generate_nonce(&self, len: usize) -> Result<Vec<u8>> {
        if len < MIN_NONCE_LEN {
            return Err(HsmError::Validation(format!(
                "nonce length must be at least {} bytes",
                MIN_NONCE_LEN
            )));
        }
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|_| HsmError::RandomnessFailure)?
            .as_nanos() as u64;

        let mut nonce = Vec::with_capacity(len);
        nonce.extend_from_slice(&nanos.to_be_bytes());
        nonce.extend_from_slice(&self.random.generate(
            len - NONCE_TIMESTAMP_LEN,
            RandomSource::Hybrid,
            None,
        )?);
        Ok(nonce)
    }
}

impl Default for CryptoContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Constant-time equality for MACs, signatures and digests.
///
/// Lengths are compared first; length is not secret. Equal-length inputs are
/// compared in time independent of where they differ.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nonce_layout() {
        let ctx = CryptoContext::new();
        let a = ctx.generate_nonce(12).unwrap();
        let b = ctx.generate_nonce(24).unwrap();
        assert_eq!(a.len(), 12);
        assert_eq!(b.len(), 24);
        // Timestamp prefixes are monotone non-decreasing.
        let ta = u64::from_be_bytes(a[..8].try_into().unwrap());
        let tb = u64::from_be_bytes(b[..8].try_into().unwrap());
        assert!(tb >= ta);
        assert!(ctx.generate_nonce(11).is_err());
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
        assert!(constant_time_eq(b"", b""));
    }
}
