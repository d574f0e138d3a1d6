//! Secure random generation.
//!
//! Three sourcing strategies:
//! - **hardware**: a [`HardwareRng`] device. The shipped device is simulated
//!   (a ChaCha-based generator seeded from the OS); a real driver plugs in
//!   behind the same trait.
//! - **system**: the OS CSPRNG through `ring::rand::SystemRandom`.
//! - **hybrid**: both sources sized independently to the requested length
//!   and combined byte-wise with XOR.
//!
//! An internal entropy pool is refreshed on a fixed interval (one hour by
//! default) from timing, process and OS-random inputs. Each refresh re-seeds
//! the hardware device from the pool.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use ring::rand::{SecureRandom as _, SystemRandom};
use serde::{Deserialize, Serialize};
use tracing::debug;
use zeroize::Zeroize;

use crate::error::{HsmError, Result};
use crate::hash;

/// Default interval between entropy pool refreshes.
pub const DEFAULT_RESEED_INTERVAL: Duration = Duration::from_secs(60 * 60);

const POOL_LEN: usize = 64;
const MIX_DOMAIN: &[u8] = b"hsmvault/entropy-mix/v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RandomSource {
    Hardware,
    System,
    Hybrid,
}

/// A hardware random number generator.
pub trait HardwareRng: Send {
    /// Fill `buf` entirely or fail.
    fn fill(&mut self, buf: &mut [u8]) -> Result<()>;

    /// Fold fresh seed material into the device state. Devices that manage
    /// their own entropy may ignore this.
    fn reseed(&mut self, _seed: [u8; 32]) {}
}

/// Simulated hardware device backed by a ChaCha stream cipher generator.
pub struct SimulatedHardwareRng {
    rng: StdRng,
}

impl SimulatedHardwareRng {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }
}

impl Default for SimulatedHardwareRng {
    fn default() -> Self {
        Self::new()
    }
}

impl HardwareRng for SimulatedHardwareRng {
    fn fill(&mut self, buf: &mut [u8]) -> Result<()> {
        self.rng
            .try_fill_bytes(buf)
            .map_err(|_| HsmError::RandomnessFailure)
    }

    fn reseed(&mut self, seed: [u8; 32]) {
        self.rng = StdRng::from_seed(seed);
    }
}

struct EntropyPool {
    state: [u8; POOL_LEN],
    created: Instant,
    last_reseed: Instant,
    reseeds: u64,
}

impl Drop for EntropyPool {
    fn drop(&mut self) {
        self.state.zeroize();
    }
}

/// Random generator combining the three sources. Constructed once per
/// [`crate::context::CryptoContext`]; there is no global instance.
pub struct SecureRandom {
    hardware: Mutex<Box<dyn HardwareRng>>,
    system: SystemRandom,
    pool: Mutex<EntropyPool>,
    reseed_interval: Duration,
}

impl SecureRandom {
    pub fn new(hardware: Box<dyn HardwareRng>, reseed_interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            hardware: Mutex::new(hardware),
            system: SystemRandom::new(),
            pool: Mutex::new(EntropyPool {
                state: [0u8; POOL_LEN],
                created: now,
                last_reseed: now,
                reseeds: 0,
            }),
            reseed_interval,
        }
    }

    pub fn reseed_interval(&self) -> Duration {
        self.reseed_interval
    }

    /// Number of pool refreshes performed so far.
    pub fn reseed_count(&self) -> u64 {
        self.pool.lock().reseeds
    }

    /// Produce exactly `len` bytes from `source`, optionally mixing in
    /// caller-supplied entropy.
    pub fn generate(
        &self,
        len: usize,
        source: RandomSource,
        extra_entropy: Option<&[u8]>,
    ) -> Result<Vec<u8>> {
        self.reseed_if_due()?;

        let mut out = vec![0u8; len];
        match source {
            RandomSource::Hardware => self.hardware.lock().fill(&mut out)?,
            RandomSource::System => self.fill_system(&mut out)?,
            RandomSource::Hybrid => {
                self.hardware.lock().fill(&mut out)?;
                let mut sys = vec![0u8; len];
                self.fill_system(&mut sys)?;
                for (o, s) in out.iter_mut().zip(sys.iter()) {
                    *o ^= s;
                }
                sys.zeroize();
            }
        }

        if let Some(extra) = extra_entropy {
            let mixed = mix_entropy(&out, extra);
            out.zeroize();
            out = mixed;
        }
        Ok(out)
    }

    fn fill_system(&self, buf: &mut [u8]) -> Result<()> {
        self.system
            .fill(buf)
            .map_err(|_| HsmError::RandomnessFailure)
    }

    fn reseed_if_due(&self) -> Result<()> {
        let due = self.pool.lock().last_reseed.elapsed() >= self.reseed_interval;
        if due {
            self.reseed()?;
        }
        Ok(())
    }

    /// Collect fresh entropy, fold it into the pool and re-seed the hardware
    /// device from the result.
    pub fn reseed(&self) -> Result<()> {
        let mut os = [0u8; 32];
        self.fill_system(&mut os)?;

        let mut pool = self.pool.lock();
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let mono = pool.created.elapsed().as_nanos();
        let thread = format!("{:?}", std::thread::current().id());

        let mut fresh = Vec::with_capacity(POOL_LEN + 96);
        fresh.extend_from_slice(&pool.state);
        fresh.extend_from_slice(&wall.to_be_bytes());
        fresh.extend_from_slice(&mono.to_be_bytes());
        fresh.extend_from_slice(&std::process::id().to_be_bytes());
        fresh.extend_from_slice(thread.as_bytes());
        fresh.extend_from_slice(&os);

        pool.state = hash::sha3_512(&fresh);
        pool.last_reseed = Instant::now();
        pool.reseeds += 1;
        fresh.zeroize();
        os.zeroize();

        let seed = hash::sha3_256(&pool.state);
        self.hardware.lock().reseed(seed);
        debug!(reseeds = pool.reseeds, "entropy pool refreshed");
        Ok(())
    }
}

/// Hash-based combiner: output has the same length as `random`.
pub fn mix_entropy(random: &[u8], extra: &[u8]) -> Vec<u8> {
    hash::shake256(&[MIX_DOMAIN, random, extra], random.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ConstantRng(u8);

    impl HardwareRng for ConstantRng {
        fn fill(&mut self, buf: &mut [u8]) -> Result<()> {
            buf.fill(self.0);
            Ok(())
        }
    }

    struct BrokenRng;

    impl HardwareRng for BrokenRng {
        fn fill(&mut self, _buf: &mut [u8]) -> Result<()> {
            Err(HsmError::RandomnessFailure)
        }
    }

    #[test]
    fn test_exact_length_for_every_source() {
        let rng = SecureRandom::new(Box::new(SimulatedHardwareRng::new()), DEFAULT_RESEED_INTERVAL);
        for source in [RandomSource::Hardware, RandomSource::System, RandomSource::Hybrid] {
            for len in [0usize, 1, 12, 32, 257] {
                assert_eq!(rng.generate(len, source, None).unwrap().len(), len);
                assert_eq!(rng.generate(len, source, Some(b"extra")).unwrap().len(), len);
            }
        }
    }

    #[test]
    fn test_hybrid_is_xor_of_both_sources() {
        // With a constant hardware stream, hybrid output XOR the constant must
        // look like system randomness, i.e. not the constant itself.
        let rng = SecureRandom::new(Box::new(ConstantRng(0xAA)), DEFAULT_RESEED_INTERVAL);
        let hw = rng.generate(32, RandomSource::Hardware, None).unwrap();
        assert_eq!(hw, vec![0xAA; 32]);
        let hybrid = rng.generate(32, RandomSource::Hybrid, None).unwrap();
        assert_ne!(hybrid, vec![0xAA; 32]);
    }

    #[test]
    fn test_hardware_failure_propagates() {
        let rng = SecureRandom::new(Box::new(BrokenRng), DEFAULT_RESEED_INTERVAL);
        assert!(rng.generate(8, RandomSource::Hardware, None).is_err());
        assert!(rng.generate(8, RandomSource::Hybrid, None).is_err());
        assert!(rng.generate(8, RandomSource::System, None).is_ok());
    }

    #[test]
    fn test_reseed_runs_on_interval() {
        let rng = SecureRandom::new(Box::new(SimulatedHardwareRng::new()), Duration::ZERO);
        rng.generate(4, RandomSource::System, None).unwrap();
        rng.generate(4, RandomSource::System, None).unwrap();
        assert_eq!(rng.reseed_count(), 2);

        let hourly = SecureRandom::new(Box::new(SimulatedHardwareRng::new()), DEFAULT_RESEED_INTERVAL);
        hourly.generate(4, RandomSource::System, None).unwrap();
        assert_eq!(hourly.reseed_count(), 0);
    }

    #[test]
    fn test_mix_preserves_length() {
        assert_eq!(mix_entropy(&[1u8; 48], b"caller entropy").len(), 48);
        assert_ne!(mix_entropy(&[1u8; 16], b"a"), mix_entropy(&[1u8; 16], b"b"));
    }
}
