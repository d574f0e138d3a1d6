//! SHA-3 family hashing.
//!
//! Two fixed-output variants (SHA3-256, SHA3-512) and the SHAKE256
//! extensible-output function. Every variant accepts an optional salt and an
//! iteration count for deliberate hash chaining:
//!
//! ```text
//! h_1 = H(salt || data)
//! h_n = H(h_{n-1} || salt)
//! ```
//!
//! For SHAKE256 each round produces exactly the requested output length, so
//! the chain never changes the output size.

use serde::{Deserialize, Serialize};
use sha3::digest::{ExtendableOutput, Update, XofReader};
use sha3::{Digest, Sha3_256, Sha3_512, Shake256};

use crate::error::{HsmError, Result};

/// Default output length for SHAKE256 when the caller does not ask for one.
pub const DEFAULT_XOF_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HashAlgorithm {
    #[serde(rename = "SHA3-256")]
    Sha3_256,
    #[serde(rename = "SHA3-512")]
    Sha3_512,
    #[serde(rename = "SHAKE256")]
    Shake256,
}

impl HashAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sha3_256 => "SHA3-256",
            Self::Sha3_512 => "SHA3-512",
            Self::Shake256 => "SHAKE256",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "SHA3-256" | "SHA3_256" => Some(Self::Sha3_256),
            "SHA3-512" | "SHA3_512" => Some(Self::Sha3_512),
            "SHAKE256" | "SHAKE-256" => Some(Self::Shake256),
            _ => None,
        }
    }

    /// Native digest length, `None` for the extensible-output function.
    pub fn fixed_len(&self) -> Option<usize> {
        match self {
            Self::Sha3_256 => Some(32),
            Self::Sha3_512 => Some(64),
            Self::Shake256 => None,
        }
    }
}

/// Options for [`secure_hash`].
#[derive(Debug, Clone, Copy)]
pub struct HashOptions<'a> {
    pub algorithm: HashAlgorithm,
    pub salt: Option<&'a [u8]>,
    /// Number of chained rounds. Must be at least 1.
    pub iterations: u32,
    /// Output length for SHAKE256. Must match the native length for the
    /// fixed-output variants when given.
    pub output_len: Option<usize>,
}

impl Default for HashOptions<'_> {
    fn default() -> Self {
        Self {
            algorithm: HashAlgorithm::Sha3_256,
            salt: None,
            iterations: 1,
            output_len: None,
        }
    }
}

impl<'a> HashOptions<'a> {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        Self {
            algorithm,
            ..Self::default()
        }
    }

    pub fn with_salt(mut self, salt: &'a [u8]) -> Self {
        self.salt = Some(salt);
        self
    }

    pub fn with_iterations(mut self, iterations: u32) -> Self {
        self.iterations = iterations;
        self
    }

    pub fn with_output_len(mut self, len: usize) -> Self {
        self.output_len = Some(len);
        self
    }
}

/// SHA3-256 of `data`.
pub fn sha3_256(data: &[u8]) -> [u8; 32] {
    Sha3_256::digest(data).into()
}

/// SHA3-512 of `data`.
pub fn sha3_512(data: &[u8]) -> [u8; 64] {
    Sha3_512::digest(data).into()
}

/// SHAKE256 of the concatenation of `parts`, squeezed to `len` bytes.
pub fn shake256(parts: &[&[u8]], len: usize) -> Vec<u8> {
    let mut hasher = Shake256::default();
    for part in parts {
        Update::update(&mut hasher, part);
    }
    let mut reader = hasher.finalize_xof();
    let mut out = vec![0u8; len];
    reader.read(&mut out);
    out
}

fn one_round(algorithm: HashAlgorithm, first: &[u8], second: &[u8], len: usize) -> Vec<u8> {
    match algorithm {
        HashAlgorithm::Sha3_256 => {
            let mut h = Sha3_256::new();
            Digest::update(&mut h, first);
            Digest::update(&mut h, second);
            h.finalize().to_vec()
        }
        HashAlgorithm::Sha3_512 => {
            let mut h = Sha3_512::new();
            Digest::update(&mut h, first);
            Digest::update(&mut h, second);
            h.finalize().to_vec()
        }
        HashAlgorithm::Shake256 => shake256(&[first, second], len),
    }
}

/// Hash `data` with the given options.
///
/// Deterministic: identical input, salt and options always produce identical
/// output; changing the salt changes the output.
pub fn secure_hash(data: &[u8], opts: &HashOptions<'_>) -> Result<Vec<u8>> {
    if opts.iterations == 0 {
        return Err(HsmError::Validation("hash iterations must be at least 1".into()));
    }

    let len = match (opts.algorithm.fixed_len(), opts.output_len) {
        (Some(native), Some(requested)) if native != requested => {
            return Err(HsmError::Validation(format!(
                "{} produces {} bytes, {} requested",
                opts.algorithm.name(),
                native,
                requested
            )));
        }
        (Some(native), _) => native,
        (None, Some(0)) => {
            return Err(HsmError::Validation("output length must be non-zero".into()));
        }
        (None, Some(requested)) => requested,
        (None, None) => DEFAULT_XOF_LEN,
    };

    let salt = opts.salt.unwrap_or(&[]);
    let mut digest = one_round(opts.algorithm, salt, data, len);
    for _ in 1..opts.iterations {
        digest = one_round(opts.algorithm, &digest, salt, len);
    }
    Ok(digest)
}

/// Hex-encoded SHA3-256, used for integrity fingerprints.
pub fn fingerprint(data: &[u8]) -> String {
    hex::encode(sha3_256(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_salt_same_digest() {
        let opts = HashOptions::new(HashAlgorithm::Sha3_512).with_salt(b"salt-a");
        assert_eq!(
            secure_hash(b"payload", &opts).unwrap(),
            secure_hash(b"payload", &opts).unwrap()
        );
    }

    #[test]
    fn test_different_salt_different_digest() {
        let a = HashOptions::new(HashAlgorithm::Sha3_256).with_salt(b"salt-a");
        let b = HashOptions::new(HashAlgorithm::Sha3_256).with_salt(b"salt-b");
        assert_ne!(
            secure_hash(b"payload", &a).unwrap(),
            secure_hash(b"payload", &b).unwrap()
        );
    }

    #[test]
    fn test_iterations_chain() {
        let once = HashOptions::new(HashAlgorithm::Sha3_256);
        let twice = once.with_iterations(2);
        let h1 = secure_hash(b"x", &once).unwrap();
        let h2 = secure_hash(b"x", &twice).unwrap();
        assert_ne!(h1, h2);
        assert_eq!(h2, one_round(HashAlgorithm::Sha3_256, &h1, &[], 32));
    }

    #[test]
    fn test_xof_arbitrary_lengths() {
        for len in [1usize, 16, 32, 64, 200, 1000] {
            let opts = HashOptions::new(HashAlgorithm::Shake256)
                .with_output_len(len)
                .with_iterations(3);
            assert_eq!(secure_hash(b"data", &opts).unwrap().len(), len);
        }
        // A shorter squeeze is a prefix of a longer one.
        let short = shake256(&[b"data"], 16);
        let long = shake256(&[b"data"], 64);
        assert_eq!(&long[..16], &short[..]);
    }

    #[test]
    fn test_rejects_bad_options() {
        assert!(secure_hash(b"x", &HashOptions::default().with_iterations(0)).is_err());
        assert!(secure_hash(b"x", &HashOptions::default().with_output_len(64)).is_err());
        let zero = HashOptions::new(HashAlgorithm::Shake256).with_output_len(0);
        assert!(secure_hash(b"x", &zero).is_err());
    }

    #[test]
    fn test_known_vector() {
        // SHA3-256("") from FIPS 202.
        assert_eq!(
            hex::encode(sha3_256(b"")),
            "a7ffc6f8bf1ed76651c14756a061d662f580ff4de43b49fa82d80a4b80f8434a"
        );
    }
}
