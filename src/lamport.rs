//! Lamport one-time signatures over SHA3-256.
//!
//! The software backend's post-quantum algorithm (`LAMPORT-SHA3-256`). Its
//! security rests only on the preimage resistance of the hash, which quantum
//! computers weaken but do not break.
//!
//! ```text
//! private key: 256 pairs of 32-byte secrets        (16 KiB)
//! public key : SHA3-256 of every secret            (16 KiB)
//! signature  : for each bit b_i of SHA3-256(msg), the secret [i][b_i]  (8 KiB)
//! ```
//!
//! Each private key may sign exactly once. Signing twice reveals enough
//! secrets to forge; the key store enforces the limit.

use subtle::{Choice, ConstantTimeEq};
use zeroize::Zeroizing;

use crate::error::{HsmError, Result};
use crate::hash::sha3_256;

const HASH_LEN: usize = 32;
const BITS: usize = HASH_LEN * 8;

pub const PRIVATE_KEY_LEN: usize = BITS * 2 * HASH_LEN;
pub const PUBLIC_KEY_LEN: usize = PRIVATE_KEY_LEN;
pub const SIGNATURE_LEN: usize = BITS * HASH_LEN;

pub struct LamportPrivateKey {
    secrets: Zeroizing<Vec<u8>>,
}

impl LamportPrivateKey {
    pub fn from_bytes(secrets: Zeroizing<Vec<u8>>) -> Result<Self> {
        if secrets.len() != PRIVATE_KEY_LEN {
            return Err(HsmError::InvalidKey);
        }
        Ok(Self { secrets })
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.secrets
    }

    fn secret(&self, bit: usize, value: u8) -> &[u8] {
        let start = (bit * 2 + value as usize) * HASH_LEN;
        &self.secrets[start..start + HASH_LEN]
    }

    pub fn public_key(&self) -> Vec<u8> {
        let mut pk = Vec::with_capacity(PUBLIC_KEY_LEN);
        for chunk in self.secrets.chunks_exact(HASH_LEN) {
            pk.extend_from_slice(&sha3_256(chunk));
        }
        pk
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        let digest = sha3_256(message);
        let mut sig = Vec::with_capacity(SIGNATURE_LEN);
        for i in 0..BITS {
            sig.extend_from_slice(self.secret(i, bit_at(&digest, i)));
        }
        sig
    }
}

fn bit_at(digest: &[u8; HASH_LEN], i: usize) -> u8 {
    (digest[i / 8] >> (7 - (i % 8))) & 1
}

/// Check a signature against a public key. Every position is checked even
/// after a mismatch.
pub fn verify(public_key: &[u8], message: &[u8], sig: &[u8]) -> bool {
    if public_key.len() != PUBLIC_KEY_LEN || sig.len() != SIGNATURE_LEN {
        return false;
    }
    let digest = sha3_256(message);
    let mut ok = Choice::from(1u8);
    for i in 0..BITS {
        let revealed = &sig[i * HASH_LEN..(i + 1) * HASH_LEN];
        let slot = (i * 2 + bit_at(&digest, i) as usize) * HASH_LEN;
        let expected = &public_key[slot..slot + HASH_LEN];
        ok &= sha3_256(revealed)[..].ct_eq(expected);
    }
    ok.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> LamportPrivateKey {
        let bytes: Vec<u8> = (0..PRIVATE_KEY_LEN).map(|i| (i * 31 % 251) as u8).collect();
        LamportPrivateKey::from_bytes(Zeroizing::new(bytes)).unwrap()
    }

    #[test]
    fn test_sign_verify() {
        let sk = key();
        let pk = sk.public_key();
        let sig = sk.sign(b"quantum-safe");
        assert_eq!(sig.len(), SIGNATURE_LEN);
        assert!(verify(&pk, b"quantum-safe", &sig));
        assert!(!verify(&pk, b"quantum-unsafe", &sig));

        let mut forged = sig.clone();
        forged[100] ^= 0x01;
        assert!(!verify(&pk, b"quantum-safe", &forged));
        assert!(!verify(&pk, b"quantum-safe", &sig[..SIGNATURE_LEN - 1]));
    }

    #[test]
    fn test_rejects_wrong_key_length() {
        assert!(LamportPrivateKey::from_bytes(Zeroizing::new(vec![0u8; 10])).is_err());
    }
}
