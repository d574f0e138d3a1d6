//! Low-level cryptographic operations.
//!
//! This module and `lamport` are the only places in the crate that perform
//! encryption or signing on raw key material. Everything above them works
//! through key IDs.
//!
//! Primitive choices:
//! - **AEAD**: AES-128-GCM, AES-256-GCM, ChaCha20-Poly1305
//! - **Nonce**: 96-bit (12 bytes), supplied by the caller or generated per operation
//! - **MAC**: HMAC-SHA256, HMAC-SHA512
//! - **Signatures**: Ed25519, ECDSA P-256 with SHA-256 (ASN.1 DER encoding)

use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey};
use ring::hmac;
use ring::rand::SystemRandom;
use ring::signature::{self, EcdsaKeyPair, Ed25519KeyPair, KeyPair, UnparsedPublicKey};
use zeroize::Zeroizing;

use crate::context::constant_time_eq;
use crate::error::{HsmError, Result};

/// Size of the nonce in bytes (96 bits).
pub const NONCE_LEN: usize = 12;

/// Size of the GCM / Poly1305 authentication tag.
pub const TAG_LEN: usize = 16;

/// Ed25519 seed length.
pub const ED25519_SEED_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AeadAlgorithm {
    Aes128Gcm,
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl AeadAlgorithm {
    fn ring(&self) -> &'static aead::Algorithm {
        match self {
            Self::Aes128Gcm => &aead::AES_128_GCM,
            Self::Aes256Gcm => &aead::AES_256_GCM,
            Self::ChaCha20Poly1305 => &aead::CHACHA20_POLY1305,
        }
    }

    pub fn key_len(&self) -> usize {
        self.ring().key_len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacAlgorithm {
    HmacSha256,
    HmacSha512,
}

impl MacAlgorithm {
    fn ring(&self) -> hmac::Algorithm {
        match self {
            Self::HmacSha256 => hmac::HMAC_SHA256,
            Self::HmacSha512 => hmac::HMAC_SHA512,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureScheme {
    Ed25519,
    EcdsaP256Sha256,
}

/// Output of [`seal`]: ciphertext and detached authentication tag.
#[derive(Debug, Clone)]
pub struct Sealed {
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_LEN],
}

fn aead_key(alg: AeadAlgorithm, key_bytes: &[u8]) -> Result<LessSafeKey> {
    let unbound = UnboundKey::new(alg.ring(), key_bytes).map_err(|_| HsmError::InvalidKey)?;
    Ok(LessSafeKey::new(unbound))
}

/// Encrypt `plaintext` under `key_bytes` with an explicit nonce and
/// associated data.
///
/// The caller owns nonce uniqueness; a nonce must never repeat for one key.
pub fn seal(
    alg: AeadAlgorithm,
    key_bytes: &[u8],
    iv: &[u8; NONCE_LEN],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Sealed> {
    let key = aead_key(alg, key_bytes)?;
    let nonce = Nonce::assume_unique_for_key(*iv);

    let mut ciphertext = plaintext.to_vec();
    let tag = key
        .seal_in_place_separate_tag(nonce, Aad::from(aad), &mut ciphertext)
        .map_err(|_| HsmError::EncryptionFailure)?;

    let mut tag_bytes = [0u8; TAG_LEN];
    tag_bytes.copy_from_slice(tag.as_ref());
    Ok(Sealed {
        ciphertext,
        tag: tag_bytes,
    })
}

/// Decrypt a ciphertext produced by [`seal`].
///
/// A wrong key, nonce, associated data, or any tampering fails the tag
/// check. The caller receives no partial plaintext.
pub fn open(
    alg: AeadAlgorithm,
    key_bytes: &[u8],
    iv: &[u8; NONCE_LEN],
    aad: &[u8],
    ciphertext: &[u8],
    tag: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    if tag.len() != TAG_LEN {
        return Err(HsmError::DecryptionFailure);
    }
    let key = aead_key(alg, key_bytes)?;
    let nonce = Nonce::assume_unique_for_key(*iv);

    let mut payload = Zeroizing::new(Vec::with_capacity(ciphertext.len() + TAG_LEN));
    payload.extend_from_slice(ciphertext);
    payload.extend_from_slice(tag);

    let plaintext_len = key
        .open_in_place(nonce, Aad::from(aad), &mut payload)
        .map_err(|_| HsmError::DecryptionFailure)?
        .len();
    payload.truncate(plaintext_len);
    Ok(payload)
}

pub fn hmac_sign(alg: MacAlgorithm, key_bytes: &[u8], data: &[u8]) -> Vec<u8> {
    let key = hmac::Key::new(alg.ring(), key_bytes);
    hmac::sign(&key, data).as_ref().to_vec()
}

/// Recompute the MAC and compare in constant time.
pub fn hmac_verify(alg: MacAlgorithm, key_bytes: &[u8], data: &[u8], mac: &[u8]) -> bool {
    constant_time_eq(&hmac_sign(alg, key_bytes, data), mac)
}

pub fn ed25519_public_key(seed: &[u8]) -> Result<Vec<u8>> {
    let pair = Ed25519KeyPair::from_seed_unchecked(seed).map_err(|_| HsmError::InvalidKey)?;
    Ok(pair.public_key().as_ref().to_vec())
}

pub fn ed25519_sign(seed: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let pair = Ed25519KeyPair::from_seed_unchecked(seed).map_err(|_| HsmError::InvalidKey)?;
    Ok(pair.sign(data).as_ref().to_vec())
}

/// Generate a P-256 key pair as a PKCS#8 document.
///
/// `ring` only accepts its own sealed RNG for ECDSA, so this draws from the
/// OS generator regardless of the context's configured source.
pub fn ecdsa_p256_generate() -> Result<Zeroizing<Vec<u8>>> {
    let rng = SystemRandom::new();
    let doc = EcdsaKeyPair::generate_pkcs8(&signature::ECDSA_P256_SHA256_ASN1_SIGNING, &rng)
        .map_err(|_| HsmError::RandomnessFailure)?;
    Ok(Zeroizing::new(doc.as_ref().to_vec()))
}

fn ecdsa_pair(pkcs8: &[u8], rng: &SystemRandom) -> Result<EcdsaKeyPair> {
    EcdsaKeyPair::from_pkcs8(&signature::ECDSA_P256_SHA256_ASN1_SIGNING, pkcs8, rng)
        .map_err(|_| HsmError::InvalidKey)
}

pub fn ecdsa_p256_public_key(pkcs8: &[u8]) -> Result<Vec<u8>> {
    let rng = SystemRandom::new();
    Ok(ecdsa_pair(pkcs8, &rng)?.public_key().as_ref().to_vec())
}

pub fn ecdsa_p256_sign(pkcs8: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let rng = SystemRandom::new();
    let sig = ecdsa_pair(pkcs8, &rng)?
        .sign(&rng, data)
        .map_err(|_| HsmError::EncryptionFailure)?;
    Ok(sig.as_ref().to_vec())
}

/// Verify a public-key signature. An invalid signature is `false`, never an
/// error.
pub fn verify_signature(scheme: SignatureScheme, public_key: &[u8], data: &[u8], sig: &[u8]) -> bool {
    let alg: &'static dyn signature::VerificationAlgorithm = match scheme {
        SignatureScheme::Ed25519 => &signature::ED25519,
        SignatureScheme::EcdsaP256Sha256 => &signature::ECDSA_P256_SHA256_ASN1,
    };
    UnparsedPublicKey::new(alg, public_key).verify(data, sig).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const IV: [u8; NONCE_LEN] = [7u8; NONCE_LEN];

    #[test]
    fn test_seal_open_roundtrip() {
        for alg in [
            AeadAlgorithm::Aes128Gcm,
            AeadAlgorithm::Aes256Gcm,
            AeadAlgorithm::ChaCha20Poly1305,
        ] {
            let key = vec![3u8; alg.key_len()];
            let sealed = seal(alg, &key, &IV, b"aad", b"secret message").unwrap();
            assert_ne!(&sealed.ciphertext[..], b"secret message");
            let opened = open(alg, &key, &IV, b"aad", &sealed.ciphertext, &sealed.tag).unwrap();
            assert_eq!(&opened[..], b"secret message");
        }
    }

    #[test]
    fn test_open_rejects_tampering() {
        let key = [9u8; 32];
        let sealed = seal(AeadAlgorithm::Aes256Gcm, &key, &IV, b"", b"payload").unwrap();

        let mut bad_ct = sealed.ciphertext.clone();
        bad_ct[0] ^= 1;
        assert!(open(AeadAlgorithm::Aes256Gcm, &key, &IV, b"", &bad_ct, &sealed.tag).is_err());

        let mut bad_tag = sealed.tag;
        bad_tag[0] ^= 1;
        assert!(open(AeadAlgorithm::Aes256Gcm, &key, &IV, b"", &sealed.ciphertext, &bad_tag).is_err());

        assert!(open(AeadAlgorithm::Aes256Gcm, &key, &IV, b"other", &sealed.ciphertext, &sealed.tag).is_err());
        assert!(open(AeadAlgorithm::Aes256Gcm, &[1u8; 32], &IV, b"", &sealed.ciphertext, &sealed.tag).is_err());
    }

    #[test]
    fn test_wrong_key_length_is_invalid_key() {
        assert!(matches!(
            seal(AeadAlgorithm::Aes256Gcm, &[0u8; 16], &IV, b"", b"x"),
            Err(HsmError::InvalidKey)
        ));
    }

    #[test]
    fn test_signatures() {
        let seed = [5u8; ED25519_SEED_LEN];
        let pk = ed25519_public_key(&seed).unwrap();
        let sig = ed25519_sign(&seed, b"msg").unwrap();
        assert!(verify_signature(SignatureScheme::Ed25519, &pk, b"msg", &sig));
        assert!(!verify_signature(SignatureScheme::Ed25519, &pk, b"msG", &sig));

        let pkcs8 = ecdsa_p256_generate().unwrap();
        let pk = ecdsa_p256_public_key(&pkcs8).unwrap();
        let sig = ecdsa_p256_sign(&pkcs8, b"msg").unwrap();
        assert!(verify_signature(SignatureScheme::EcdsaP256Sha256, &pk, b"msg", &sig));
        assert!(!verify_signature(SignatureScheme::EcdsaP256Sha256, &pk, b"msg", &sig[1..]));
    }

    #[test]
    fn test_hmac() {
        let mac = hmac_sign(MacAlgorithm::HmacSha256, b"key", b"data");
        assert_eq!(mac.len(), 32);
        assert!(hmac_verify(MacAlgorithm::HmacSha256, b"key", b"data", &mac));
        assert!(!hmac_verify(MacAlgorithm::HmacSha256, b"key", b"datA", &mac));
        assert_eq!(hmac_sign(MacAlgorithm::HmacSha512, b"key", b"data").len(), 64);
    }
}
