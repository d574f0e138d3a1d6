//! Key model and ownership.
//!
//! This module owns two responsibilities:
//! 1. The key data model: types, algorithms, usage tags and metadata, with an
//!    integrity hash computed over the canonical metadata.
//! 2. Holding key material in types that are opaque, non-cloneable and
//!    zeroised on drop, inside a [`KeyStore`] that only lends material to a
//!    closure for the duration of a single operation.
//!
//! Key material never leaves the crate except through an explicit export of
//! a key created with `exportable = true`.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::context::constant_time_eq;
use crate::crypto::{AeadAlgorithm, MacAlgorithm, SignatureScheme};
use crate::error::{HsmError, Result};
use crate::hash;
use crate::lamport::LamportPrivateKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyType {
    Symmetric,
    Asymmetric,
    PostQuantum,
}

/// Capability tags attached to a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyUsage {
    Encrypt,
    Decrypt,
    Sign,
    Verify,
    Wrap,
    Unwrap,
    Derive,
}

/// Every algorithm the software backend implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyAlgorithm {
    Aes128Gcm,
    Aes256Gcm,
    ChaCha20Poly1305,
    HmacSha256,
    HmacSha512,
    Ed25519,
    EcdsaP256Sha256,
    LamportSha3_256,
}

impl KeyAlgorithm {
    pub const ALL: [KeyAlgorithm; 8] = [
        Self::Aes128Gcm,
        Self::Aes256Gcm,
        Self::ChaCha20Poly1305,
        Self::HmacSha256,
        Self::HmacSha512,
        Self::Ed25519,
        Self::EcdsaP256Sha256,
        Self::LamportSha3_256,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Aes128Gcm => "AES-128-GCM",
            Self::Aes256Gcm => "AES-256-GCM",
            Self::ChaCha20Poly1305 => "CHACHA20-POLY1305",
            Self::HmacSha256 => "HMAC-SHA256",
            Self::HmacSha512 => "HMAC-SHA512",
            Self::Ed25519 => "ED25519",
            Self::EcdsaP256Sha256 => "ECDSA-P256-SHA256",
            Self::LamportSha3_256 => "LAMPORT-SHA3-256",
        }
    }

    /// Case-insensitive lookup by canonical name.
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|alg| alg.name().eq_ignore_ascii_case(name))
    }

    pub fn key_type(&self) -> KeyType {
        match self {
            Self::Aes128Gcm
            | Self::Aes256Gcm
            | Self::ChaCha20Poly1305
            | Self::HmacSha256
            | Self::HmacSha512 => KeyType::Symmetric,
            Self::Ed25519 | Self::EcdsaP256Sha256 => KeyType::Asymmetric,
            Self::LamportSha3_256 => KeyType::PostQuantum,
        }
    }

    /// Default key size in bits.
    pub fn default_key_size(&self) -> u32 {
        match self {
            Self::Aes128Gcm => 128,
            Self::Aes256Gcm | Self::ChaCha20Poly1305 | Self::HmacSha256 | Self::Ed25519 => 256,
            Self::HmacSha512 => 512,
            Self::EcdsaP256Sha256 => 256,
            Self::LamportSha3_256 => 256,
        }
    }

    /// Whether `bits` is an acceptable key size for this algorithm.
    pub fn accepts_key_size(&self, bits: u32) -> bool {
        match self {
            Self::HmacSha256 | Self::HmacSha512 => (128..=1024).contains(&bits) && bits % 8 == 0,
            _ => bits == self.default_key_size(),
        }
    }

    pub fn permitted_usage(&self) -> &'static [KeyUsage] {
        use KeyUsage::*;
        match self {
            Self::Aes128Gcm | Self::Aes256Gcm | Self::ChaCha20Poly1305 => {
                &[Encrypt, Decrypt, Wrap, Unwrap]
            }
            Self::HmacSha256 | Self::HmacSha512 => &[Sign, Verify, Derive],
            Self::Ed25519 | Self::EcdsaP256Sha256 | Self::LamportSha3_256 => &[Sign, Verify],
        }
    }

    pub fn aead(&self) -> Option<AeadAlgorithm> {
        match self {
            Self::Aes128Gcm => Some(AeadAlgorithm::Aes128Gcm),
            Self::Aes256Gcm => Some(AeadAlgorithm::Aes256Gcm),
            Self::ChaCha20Poly1305 => Some(AeadAlgorithm::ChaCha20Poly1305),
            _ => None,
        }
    }

    pub fn mac(&self) -> Option<MacAlgorithm> {
        match self {
            Self::HmacSha256 => Some(MacAlgorithm::HmacSha256),
            Self::HmacSha512 => Some(MacAlgorithm::HmacSha512),
            _ => None,
        }
    }

    pub fn signature_scheme(&self) -> Option<SignatureScheme> {
        match self {
            Self::Ed25519 => Some(SignatureScheme::Ed25519),
            Self::EcdsaP256Sha256 => Some(SignatureScheme::EcdsaP256Sha256),
            _ => None,
        }
    }

    /// The digest the signing primitive applies internally.
    pub fn inherent_hash(&self) -> &'static str {
        match self {
            Self::HmacSha256 | Self::EcdsaP256Sha256 => "SHA-256",
            Self::HmacSha512 | Self::Ed25519 => "SHA-512",
            Self::LamportSha3_256 => "SHA3-256",
            _ => "",
        }
    }
}

/// Public description of a key. Never contains secret material.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyMetadata {
    pub key_id: String,
    pub vendor: String,
    pub key_type: KeyType,
    pub algorithm: String,
    pub key_size: u32,
    pub usage: Vec<KeyUsage>,
    pub exportable: bool,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub public_key: Option<String>,
    /// Hex SHA3-256 over every other field in canonical form.
    pub integrity_hash: String,
}

/// The fields covered by the integrity hash, in canonical order.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MetadataDigestView<'a> {
    key_id: &'a str,
    vendor: &'a str,
    key_type: KeyType,
    algorithm: &'a str,
    key_size: u32,
    usage: &'a [KeyUsage],
    exportable: bool,
    created_at: &'a DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_at: Option<&'a DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    public_key: Option<&'a str>,
}

impl KeyMetadata {
    pub fn compute_integrity_hash(&self) -> Result<String> {
        let view = MetadataDigestView {
            key_id: &self.key_id,
            vendor: &self.vendor,
            key_type: self.key_type,
            algorithm: &self.algorithm,
            key_size: self.key_size,
            usage: &self.usage,
            exportable: self.exportable,
            created_at: &self.created_at,
            expires_at: self.expires_at.as_ref(),
            public_key: self.public_key.as_deref(),
        };
        Ok(hash::fingerprint(&serde_json::to_vec(&view)?))
    }

    /// Recompute the hash and compare with the stored one.
    pub fn verify_integrity(&self) -> bool {
        match self.compute_integrity_hash() {
            Ok(h) => constant_time_eq(h.as_bytes(), self.integrity_hash.as_bytes()),
            Err(_) => false,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |at| at <= now)
    }

    pub fn allows(&self, usage: KeyUsage) -> bool {
        self.usage.contains(&usage)
    }

    pub fn parsed_algorithm(&self) -> Result<KeyAlgorithm> {
        KeyAlgorithm::parse(&self.algorithm)
            .ok_or_else(|| HsmError::Validation(format!("unknown algorithm {}", self.algorithm)))
    }
}

/// Secret key material. Not `Clone`; zeroised on drop.
pub enum KeyMaterial {
    /// Raw symmetric key bytes or an Ed25519 seed.
    Secret(Zeroizing<Vec<u8>>),
    /// A PKCS#8 private key document.
    Pkcs8(Zeroizing<Vec<u8>>),
    Lamport(LamportPrivateKey),
}

impl KeyMaterial {
    pub(crate) fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Secret(b) | Self::Pkcs8(b) => b,
            Self::Lamport(k) => k.as_bytes(),
        }
    }
}

/// A key held by a backend.
pub struct StoredKey {
    pub metadata: KeyMetadata,
    pub(crate) material: KeyMaterial,
    /// Signatures produced so far.
    pub(crate) signatures_issued: u64,
}

impl std::fmt::Debug for StoredKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredKey")
            .field("metadata", &self.metadata)
            .field("material", &"<redacted>")
            .field("signatures_issued", &self.signatures_issued)
            .finish()
    }
}

impl StoredKey {
    pub fn new(metadata: KeyMetadata, material: KeyMaterial) -> Self {
        Self {
            metadata,
            material,
            signatures_issued: 0,
        }
    }
}

/// Selection criteria for listing keys.
#[derive(Debug, Clone, Default)]
pub struct KeyFilter {
    pub key_type: Option<KeyType>,
    pub algorithm: Option<String>,
    pub usage: Option<KeyUsage>,
    pub include_expired: bool,
    pub limit: Option<usize>,
}

impl KeyFilter {
    fn matches(&self, meta: &KeyMetadata, now: DateTime<Utc>) -> bool {
        self.key_type.map_or(true, |t| t == meta.key_type)
            && self
                .algorithm
                .as_ref()
                .map_or(true, |a| a.eq_ignore_ascii_case(&meta.algorithm))
            && self.usage.map_or(true, |u| meta.allows(u))
            && (self.include_expired || !meta.is_expired(now))
    }
}

/// An in-memory key partition. Nodes of one cluster share a partition the
/// way replicated HSM nodes share a key domain.
#[derive(Default)]
pub struct KeyStore {
    keys: RwLock<HashMap<String, StoredKey>>,
    /// SHA3-256 of every one-time public key that has signed. Outlives the
    /// keys themselves, so a spent key cannot come back through import.
    spent: Mutex<HashSet<[u8; 32]>>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.read().is_empty()
    }

    pub fn contains(&self, key_id: &str) -> bool {
        self.keys.read().contains_key(key_id)
    }

    /// Insert a key whose ID must not already exist. Returns the key back on
    /// collision so the caller can re-identify it.
    pub fn insert_unique(&self, key: StoredKey) -> std::result::Result<(), StoredKey> {
        let mut keys = self.keys.write();
        if keys.contains_key(&key.metadata.key_id) {
            return Err(key);
        }
        keys.insert(key.metadata.key_id.clone(), key);
        Ok(())
    }

    fn check(key: &StoredKey, verify_integrity: bool) -> Result<()> {
        if verify_integrity && !key.metadata.verify_integrity() {
            return Err(HsmError::vendor_op(
                &key.metadata.vendor,
                "load-key",
                format!("integrity check failed for {}", key.metadata.key_id),
                false,
            ));
        }
        Ok(())
    }

    /// Lend a key to `f` for the duration of one operation.
    pub fn with_key<R>(
        &self,
        key_id: &str,
        verify_integrity: bool,
        f: impl FnOnce(&StoredKey) -> Result<R>,
    ) -> Result<R> {
        let keys = self.keys.read();
        let key = keys
            .get(key_id)
            .ok_or_else(|| HsmError::KeyNotFound(key_id.to_string()))?;
        Self::check(key, verify_integrity)?;
        f(key)
    }

    pub fn with_key_mut<R>(
        &self,
        key_id: &str,
        verify_integrity: bool,
        f: impl FnOnce(&mut StoredKey) -> Result<R>,
    ) -> Result<R> {
        let mut keys = self.keys.write();
        let key = keys
            .get_mut(key_id)
            .ok_or_else(|| HsmError::KeyNotFound(key_id.to_string()))?;
        Self::check(key, verify_integrity)?;
        f(key)
    }

    pub fn metadata(&self, key_id: &str, verify_integrity: bool) -> Result<KeyMetadata> {
        self.with_key(key_id, verify_integrity, |k| Ok(k.metadata.clone()))
    }

    /// Record a one-time public key as used. Returns `false` if it already was.
    pub(crate) fn mark_spent(&self, public_key: &[u8]) -> bool {
        self.spent.lock().insert(hash::sha3_256(public_key))
    }

    pub fn is_spent(&self, public_key: &[u8]) -> bool {
        self.spent.lock().contains(&hash::sha3_256(public_key))
    }

    /// Remove a key. Terminal: the material is zeroised as it drops.
    /// Returns whether the key existed.
    pub fn remove(&self, key_id: &str) -> bool {
        self.keys.write().remove(key_id).is_some()
    }

    /// Matching keys ordered by creation time, then ID.
    pub fn list(&self, filter: &KeyFilter) -> (Vec<KeyMetadata>, usize) {
        let now = Utc::now();
        let keys = self.keys.read();
        let mut matched: Vec<KeyMetadata> = keys
            .values()
            .filter(|k| filter.matches(&k.metadata, now))
            .map(|k| k.metadata.clone())
            .collect();
        matched.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.key_id.cmp(&b.key_id)));
        let total = matched.len();
        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }
        (matched, total)
    }

    #[cfg(test)]
    pub(crate) fn tamper(&self, key_id: &str, f: impl FnOnce(&mut KeyMetadata)) {
        if let Some(k) = self.keys.write().get_mut(key_id) {
            f(&mut k.metadata);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(id: &str) -> KeyMetadata {
        let mut m = KeyMetadata {
            key_id: id.to_string(),
            vendor: "softhsm".into(),
            key_type: KeyType::Symmetric,
            algorithm: "AES-256-GCM".into(),
            key_size: 256,
            usage: vec![KeyUsage::Encrypt, KeyUsage::Decrypt],
            exportable: false,
            created_at: Utc::now(),
            expires_at: None,
            public_key: None,
            integrity_hash: String::new(),
        };
        m.integrity_hash = m.compute_integrity_hash().unwrap();
        m
    }

    fn stored(id: &str) -> StoredKey {
        StoredKey::new(meta(id), KeyMaterial::Secret(Zeroizing::new(vec![1u8; 32])))
    }

    #[test]
    fn test_algorithm_names_roundtrip() {
        for alg in KeyAlgorithm::ALL {
            assert_eq!(KeyAlgorithm::parse(alg.name()), Some(alg));
            assert_eq!(KeyAlgorithm::parse(&alg.name().to_lowercase()), Some(alg));
        }
        assert_eq!(KeyAlgorithm::parse("RSA-2048"), None);
    }

    #[test]
    fn test_metadata_integrity_detects_edit() {
        let mut m = meta("k1");
        assert!(m.verify_integrity());
        m.exportable = true;
        assert!(!m.verify_integrity());
    }

    #[test]
    fn test_insert_unique_rejects_duplicate() {
        let store = KeyStore::new();
        assert!(store.insert_unique(stored("k1")).is_ok());
        assert!(store.insert_unique(stored("k1")).is_err());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_tampered_record_rejected_on_load() {
        let store = KeyStore::new();
        store.insert_unique(stored("k1")).unwrap();
        store.tamper("k1", |m| m.usage.push(KeyUsage::Wrap));
        assert!(store.metadata("k1", true).is_err());
        assert!(store.metadata("k1", false).is_ok());
    }

    #[test]
    fn test_list_filter_and_limit() {
        let store = KeyStore::new();
        for i in 0..5 {
            store.insert_unique(stored(&format!("k{}", i))).unwrap();
        }
        let (keys, total) = store.list(&KeyFilter {
            limit: Some(2),
            ..KeyFilter::default()
        });
        assert_eq!(total, 5);
        assert_eq!(keys.len(), 2);

        let (none, _) = store.list(&KeyFilter {
            key_type: Some(KeyType::Asymmetric),
            ..KeyFilter::default()
        });
        assert!(none.is_empty());
    }

    #[test]
    fn test_remove_is_terminal() {
        let store = KeyStore::new();
        store.insert_unique(stored("k1")).unwrap();
        assert!(store.remove("k1"));
        assert!(!store.remove("k1"));
        assert!(matches!(store.metadata("k1", true), Err(HsmError::KeyNotFound(_))));
    }

    #[test]
    fn test_spent_marks_survive_removal() {
        let store = KeyStore::new();
        store.insert_unique(stored("k1")).unwrap();
        assert!(!store.is_spent(b"public half"));
        assert!(store.mark_spent(b"public half"));
        assert!(!store.mark_spent(b"public half"));
        store.remove("k1");
        assert!(store.is_spent(b"public half"));
        assert!(!store.is_spent(b"another public half"));
    }
}
