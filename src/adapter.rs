//! The vendor adapter contract.
//!
//! Every backend family implements [`VendorAdapter`]. Callers never talk to a
//! backend directly; the cluster manager hands each operation a live
//! [`Connection`] and the adapter performs it.
//!
//! Parameter validation shared by all adapters lives here as free functions.
//! Adapters call them first, before touching their backend, so a malformed
//! request never reaches the network.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::audit::{AuditEntry, AuditFilter};
use crate::connection::{Connection, ConnectionConfig};
use crate::crypto::{NONCE_LEN, TAG_LEN};
use crate::error::{HsmError, Result};
use crate::kdf::KdfParams;
use crate::keys::{KeyAlgorithm, KeyFilter, KeyMetadata, KeyType, KeyUsage};

/// Error rate above which a node is critical.
pub const CRITICAL_ERROR_RATE: f64 = 0.10;
/// Health-check latency above which a node is critical.
pub const CRITICAL_LATENCY_MS: f64 = 1000.0;
pub const DEGRADED_ERROR_RATE: f64 = 0.05;
pub const DEGRADED_LATENCY_MS: f64 = 500.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Healthy,
    Degraded,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub status: HealthLevel,
    /// Algorithm names and operation names this backend supports.
    pub capabilities: Vec<String>,
    pub latency_ms: f64,
    pub throughput_ops: f64,
    /// Fraction of recent operations that failed, 0.0 to 1.0.
    pub error_rate: f64,
    pub checked_at: DateTime<Utc>,
}

/// Derive a health level from measured latency and rolling error rate.
pub fn classify_health(latency_ms: f64, error_rate: f64) -> HealthLevel {
    if error_rate > CRITICAL_ERROR_RATE || latency_ms > CRITICAL_LATENCY_MS {
        HealthLevel::Critical
    } else if error_rate > DEGRADED_ERROR_RATE || latency_ms > DEGRADED_LATENCY_MS {
        HealthLevel::Degraded
    } else {
        HealthLevel::Healthy
    }
}

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct GenerateKeyParams {
    pub key_type: KeyType,
    pub algorithm: String,
    /// Key size in bits. Defaults to the algorithm's natural size.
    pub key_size: Option<u32>,
    pub usage: Vec<KeyUsage>,
    pub exportable: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

impl GenerateKeyParams {
    pub fn new(key_type: KeyType, algorithm: impl Into<String>, usage: Vec<KeyUsage>) -> Self {
        Self {
            key_type,
            algorithm: algorithm.into(),
            key_size: None,
            usage,
            exportable: false,
            expires_at: None,
        }
    }

    pub fn exportable(mut self, exportable: bool) -> Self {
        self.exportable = exportable;
        self
    }

    pub fn key_size(mut self, bits: u32) -> Self {
        self.key_size = Some(bits);
        self
    }

    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }
}

/// Material supplied to `import_key`.
#[derive(Clone)]
pub enum ImportMaterial {
    /// Symmetric key bytes, an Ed25519 seed or Lamport secrets.
    Raw(Zeroizing<Vec<u8>>),
    /// An ECDSA P-256 PKCS#8 document.
    Pkcs8(Zeroizing<Vec<u8>>),
    /// A passphrase stretched into a symmetric key by a KDF.
    Passphrase {
        secret: Zeroizing<Vec<u8>>,
        salt: Vec<u8>,
        kdf: KdfParams,
    },
}

impl std::fmt::Debug for ImportMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Raw(_) => f.write_str("ImportMaterial::Raw(<redacted>)"),
            Self::Pkcs8(_) => f.write_str("ImportMaterial::Pkcs8(<redacted>)"),
            Self::Passphrase { kdf, .. } => f
                .debug_struct("ImportMaterial::Passphrase")
                .field("secret", &"<redacted>")
                .field("kdf", &kdf.algorithm)
                .finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImportKeyParams {
    pub key_type: KeyType,
    pub algorithm: String,
    pub usage: Vec<KeyUsage>,
    pub exportable: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub material: ImportMaterial,
}

/// Key material released by `export_key`.
pub struct ExportedKey {
    pub key_id: String,
    pub algorithm: String,
    pub material: Zeroizing<Vec<u8>>,
    pub public_key: Option<Vec<u8>>,
}

impl std::fmt::Debug for ExportedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportedKey")
            .field("key_id", &self.key_id)
            .field("algorithm", &self.algorithm)
            .field("material", &"<redacted>")
            .field("public_key", &self.public_key.as_ref().map(hex::encode))
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EncryptParams {
    pub key_id: String,
    pub algorithm: String,
    pub data: Vec<u8>,
    /// A 12-byte IV. Generated by the backend when absent.
    pub iv: Option<Vec<u8>>,
    pub additional_data: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecryptParams {
    pub key_id: String,
    pub algorithm: String,
    pub ciphertext: Vec<u8>,
    pub iv: Option<Vec<u8>>,
    pub tag: Option<Vec<u8>>,
    pub additional_data: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignParams {
    pub key_id: String,
    pub algorithm: String,
    pub data: Vec<u8>,
    pub hash_algorithm: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VerifyParams {
    pub key_id: String,
    pub algorithm: String,
    pub data: Vec<u8>,
    pub signature: Vec<u8>,
    pub hash_algorithm: Option<String>,
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CryptoMetadata {
    pub algorithm: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub iv: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tag: Option<Vec<u8>>,
}

/// Ciphertext or plaintext, plus whatever the algorithm needs to reverse it.
#[derive(Debug, Clone, PartialEq)]
pub struct CryptoResult {
    pub key_id: String,
    pub data: Vec<u8>,
    pub metadata: CryptoMetadata,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KeyResult {
    pub key_id: String,
    /// Present for asymmetric and post-quantum keys.
    pub public_key: Option<Vec<u8>>,
    pub metadata: KeyMetadata,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignatureResult {
    pub key_id: String,
    pub algorithm: String,
    pub hash_algorithm: String,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerificationResult {
    pub valid: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationResult {
    pub success: bool,
    pub key_id: String,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KeyList {
    pub keys: Vec<KeyMetadata>,
    /// Matches before `limit` was applied.
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuditQueryResult {
    pub entries: Vec<AuditEntry>,
    pub total: usize,
}

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

/// The capability set every backend family exposes.
///
/// Every operation other than `connect` takes the live [`Connection`] it runs
/// on and fails with [`HsmError::NotConnected`] if that session is not
/// connected. Adapters must not retain key material beyond a single call.
#[async_trait]
pub trait VendorAdapter: Send + Sync {
    /// Vendor family name, used in key IDs, errors and audit entries.
    fn vendor(&self) -> &str;

    async fn connect(&self, config: &ConnectionConfig) -> Result<Connection>;

    async fn disconnect(&self, conn: &Connection) -> Result<()>;

    async fn health_check(&self, conn: &Connection) -> Result<HealthStatus>;

    async fn generate_key(&self, conn: &Connection, params: &GenerateKeyParams) -> Result<KeyResult>;

    async fn import_key(&self, conn: &Connection, params: &ImportKeyParams) -> Result<KeyResult>;

    /// Release key material. Refused with `Unauthorized` unless the key was
    /// created exportable.
    async fn export_key(&self, conn: &Connection, key_id: &str) -> Result<ExportedKey>;

    /// Remove a key for good. Deleting an absent key returns
    /// `success = false` rather than an error.
    async fn delete_key(&self, conn: &Connection, key_id: &str) -> Result<OperationResult>;

    async fn encrypt(&self, conn: &Connection, params: &EncryptParams) -> Result<CryptoResult>;

    async fn decrypt(&self, conn: &Connection, params: &DecryptParams) -> Result<CryptoResult>;

    async fn sign(&self, conn: &Connection, params: &SignParams) -> Result<SignatureResult>;

    /// An invalid signature is `valid: false`, not an error.
    async fn verify(&self, conn: &Connection, params: &VerifyParams) -> Result<VerificationResult>;

    async fn get_key_metadata(&self, conn: &Connection, key_id: &str) -> Result<KeyMetadata>;

    async fn list_keys(&self, conn: &Connection, filter: &KeyFilter) -> Result<KeyList>;

    async fn get_audit_logs(&self, conn: &Connection, filter: &AuditFilter) -> Result<AuditQueryResult>;
}

// ---------------------------------------------------------------------------
// Shared validation
// ---------------------------------------------------------------------------

pub fn ensure_connected(conn: &Connection) -> Result<()> {
    if conn.is_connected() {
        Ok(())
    } else {
        Err(HsmError::NotConnected {
            connection_id: conn.connection_id.clone(),
        })
    }
}

pub fn validate_key_id(key_id: &str) -> Result<()> {
    if key_id.trim().is_empty() {
        return Err(HsmError::Validation("key ID must not be empty".into()));
    }
    Ok(())
}

fn parse_algorithm(name: &str) -> Result<KeyAlgorithm> {
    if name.trim().is_empty() {
        return Err(HsmError::Validation("algorithm must not be empty".into()));
    }
    KeyAlgorithm::parse(name)
        .ok_or_else(|| HsmError::Validation(format!("unsupported algorithm {}", name)))
}

fn validate_key_shape(
    key_type: KeyType,
    algorithm: &str,
    usage: &[KeyUsage],
    expires_at: Option<DateTime<Utc>>,
) -> Result<KeyAlgorithm> {
    let alg = parse_algorithm(algorithm)?;
    if alg.key_type() != key_type {
        return Err(HsmError::Validation(format!(
            "{} is not a {:?} algorithm",
            alg.name(),
            key_type
        )));
    }
    if usage.is_empty() {
        return Err(HsmError::Validation("usage must not be empty".into()));
    }
    if let Some(bad) = usage.iter().find(|u| !alg.permitted_usage().contains(u)) {
        return Err(HsmError::Validation(format!(
            "usage {:?} is not permitted for {}",
            bad,
            alg.name()
        )));
    }
    if let Some(at) = expires_at {
        if at <= Utc::now() {
            return Err(HsmError::Validation("expiry must be in the future".into()));
        }
    }
    Ok(alg)
}

pub fn validate_generate(params: &GenerateKeyParams) -> Result<KeyAlgorithm> {
    let alg = validate_key_shape(params.key_type, &params.algorithm, &params.usage, params.expires_at)?;
    if let Some(bits) = params.key_size {
        if !alg.accepts_key_size(bits) {
            return Err(HsmError::Validation(format!(
                "key size {} is not valid for {}",
                bits,
                alg.name()
            )));
        }
    }
    Ok(alg)
}

pub fn validate_import(params: &ImportKeyParams) -> Result<KeyAlgorithm> {
    let alg = validate_key_shape(params.key_type, &params.algorithm, &params.usage, params.expires_at)?;
    let empty = match &params.material {
        ImportMaterial::Raw(b) | ImportMaterial::Pkcs8(b) => b.is_empty(),
        ImportMaterial::Passphrase { secret, .. } => secret.is_empty(),
    };
    if empty {
        return Err(HsmError::Validation("key material must not be empty".into()));
    }
    Ok(alg)
}

fn validate_iv(iv: Option<&Vec<u8>>) -> Result<()> {
    match iv {
        Some(iv) if iv.len() != NONCE_LEN => Err(HsmError::Validation(format!(
            "IV must be {} bytes, got {}",
            NONCE_LEN,
            iv.len()
        ))),
        _ => Ok(()),
    }
}

fn require_aead(algorithm: &str) -> Result<KeyAlgorithm> {
    let alg = parse_algorithm(algorithm)?;
    if alg.aead().is_none() {
        return Err(HsmError::Validation(format!("{} cannot encrypt", alg.name())));
    }
    Ok(alg)
}

pub fn validate_encrypt(params: &EncryptParams) -> Result<KeyAlgorithm> {
    validate_key_id(&params.key_id)?;
    let alg = require_aead(&params.algorithm)?;
    if params.data.is_empty() {
        return Err(HsmError::Validation("data must not be empty".into()));
    }
    validate_iv(params.iv.as_ref())?;
    Ok(alg)
}

pub fn validate_decrypt(params: &DecryptParams) -> Result<KeyAlgorithm> {
    validate_key_id(&params.key_id)?;
    let alg = require_aead(&params.algorithm)?;
    if params.ciphertext.is_empty() {
        return Err(HsmError::Validation("ciphertext must not be empty".into()));
    }
    if params.iv.is_none() {
        return Err(HsmError::Validation(format!("{} requires an IV", alg.name())));
    }
    validate_iv(params.iv.as_ref())?;
    match &params.tag {
        None => Err(HsmError::Validation(format!("{} requires a tag", alg.name()))),
        Some(tag) if tag.len() != TAG_LEN => Err(HsmError::Validation(format!(
            "tag must be {} bytes, got {}",
            TAG_LEN,
            tag.len()
        ))),
        Some(_) => Ok(alg),
    }
}

fn require_signing(algorithm: &str, hash_algorithm: Option<&str>) -> Result<KeyAlgorithm> {
    let alg = parse_algorithm(algorithm)?;
    if !alg.permitted_usage().contains(&KeyUsage::Sign) {
        return Err(HsmError::Validation(format!("{} cannot sign", alg.name())));
    }
    if let Some(h) = hash_algorithm {
        if !h.eq_ignore_ascii_case(alg.inherent_hash()) {
            return Err(HsmError::Validation(format!(
                "{} signs with {}, not {}",
                alg.name(),
                alg.inherent_hash(),
                h
            )));
        }
    }
    Ok(alg)
}

pub fn validate_sign(params: &SignParams) -> Result<KeyAlgorithm> {
    validate_key_id(&params.key_id)?;
    let alg = require_signing(&params.algorithm, params.hash_algorithm.as_deref())?;
    if params.data.is_empty() {
        return Err(HsmError::Validation("data must not be empty".into()));
    }
    Ok(alg)
}

pub fn validate_verify(params: &VerifyParams) -> Result<KeyAlgorithm> {
    validate_key_id(&params.key_id)?;
    let alg = require_signing(&params.algorithm, params.hash_algorithm.as_deref())?;
    if params.data.is_empty() {
        return Err(HsmError::Validation("data must not be empty".into()));
    }
    if params.signature.is_empty() {
        return Err(HsmError::Validation("signature must not be empty".into()));
    }
    Ok(alg)
}
