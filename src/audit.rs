//! Tamper-evident audit logging.
//!
//! Every privileged operation produces an [`AuditEntry`], successful or not.
//! An entry carries a SHA3-256 hash over its canonical serialised content;
//! any later reader recomputes the hash to confirm the entry was not altered.
//! The log is append-only and can forward entries to pluggable sinks.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use ring::rand::{SecureRandom as _, SystemRandom};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::context::constant_time_eq;
use crate::crypto::{self, AeadAlgorithm, NONCE_LEN, TAG_LEN};
use crate::error::{HsmError, Result};
use crate::hash;

/// Outcome recorded for an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Success,
    Failure,
    Unauthorized,
    Error,
}

impl AuditOutcome {
    /// Classify an operation's result.
    pub fn of<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => Self::Success,
            Err(HsmError::Validation(_))
            | Err(HsmError::KeyNotFound(_))
            | Err(HsmError::Configuration(_)) => Self::Failure,
            Err(HsmError::Unauthorized(_)) | Err(HsmError::Authentication(_)) => Self::Unauthorized,
            Err(_) => Self::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetrics {
    pub duration_micros: u64,
    pub operation_type: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub bytes_processed: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityContext {
    pub auth_method: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub session_id: Option<String>,
}

/// A permanent record of one privileged operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub operation_id: String,
    pub timestamp: DateTime<Utc>,
    pub operation: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub key_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub source_ip: Option<String>,
    pub result: AuditOutcome,
    pub performance_metrics: PerformanceMetrics,
    pub security_context: SecurityContext,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub additional_data: Option<serde_json::Value>,
    /// Hex SHA3-256 over the canonical form of every field above.
    pub integrity_hash: String,
    /// Whether the hash was recomputed and matched when the entry was built.
    pub integrity_verified: bool,
}

/// The hashed portion of an entry, in canonical field order.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CanonicalContent<'a> {
    operation_id: &'a str,
    timestamp: &'a DateTime<Utc>,
    operation: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    key_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    source_ip: Option<&'a str>,
    result: AuditOutcome,
    performance_metrics: &'a PerformanceMetrics,
    security_context: &'a SecurityContext,
    #[serde(skip_serializing_if = "Option::is_none")]
    additional_data: Option<&'a serde_json::Value>,
}

impl AuditEntry {
    fn canonical_bytes(&self) -> Result<Vec<u8>> {
        let content = CanonicalContent {
            operation_id: &self.operation_id,
            timestamp: &self.timestamp,
            operation: &self.operation,
            key_id: self.key_id.as_deref(),
            user_id: self.user_id.as_deref(),
            source_ip: self.source_ip.as_deref(),
            result: self.result,
            performance_metrics: &self.performance_metrics,
            security_context: &self.security_context,
            additional_data: self.additional_data.as_ref(),
        };
        Ok(serde_json::to_vec(&content)?)
    }

    pub fn compute_hash(&self) -> Result<String> {
        Ok(hash::fingerprint(&self.canonical_bytes()?))
    }

    /// Recompute the content hash and compare with the recorded one.
    pub fn verify_integrity(&self) -> bool {
        match self.compute_hash() {
            Ok(h) => constant_time_eq(h.as_bytes(), self.integrity_hash.as_bytes()),
            Err(_) => false,
        }
    }
}

/// Builds an [`AuditEntry`] from discrete inputs. Optional fields appear in
/// the entry only when supplied.
#[derive(Debug, Clone)]
pub struct AuditEntryBuilder {
    operation: String,
    result: AuditOutcome,
    duration: Duration,
    operation_type: String,
    auth_method: String,
    key_id: Option<String>,
    user_id: Option<String>,
    source_ip: Option<String>,
    bytes_processed: Option<u64>,
    session_id: Option<String>,
    additional_data: Option<serde_json::Value>,
}

impl AuditEntryBuilder {
    pub fn new(
        operation: impl Into<String>,
        result: AuditOutcome,
        duration: Duration,
        operation_type: impl Into<String>,
        auth_method: impl Into<String>,
    ) -> Self {
        Self {
            operation: operation.into(),
            result,
            duration,
            operation_type: operation_type.into(),
            auth_method: auth_method.into(),
            key_id: None,
            user_id: None,
            source_ip: None,
            bytes_processed: None,
            session_id: None,
            additional_data: None,
        }
    }

    pub fn key_id(mut self, key_id: impl Into<String>) -> Self {
        self.key_id = Some(key_id.into());
        self
    }

    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn source_ip(mut self, source_ip: impl Into<String>) -> Self {
        self.source_ip = Some(source_ip.into());
        self
    }

    pub fn bytes_processed(mut self, bytes: u64) -> Self {
        self.bytes_processed = Some(bytes);
        self
    }

    pub fn session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn additional_data(mut self, data: serde_json::Value) -> Self {
        self.additional_data = Some(data);
        self
    }

    pub fn build(self) -> Result<AuditEntry> {
        if self.operation.is_empty() || self.operation_type.is_empty() || self.auth_method.is_empty() {
            return Err(HsmError::Validation(
                "audit entries require operation, operation type and auth method".into(),
            ));
        }
        let mut entry = AuditEntry {
            operation_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            operation: self.operation,
            key_id: self.key_id,
            user_id: self.user_id,
            source_ip: self.source_ip,
            result: self.result,
            performance_metrics: PerformanceMetrics {
                duration_micros: u64::try_from(self.duration.as_micros()).unwrap_or(u64::MAX),
                operation_type: self.operation_type,
                bytes_processed: self.bytes_processed,
            },
            security_context: SecurityContext {
                auth_method: self.auth_method,
                session_id: self.session_id,
            },
            additional_data: self.additional_data,
            integrity_hash: String::new(),
            integrity_verified: false,
        };
        entry.integrity_hash = entry.compute_hash()?;
        entry.integrity_verified = entry.verify_integrity();
        Ok(entry)
    }
}

/// Selection criteria for querying audit entries.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub operation: Option<String>,
    pub key_id: Option<String>,
    pub result: Option<AuditOutcome>,
    pub limit: Option<usize>,
}

impl AuditFilter {
    pub fn matches(&self, entry: &AuditEntry) -> bool {
        self.since.map_or(true, |t| entry.timestamp >= t)
            && self.until.map_or(true, |t| entry.timestamp <= t)
            && self.operation.as_ref().map_or(true, |op| *op == entry.operation)
            && self
                .key_id
                .as_ref()
                .map_or(true, |k| entry.key_id.as_deref() == Some(k.as_str()))
            && self.result.map_or(true, |r| r == entry.result)
    }
}

/// A sink that receives audit entries. Implement this to forward entries
/// to a file, database, SIEM or other persistent store.
pub trait AuditSink: Send {
    /// Append an entry. Called for every recorded operation.
    fn append(&mut self, entry: &AuditEntry) -> Result<()>;
}

/// An append-only log of audit entries.
/// Can forward entries to additional sinks via `add_forward_sink`.
#[derive(Default)]
pub struct AuditLog {
    entries: Vec<AuditEntry>,
    forward_sinks: Vec<Box<dyn AuditSink>>,
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("entries", &self.entries.len())
            .field("forward_sinks", &self.forward_sinks.len())
            .finish()
    }
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink to receive a copy of every entry.
    pub fn add_forward_sink(&mut self, sink: Box<dyn AuditSink>) {
        self.forward_sinks.push(sink);
    }

    /// Append an entry and forward it to every sink.
    ///
    /// The entry is always kept in memory. Sink failures are logged and
    /// returned as warnings; they never undo the append.
    pub fn append(&mut self, entry: AuditEntry) -> Vec<String> {
        let mut warnings = Vec::new();
        for sink in self.forward_sinks.iter_mut() {
            if let Err(e) = sink.append(&entry) {
                warn!(operation_id = %entry.operation_id, error = %e, "audit sink write failed");
                warnings.push(format!("audit sink write failed: {}", e));
            }
        }
        self.entries.push(entry);
        warnings
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, AuditEntry> {
        self.entries.iter()
    }

    /// Matching entries, newest last, truncated to `filter.limit` newest.
    pub fn query(&self, filter: &AuditFilter) -> (Vec<AuditEntry>, usize) {
        let matched: Vec<AuditEntry> = self
            .entries
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        let total = matched.len();
        let skip = filter.limit.map_or(0, |l| total.saturating_sub(l));
        (matched.into_iter().skip(skip).collect(), total)
    }

    /// Operation IDs of entries whose integrity check fails.
    pub fn verify_all(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| !e.verify_integrity())
            .map(|e| e.operation_id.clone())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Built-in sink: file
// ---------------------------------------------------------------------------

/// Writes audit entries as JSON lines to a file.
///
/// Optional size-based rotation keeps `max_files` older generations as
/// `path.1` (newest) to `path.N`. Optional encryption writes each line as
/// hex(`iv || ciphertext || tag`) under an AES-256-GCM log key.
pub struct FileAuditSink {
    path: PathBuf,
    file: File,
    written: u64,
    rotation: Option<(u64, usize)>,
    log_key: Option<Zeroizing<[u8; 32]>>,
    rng: SystemRandom,
}

impl FileAuditSink {
    /// Open or create a file for append-only audit logging.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            path,
            file,
            written,
            rotation: None,
            log_key: None,
            rng: SystemRandom::new(),
        })
    }

    /// Rotate once the file would exceed `max_size_bytes`, keeping
    /// `max_files` rotated generations.
    pub fn with_rotation(mut self, max_size_bytes: u64, max_files: usize) -> Self {
        self.rotation = Some((max_size_bytes, max_files));
        self
    }

    pub fn with_encryption(mut self, log_key: [u8; 32]) -> Self {
        self.log_key = Some(Zeroizing::new(log_key));
        self
    }

    fn rotated_path(&self, generation: usize) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(format!(".{}", generation));
        PathBuf::from(name)
    }

    fn rotate(&mut self, max_files: usize) -> Result<()> {
        self.file.flush()?;
        if max_files == 0 {
            fs::remove_file(&self.path)?;
        } else {
            let oldest = self.rotated_path(max_files);
            if oldest.exists() {
                fs::remove_file(&oldest)?;
            }
            for generation in (1..max_files).rev() {
                let from = self.rotated_path(generation);
                if from.exists() {
                    fs::rename(&from, self.rotated_path(generation + 1))?;
                }
            }
            fs::rename(&self.path, self.rotated_path(1))?;
        }
        self.file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.written = 0;
        Ok(())
    }

    fn encode_line(&self, entry: &AuditEntry) -> Result<String> {
        let json = serde_json::to_string(entry)?;
        let Some(key) = &self.log_key else {
            return Ok(json);
        };
        let mut iv = [0u8; NONCE_LEN];
        self.rng.fill(&mut iv).map_err(|_| HsmError::RandomnessFailure)?;
        let sealed = crypto::seal(AeadAlgorithm::Aes256Gcm, &key[..], &iv, b"audit-log", json.as_bytes())?;
        let mut out = Vec::with_capacity(NONCE_LEN + sealed.ciphertext.len() + TAG_LEN);
        out.extend_from_slice(&iv);
        out.extend_from_slice(&sealed.ciphertext);
        out.extend_from_slice(&sealed.tag);
        Ok(hex::encode(out))
    }
}

impl AuditSink for FileAuditSink {
    fn append(&mut self, entry: &AuditEntry) -> Result<()> {
        let line = self.encode_line(entry)?;
        let line_len = line.len() as u64 + 1;
        if let Some((max_size, max_files)) = self.rotation {
            if self.written > 0 && self.written + line_len > max_size {
                self.rotate(max_files)?;
            }
        }
        writeln!(self.file, "{line}")?;
        self.file.flush()?;
        self.written += line_len;
        Ok(())
    }
}

/// Decode one line written by an encrypting [`FileAuditSink`].
pub fn decrypt_log_line(log_key: &[u8; 32], line: &str) -> Result<AuditEntry> {
    let raw = hex::decode(line.trim()).map_err(|_| HsmError::DecryptionFailure)?;
    if raw.len() < NONCE_LEN + TAG_LEN {
        return Err(HsmError::DecryptionFailure);
    }
    let (iv, rest) = raw.split_at(NONCE_LEN);
    let (ciphertext, tag) = rest.split_at(rest.len() - TAG_LEN);
    let iv: [u8; NONCE_LEN] = iv.try_into().map_err(|_| HsmError::DecryptionFailure)?;
    let json = crypto::open(AeadAlgorithm::Aes256Gcm, log_key, &iv, b"audit-log", ciphertext, tag)?;
    Ok(serde_json::from_slice(&json)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(result: AuditOutcome) -> AuditEntry {
        AuditEntryBuilder::new("encrypt", result, Duration::from_micros(420), "symmetric", "certificate")
            .key_id("softhsm:aes-256-gcm:abc")
            .bytes_processed(16)
            .build()
            .unwrap()
    }

    #[test]
    fn test_optional_fields_omitted_when_absent() {
        let e = AuditEntryBuilder::new("list-keys", AuditOutcome::Success, Duration::ZERO, "administrative", "token")
            .build()
            .unwrap();
        let json = serde_json::to_value(&e).unwrap();
        for absent in ["keyId", "userId", "sourceIp", "additionalData"] {
            assert!(json.get(absent).is_none(), "{} should be absent", absent);
        }
        assert!(json["performanceMetrics"].get("bytesProcessed").is_none());
        assert!(json["securityContext"].get("sessionId").is_none());
        assert!(e.integrity_verified);
    }

    #[test]
    fn test_required_fields_enforced() {
        assert!(AuditEntryBuilder::new("", AuditOutcome::Success, Duration::ZERO, "x", "y")
            .build()
            .is_err());
    }

    #[test]
    fn test_query_filters_and_limit() {
        let mut log = AuditLog::new();
        log.append(entry(AuditOutcome::Success));
        log.append(entry(AuditOutcome::Failure));
        log.append(entry(AuditOutcome::Success));

        let (ok, total) = log.query(&AuditFilter {
            result: Some(AuditOutcome::Success),
            ..AuditFilter::default()
        });
        assert_eq!(total, 2);
        assert_eq!(ok.len(), 2);

        let (last, total) = log.query(&AuditFilter {
            limit: Some(1),
            ..AuditFilter::default()
        });
        assert_eq!(total, 3);
        assert_eq!(last[0].result, AuditOutcome::Success);
        assert!(log.verify_all().is_empty());
    }

    #[test]
    fn test_outcome_classification() {
        assert_eq!(AuditOutcome::of(&Ok::<(), HsmError>(())), AuditOutcome::Success);
        assert_eq!(
            AuditOutcome::of::<()>(&Err(HsmError::Validation("x".into()))),
            AuditOutcome::Failure
        );
        assert_eq!(
            AuditOutcome::of::<()>(&Err(HsmError::Unauthorized("x".into()))),
            AuditOutcome::Unauthorized
        );
        assert_eq!(
            AuditOutcome::of::<()>(&Err(HsmError::ClusterExhausted { service: "s".into() })),
            AuditOutcome::Error
        );
    }
}
