//! The facade callers use.
//!
//! [`HsmService`] resolves the active node through the [`ClusterManager`],
//! delegates to the [`VendorAdapter`], and records an [`AuditEntry`] for
//! every privileged operation it attempts. Algorithm allow-lists from the
//! profile are enforced here, before anything reaches a backend.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use moka::future::Cache;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapter::{
    AuditQueryResult, CryptoResult, DecryptParams, EncryptParams, ExportedKey, GenerateKeyParams,
    HealthStatus, ImportKeyParams, ImportMaterial, KeyList, KeyResult, OperationResult, SignParams,
    SignatureResult, VendorAdapter, VerificationResult, VerifyParams,
};
use crate::audit::{AuditEntry, AuditEntryBuilder, AuditFilter, AuditLog, AuditOutcome, AuditSink, FileAuditSink};
use crate::cluster::{Alert, ClusterManager, ClusterView};
use crate::config::{AuditLevel, HsmConfig};
use crate::connection::Connection;
use crate::error::{HsmError, Result};
use crate::keys::{KeyAlgorithm, KeyFilter, KeyMetadata, KeyType};

/// An operation's result plus the audit record it produced.
///
/// `audit` is `None` only when the entry could not be built. A failed audit write never replaces `value`; it shows
/// up in `audit_warning`.
#[derive(Debug)]
pub struct Audited<T> {
    pub value: Result<T>,
    pub audit: Option<AuditEntry>,
    pub audit_warning: Option<String>,
}

impl<T> Audited<T> {
    pub fn into_result(self) -> Result<T> {
        self.value
    }

    pub fn is_ok(&self) -> bool {
        self.value.is_ok()
    }
}

#[derive(Debug, Clone, Default)]
struct Caller {
    user_id: Option<String>,
    source_ip: Option<String>,
}

/// Bookkeeping for one in-flight facade call.
struct Scope {
    operation: &'static str,
    key_type: Option<KeyType>,
    algorithm: Option<String>,
    key_id: Option<String>,
    bytes: Option<u64>,
    started: Instant,
    session: Mutex<Option<String>>,
}

impl Scope {
    fn new(operation: &'static str) -> Self {
        Self {
            operation,
            key_type: None,
            algorithm: None,
            key_id: None,
            bytes: None,
            started: Instant::now(),
            session: Mutex::new(None),
        }
    }

    fn algorithm(mut self, name: &str) -> Self {
        self.key_type = KeyAlgorithm::parse(name).map(|a| a.key_type());
        self.algorithm = Some(name.to_string());
        self
    }

    fn key(mut self, key_id: &str) -> Self {
        self.key_id = Some(key_id.to_string());
        self
    }

    fn bytes(mut self, len: usize) -> Self {
        self.bytes = Some(len as u64);
        self
    }

    fn operation_type(&self) -> &'static str {
        match self.key_type {
            Some(KeyType::Symmetric) => "symmetric",
            Some(KeyType::Asymmetric) => "asymmetric",
            Some(KeyType::PostQuantum) => "post-quantum",
            None => "administrative",
        }
    }
}

pub struct HsmService {
    config: HsmConfig,
    cluster: Arc<ClusterManager>,
    audit: Mutex<AuditLog>,
    metadata_cache: Option<Cache<String, KeyMetadata>>,
    caller: Caller,
    monitors: Mutex<Option<(CancellationToken, Vec<JoinHandle<()>>)>>,
}

impl HsmService {
    pub fn new(config: HsmConfig, adapter: Arc<dyn VendorAdapter>) -> Result<Self> {
        if !config.vendor.eq_ignore_ascii_case(adapter.vendor()) {
            return Err(HsmError::Configuration(format!(
                "profile is for vendor {} but the adapter is {}",
                config.vendor,
                adapter.vendor()
            )));
        }
        let cluster = Arc::new(ClusterManager::from_config(adapter, &config)?);
        let caching = &config.performance.caching;
        let metadata_cache = caching.enabled.then(|| {
            Cache::builder()
                .time_to_live(Duration::from_secs(caching.ttl_seconds))
                .max_capacity(caching.max_entries)
                .build()
        });
        Ok(Self {
            config,
            cluster,
            audit: Mutex::new(AuditLog::new()),
            metadata_cache,
            caller: Caller::default(),
            monitors: Mutex::new(None),
        })
    }

    /// Attribute every audit entry from this service to a caller.
    pub fn with_caller(mut self, user_id: impl Into<String>, source_ip: Option<String>) -> Self {
        self.caller = Caller {
            user_id: Some(user_id.into()),
            source_ip,
        };
        self
    }

    pub fn config(&self) -> &HsmConfig {
        &self.config
    }

    pub fn cluster(&self) -> &Arc<ClusterManager> {
        &self.cluster
    }

    /// Forward a copy of every facade audit entry to `sink`.
    pub fn add_audit_sink(&self, sink: Box<dyn AuditSink>) {
        self.audit.lock().add_forward_sink(sink);
    }

    /// Attach a JSON-lines audit file rotated per the profile. A log key is
    /// required when the profile encrypts logs.
    pub fn add_file_audit_sink(&self, path: impl AsRef<Path>, log_key: Option<[u8; 32]>) -> Result<()> {
        let logging = &self.config.monitoring.logging;
        let mut sink = FileAuditSink::new(path)?
            .with_rotation(logging.log_rotation.max_size_bytes, logging.log_rotation.max_files);
        match (logging.encrypt_logs, log_key) {
            (true, Some(key)) => sink = sink.with_encryption(key),
            (true, None) => {
                return Err(HsmError::Configuration(
                    "encryptLogs is set but no log key was supplied".into(),
                ))
            }
            (false, Some(_)) => warn!("log key supplied but encryptLogs is off; writing plaintext"),
            (false, None) => {}
        }
        self.add_audit_sink(Box::new(sink));
        Ok(())
    }

    /// Connect the cluster and elect the active node.
    pub async fn start(&self) -> Result<()> {
        self.cluster.start().await?;
        info!(vendor = %self.config.vendor, mode = ?self.config.mode, "hsm service started");
        Ok(())
    }

    /// Start the background health and sync loops. Calling again is a no-op.
    pub fn spawn_monitors(&self) {
        let mut monitors = self.monitors.lock();
        if monitors.is_some() {
            return;
        }
        let token = CancellationToken::new();
        let handles = self.cluster.spawn_monitors(token.clone());
        *monitors = Some((token, handles));
    }

    /// Stop background loops and close every session.
    pub async fn shutdown(&self) {
        let monitors = self.monitors.lock().take();
        if let Some((token, handles)) = monitors {
            token.cancel();
            for handle in handles {
                if let Err(e) = handle.await {
                    debug!(error = %e, "monitor task ended abnormally");
                }
            }
        }
        self.cluster.disconnect_all().await;
        info!(vendor = %self.config.vendor, "hsm service stopped");
    }

    pub fn cluster_view(&self) -> ClusterView {
        self.cluster.view()
    }

    /// Run one health pass over the cluster now.
    pub async fn check_health(&self) -> Result<Vec<Alert>> {
        self.cluster.check_health().await
    }

    pub async fn health_check(&self) -> Result<HealthStatus> {
        self.cluster
            .execute("health-check", |adapter, conn| async move { adapter.health_check(&conn).await })
            .await
    }

    // -----------------------------------------------------------------------
    // Key lifecycle
    // -----------------------------------------------------------------------

    pub async fn generate_key(&self, params: &GenerateKeyParams) -> Audited<KeyResult> {
        let mut scope = Scope::new("generate-key").algorithm(&params.algorithm);
        let value = match self.permit(params.key_type, &params.algorithm) {
            Ok(()) => {
                self.call(&scope, |adapter, conn| async move { adapter.generate_key(&conn, params).await })
                    .await
            }
            Err(e) => Err(e),
        };
        if let Ok(key) = &value {
            scope.key_id = Some(key.key_id.clone());
            self.cache_metadata(&key.metadata).await;
        }
        self.finish(scope, value)
    }

    pub async fn import_key(&self, params: &ImportKeyParams) -> Audited<KeyResult> {
        let mut scope = Scope::new("import-key").algorithm(&params.algorithm);
        let value = match self.permit_import(params) {
            Ok(()) => {
                self.call(&scope, |adapter, conn| async move { adapter.import_key(&conn, params).await })
                    .await
            }
            Err(e) => Err(e),
        };
        if let Ok(key) = &value {
            scope.key_id = Some(key.key_id.clone());
            self.cache_metadata(&key.metadata).await;
        }
        self.finish(scope, value)
    }

    pub async fn export_key(&self, key_id: &str) -> Audited<ExportedKey> {
        let scope = Scope::new("export-key").key(key_id);
        let value = self
            .call(&scope, |adapter, conn| async move { adapter.export_key(&conn, key_id).await })
            .await;
        self.finish(scope, value)
    }

    pub async fn delete_key(&self, key_id: &str) -> Audited<OperationResult> {
        let scope = Scope::new("delete-key").key(key_id);
        let value = self
            .call(&scope, |adapter, conn| async move { adapter.delete_key(&conn, key_id).await })
            .await;
        if let Some(cache) = &self.metadata_cache {
            cache.invalidate(key_id).await;
        }
        self.finish(scope, value)
    }

    /// Served from the metadata cache when caching is enabled.
    pub async fn get_key_metadata(&self, key_id: &str) -> Audited<KeyMetadata> {
        let scope = Scope::new("get-key-metadata").key(key_id);
        if let Some(cached) = self.cached_metadata(key_id).await {
            return self.finish(scope, Ok(cached));
        }
        let value = self
            .call(&scope, |adapter, conn| async move { adapter.get_key_metadata(&conn, key_id).await })
            .await;
        if let Ok(meta) = &value {
            self.cache_metadata(meta).await;
        }
        self.finish(scope, value)
    }

    pub async fn list_keys(&self, filter: &KeyFilter) -> Audited<KeyList> {
        let scope = Scope::new("list-keys");
        let value = self
            .call(&scope, |adapter, conn| async move { adapter.list_keys(&conn, filter).await })
            .await;
        self.finish(scope, value)
    }

    // -----------------------------------------------------------------------
    // Cryptographic operations
    // -----------------------------------------------------------------------

    pub async fn encrypt(&self, params: &EncryptParams) -> Audited<CryptoResult> {
        let scope = Scope::new("encrypt")
            .algorithm(&params.algorithm)
            .key(&params.key_id)
            .bytes(params.data.len());
        let value = match self.permit_named(&params.algorithm) {
            Ok(_) => {
                self.call(&scope, |adapter, conn| async move { adapter.encrypt(&conn, params).await })
                    .await
            }
            Err(e) => Err(e),
        };
        self.finish(scope, value)
    }

    pub async fn decrypt(&self, params: &DecryptParams) -> Audited<CryptoResult> {
        let scope = Scope::new("decrypt")
            .algorithm(&params.algorithm)
            .key(&params.key_id)
            .bytes(params.ciphertext.len());
        let value = match self.permit_named(&params.algorithm) {
            Ok(_) => {
                self.call(&scope, |adapter, conn| async move { adapter.decrypt(&conn, params).await })
                    .await
            }
            Err(e) => Err(e),
        };
        self.finish(scope, value)
    }

    pub async fn sign(&self, params: &SignParams) -> Audited<SignatureResult> {
        let scope = Scope::new("sign")
            .algorithm(&params.algorithm)
            .key(&params.key_id)
            .bytes(params.data.len());
        let value = match self.permit_signing(&params.algorithm, params.hash_algorithm.as_deref()) {
            Ok(()) => {
                self.call(&scope, |adapter, conn| async move { adapter.sign(&conn, params).await })
                    .await
            }
            Err(e) => Err(e),
        };
        self.finish(scope, value)
    }

    pub async fn verify(&self, params: &VerifyParams) -> Audited<VerificationResult> {
        let scope = Scope::new("verify")
            .algorithm(&params.algorithm)
            .key(&params.key_id)
            .bytes(params.data.len());
        let value = match self.permit_signing(&params.algorithm, params.hash_algorithm.as_deref()) {
            Ok(()) => {
                self.call(&scope, |adapter, conn| async move { adapter.verify(&conn, params).await })
                    .await
            }
            Err(e) => Err(e),
        };
        self.finish(scope, value)
    }

    // -----------------------------------------------------------------------
    // Audit
    // -----------------------------------------------------------------------

    /// Entries the backend recorded on the active node.
    pub async fn get_audit_logs(&self, filter: &AuditFilter) -> Audited<AuditQueryResult> {
        let scope = Scope::new("get-audit-logs");
        let value = self
            .call(&scope, |adapter, conn| async move { adapter.get_audit_logs(&conn, filter).await })
            .await;
        self.finish(scope, value)
    }

    /// Entries this facade recorded.
    pub fn audit_trail(&self, filter: &AuditFilter) -> AuditQueryResult {
        let (entries, total) = self.audit.lock().query(filter);
        AuditQueryResult { entries, total }
    }

    /// Operation IDs of facade entries that fail their integrity check.
    pub fn verify_audit_trail(&self) -> Vec<String> {
        self.audit.lock().verify_all()
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn call<T, F, Fut>(&self, scope: &Scope, op: F) -> Result<T>
    where
        F: Fn(Arc<dyn VendorAdapter>, Connection) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.cluster
            .execute(scope.operation, |adapter, conn| {
                *scope.session.lock() = Some(conn.session_id.clone());
                op(adapter, conn)
            })
            .await
    }

    fn permit(&self, key_type: KeyType, algorithm: &str) -> Result<()> {
        let allowed = self.config.allowed_algorithms(key_type);
        if allowed.iter().any(|a| a.eq_ignore_ascii_case(algorithm)) {
            Ok(())
        } else {
            Err(HsmError::Validation(format!(
                "algorithm {} is not permitted for {:?} keys by this profile",
                algorithm, key_type
            )))
        }
    }

    fn permit_named(&self, algorithm: &str) -> Result<KeyAlgorithm> {
        let parsed = KeyAlgorithm::parse(algorithm)
            .ok_or_else(|| HsmError::Validation(format!("unsupported algorithm {}", algorithm)))?;
        self.permit(parsed.key_type(), algorithm)?;
        Ok(parsed)
    }

    /// Signing algorithm and its digest, requested or inherent, must both
    /// be on the profile's allow-lists.
    fn permit_signing(&self, algorithm: &str, hash_algorithm: Option<&str>) -> Result<()> {
        let parsed = self.permit_named(algorithm)?;
        let hash = hash_algorithm.unwrap_or_else(|| parsed.inherent_hash());
        if hash.is_empty() || self.config.algorithms.hashing.iter().any(|h| h.eq_ignore_ascii_case(hash)) {
            Ok(())
        } else {
            Err(HsmError::Validation(format!(
                "hash algorithm {} is not permitted by this profile",
                hash
            )))
        }
    }

    fn permit_import(&self, params: &ImportKeyParams) -> Result<()> {
        self.permit(params.key_type, &params.algorithm)?;
        if let ImportMaterial::Passphrase { kdf, .. } = &params.material {
            let name = kdf.algorithm.name();
            if !self
                .config
                .algorithms
                .key_derivation
                .iter()
                .any(|a| a.eq_ignore_ascii_case(name))
            {
                return Err(HsmError::Validation(format!(
                    "key derivation {} is not permitted by this profile",
                    name
                )));
            }
        }
        Ok(())
    }

    async fn cached_metadata(&self, key_id: &str) -> Option<KeyMetadata> {
        let cached = self.metadata_cache.as_ref()?.get(key_id).await?;
        if cached.is_expired(chrono::Utc::now()) {
            return None;
        }
        Some(cached)
    }

    async fn cache_metadata(&self, meta: &KeyMetadata) {
        if let Some(cache) = &self.metadata_cache {
            cache.insert(meta.key_id.clone(), meta.clone()).await;
        }
    }

    fn latency_target_ms(&self, key_type: Option<KeyType>) -> Option<f64> {
        let targets = &self.config.performance.performance_targets;
        match key_type? {
            KeyType::Symmetric => Some(targets.symmetric_latency_ms),
            KeyType::Asymmetric => Some(targets.asymmetric_latency_ms),
            KeyType::PostQuantum => Some(targets.post_quantum_latency_ms),
        }
    }

    /// Record the audit entry for a finished call.
    fn finish<T>(&self, scope: Scope, value: Result<T>) -> Audited<T> {
        let elapsed = scope.started.elapsed();
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        if let Some(target) = self.latency_target_ms(scope.key_type) {
            if value.is_ok() && elapsed_ms > target {
                warn!(
                    operation = scope.operation,
                    elapsed_ms,
                    target_ms = target,
                    "operation exceeded its latency target"
                );
            }
        }

        let outcome = AuditOutcome::of(&value);
        let level = self.config.monitoring.logging.audit_level;

        // Every operation is recorded; the level only controls detail.
        let mut builder = AuditEntryBuilder::new(
            scope.operation,
            outcome,
            elapsed,
            scope.operation_type(),
            self.config.authentication.auth_method.name(),
        );
        if let Some(key_id) = &scope.key_id {
            builder = builder.key_id(key_id.clone());
        }
        if let Some(session) = scope.session.lock().take() {
            builder = builder.session_id(session);
        }
        if level != AuditLevel::Minimal {
            if let Some(user_id) = &self.caller.user_id {
                builder = builder.user_id(user_id.clone());
            }
            if let Some(ip) = &self.caller.source_ip {
                builder = builder.source_ip(ip.clone());
            }
            if let Some(bytes) = scope.bytes {
                builder = builder.bytes_processed(bytes);
            }
        }
        if level == AuditLevel::Comprehensive {
            let mut data = serde_json::json!({
                "vendor": self.config.vendor,
                "mode": self.config.mode,
            });
            if let Some(alg) = &scope.algorithm {
                data["algorithm"] = serde_json::Value::from(alg.clone());
            }
            if let Err(e) = &value {
                data["error"] = serde_json::Value::from(e.to_string());
            }
            builder = builder.additional_data(data);
        }

        match builder.build() {
            Ok(entry) => {
                let warnings = self.audit.lock().append(entry.clone());
                Audited {
                    value,
                    audit: Some(entry),
                    audit_warning: (!warnings.is_empty()).then(|| warnings.join("; ")),
                }
            }
            Err(e) => {
                warn!(operation = scope.operation, error = %e, "audit entry could not be built");
                Audited {
                    value,
                    audit: None,
                    audit_warning: Some(format!("audit entry could not be built: {}", e)),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CryptoContext;
    use crate::keys::{KeyStore, KeyUsage};
    use crate::profiles::ConfigFactory;
    use crate::soft_hsm::{SoftHsmAdapter, SoftHsmFabric, VENDOR};

    async fn service(level: AuditLevel) -> HsmService {
        let fabric = Arc::new(SoftHsmFabric::new());
        fabric.add_node("solo", "softhsm://solo", Arc::new(KeyStore::new()));
        let adapter = Arc::new(SoftHsmAdapter::new(fabric, Arc::new(CryptoContext::new())));
        let mut cfg = ConfigFactory::new(VENDOR, "softhsm://solo", "svc").testing();
        cfg.monitoring.logging.audit_level = level;
        let svc = HsmService::new(cfg, adapter).unwrap().with_caller("alice", Some("10.0.0.7".into()));
        svc.start().await.unwrap();
        svc
    }

    #[tokio::test]
    async fn test_disallowed_algorithm_never_reaches_backend() {
        let mut svc = service(AuditLevel::Comprehensive).await;
        svc.config.algorithms.symmetric.retain(|a| a != "CHACHA20-POLY1305");
        let params = GenerateKeyParams::new(KeyType::Symmetric, "CHACHA20-POLY1305", vec![KeyUsage::Encrypt]);
        let out = svc.generate_key(&params).await;
        assert!(matches!(out.value, Err(HsmError::Validation(_))));
        assert_eq!(out.audit.unwrap().result, AuditOutcome::Failure);
        // Rejected before dispatch, so no session was touched.
        assert!(svc.audit_trail(&AuditFilter::default()).entries[0]
            .security_context
            .session_id
            .is_none());
    }

    #[tokio::test]
    async fn test_signing_digest_must_be_on_hashing_allow_list() {
        let mut svc = service(AuditLevel::Standard).await;
        let ed = GenerateKeyParams::new(KeyType::Asymmetric, "ED25519", vec![KeyUsage::Sign, KeyUsage::Verify]);
        let key = svc.generate_key(&ed).await.into_result().unwrap();
        svc.config.algorithms.hashing.retain(|h| h != "SHA-512");

        let sign = SignParams {
            key_id: key.key_id.clone(),
            algorithm: "ED25519".into(),
            data: b"payload".to_vec(),
            hash_algorithm: None,
        };
        assert!(matches!(svc.sign(&sign).await.value, Err(HsmError::Validation(_))));
        let verify = VerifyParams {
            key_id: key.key_id,
            algorithm: "ED25519".into(),
            data: b"payload".to_vec(),
            signature: vec![0; 64],
            hash_algorithm: None,
        };
        assert!(matches!(svc.verify(&verify).await.value, Err(HsmError::Validation(_))));

        // SHA-256 is still allowed, so HMAC-SHA256 signs.
        let mac = GenerateKeyParams::new(KeyType::Symmetric, "HMAC-SHA256", vec![KeyUsage::Sign, KeyUsage::Verify]);
        let mac_key = svc.generate_key(&mac).await.into_result().unwrap();
        let signed = svc
            .sign(&SignParams {
                key_id: mac_key.key_id,
                algorithm: "HMAC-SHA256".into(),
                data: b"payload".to_vec(),
                hash_algorithm: None,
            })
            .await;
        assert!(signed.is_ok());
    }

    #[tokio::test]
    async fn test_minimal_level_still_records_every_operation() {
        let svc = service(AuditLevel::Minimal).await;
        let params = GenerateKeyParams::new(KeyType::Symmetric, "AES-256-GCM", vec![KeyUsage::Encrypt]);
        let ok = svc.generate_key(&params).await;
        let key_id = ok.value.as_ref().unwrap().key_id.clone();
        let entry = ok.audit.unwrap();
        assert_eq!(entry.result, AuditOutcome::Success);
        assert_eq!(entry.key_id.as_deref(), Some(key_id.as_str()));
        assert!(entry.user_id.is_none());
        assert!(entry.source_ip.is_none());
        assert!(entry.additional_data.is_none());
        assert!(entry.integrity_verified);

        let missing = svc.export_key("softhsm:aes-256-gcm:absent").await;
        assert!(missing.value.is_err());
        assert!(missing.audit.is_some());
        assert_eq!(svc.audit_trail(&AuditFilter::default()).total, 2);
    }

    #[tokio::test]
    async fn test_standard_level_omits_additional_data() {
        let svc = service(AuditLevel::Standard).await;
        let params = GenerateKeyParams::new(KeyType::Symmetric, "AES-256-GCM", vec![KeyUsage::Encrypt]);
        let entry = svc.generate_key(&params).await.audit.unwrap();
        assert!(entry.additional_data.is_none());
        assert_eq!(entry.user_id.as_deref(), Some("alice"));
        assert!(entry.security_context.session_id.is_some());
    }

    #[tokio::test]
    async fn test_metadata_cache_invalidated_on_delete() {
        let svc = service(AuditLevel::Comprehensive).await;
        let params = GenerateKeyParams::new(KeyType::Symmetric, "AES-256-GCM", vec![KeyUsage::Encrypt]);
        let key = svc.generate_key(&params).await.into_result().unwrap();
        assert!(svc.get_key_metadata(&key.key_id).await.is_ok());

        assert!(svc.delete_key(&key.key_id).await.into_result().unwrap().success);
        assert!(matches!(
            svc.get_key_metadata(&key.key_id).await.value,
            Err(HsmError::KeyNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_vendor_mismatch_rejected() {
        let fabric = Arc::new(SoftHsmFabric::new());
        let adapter = Arc::new(SoftHsmAdapter::new(fabric, Arc::new(CryptoContext::new())));
        let cfg = ConfigFactory::new("thales-luna", "luna://a", "svc").testing();
        assert!(matches!(
            HsmService::new(cfg, adapter),
            Err(HsmError::Configuration(_))
        ));
    }
}
