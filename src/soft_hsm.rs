//! Software HSM backend family.
//!
//! A [`SoftHsmFabric`] is the set of reachable backend nodes, addressed by
//! endpoint. Each [`SoftHsmNode`] holds a key partition (shared by the nodes
//! of one cluster), its sessions, a rolling window of operation outcomes and
//! its own audit trail. [`SoftHsmAdapter`] implements the vendor contract on
//! top of the fabric using the crate's primitives.
//!
//! Nodes can be taken offline or told to fail their next operations, which
//! is how failover behaviour is exercised without real hardware.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::adapter::{
    self, classify_health, AuditQueryResult, CryptoMetadata, CryptoResult, DecryptParams,
    EncryptParams, ExportedKey, GenerateKeyParams, HealthStatus, ImportKeyParams, ImportMaterial,
    KeyList, KeyResult, OperationResult, SignParams, SignatureResult, VendorAdapter,
    VerificationResult, VerifyParams,
};
use crate::audit::{AuditEntryBuilder, AuditFilter, AuditLog, AuditOutcome};
use crate::config::AuthMethod;
use crate::connection::{self, Connection, ConnectionConfig, ConnectionStatus};
use crate::context::{constant_time_eq, CryptoContext};
use crate::crypto::{self, NONCE_LEN};
use crate::error::{HsmError, Result};
use crate::keys::{
    KeyAlgorithm, KeyFilter, KeyMaterial, KeyMetadata, KeyStore, KeyType, KeyUsage, StoredKey,
};
use crate::lamport::{self, LamportPrivateKey};
use crate::random::RandomSource;

pub const VENDOR: &str = "softhsm";

/// Outcomes remembered per node for error rate and throughput.
const TELEMETRY_WINDOW: usize = 100;

/// Outcomes older than this no longer count toward the error rate.
const ERROR_RATE_HORIZON: Duration = Duration::from_secs(60);

/// Metadata records re-verified by each health self-test.
const SELF_TEST_SAMPLE: usize = 16;

const SHA3_256_ABC: &str = "3a985da74fe225b2045c172d6bd390bd855f086e3e9d525b46bfe24511431532";

const KEY_ID_ATTEMPTS: usize = 8;

const OPERATIONS: [&str; 14] = [
    "connect",
    "disconnect",
    "health-check",
    "generate-key",
    "import-key",
    "export-key",
    "delete-key",
    "encrypt",
    "decrypt",
    "sign",
    "verify",
    "get-key-metadata",
    "list-keys",
    "get-audit-logs",
];

struct Session {
    auth_method: AuthMethod,
    random_source: RandomSource,
    integrity_checks: bool,
    timeout: Duration,
    last_activity: Instant,
}

/// What an operation needs to know about the session it runs in.
#[derive(Clone)]
struct SessionView {
    session_id: String,
    auth_method: AuthMethod,
    random_source: RandomSource,
    integrity_checks: bool,
}

struct Telemetry {
    outcomes: VecDeque<(Instant, bool)>,
    horizon: Duration,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self {
            outcomes: VecDeque::with_capacity(TELEMETRY_WINDOW),
            horizon: ERROR_RATE_HORIZON,
        }
    }
}

impl Telemetry {
    fn record(&mut self, ok: bool) {
        if self.outcomes.len() == TELEMETRY_WINDOW {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back((Instant::now(), ok));
    }

    fn recent(&self) -> impl Iterator<Item = &(Instant, bool)> {
        self.outcomes.iter().filter(move |(at, _)| at.elapsed() <= self.horizon)
    }

    fn error_rate(&self) -> f64 {
        let (total, failed) = self
            .recent()
            .fold((0usize, 0usize), |(total, failed), (_, ok)| (total + 1, failed + usize::from(!ok)));
        if total == 0 {
            return 0.0;
        }
        failed as f64 / total as f64
    }

    /// Operations per second across the recent window, measured up to now.
    fn throughput(&self) -> f64 {
        let mut recent = self.recent();
        match recent.next() {
            None => 0.0,
            Some((first, _)) => {
                let span = first.elapsed().as_secs_f64().max(1.0);
                (recent.count() + 1) as f64 / span
            }
        }
    }
}

/// Whether a backend-side failure says something about the node's health.
/// Policy refusals and caller mistakes do not.
fn counts_against_node(err: &HsmError) -> bool {
    matches!(
        err,
        HsmError::VendorOperation { .. }
            | HsmError::Connection { .. }
            | HsmError::Timeout { .. }
            | HsmError::EncryptionFailure
            | HsmError::RandomnessFailure
            | HsmError::Io(_)
    )
}

/// One backend node.
pub struct SoftHsmNode {
    node_id: String,
    endpoint: String,
    keys: Arc<KeyStore>,
    credential: Option<Zeroizing<String>>,
    sessions: Mutex<HashMap<String, Session>>,
    telemetry: Mutex<Telemetry>,
    audit: Mutex<AuditLog>,
    offline: AtomicBool,
    pending_faults: AtomicU32,
    health_delay_ms: AtomicU64,
}

impl std::fmt::Debug for SoftHsmNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftHsmNode")
            .field("node_id", &self.node_id)
            .field("endpoint", &self.endpoint)
            .field("keys", &self.keys.len())
            .field("offline", &self.is_offline())
            .finish()
    }
}

impl SoftHsmNode {
    pub fn new(node_id: impl Into<String>, endpoint: impl Into<String>, keys: Arc<KeyStore>) -> Self {
        Self {
            node_id: node_id.into(),
            endpoint: endpoint.into(),
            keys,
            credential: None,
            sessions: Mutex::new(HashMap::new()),
            telemetry: Mutex::new(Telemetry::default()),
            audit: Mutex::new(AuditLog::new()),
            offline: AtomicBool::new(false),
            pending_faults: AtomicU32::new(0),
            health_delay_ms: AtomicU64::new(0),
        }
    }

    /// Require a password or token on connect.
    pub fn require_credential(mut self, secret: impl Into<String>) -> Self {
        self.credential = Some(Zeroizing::new(secret.into()));
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn keys(&self) -> &Arc<KeyStore> {
        &self.keys
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
        info!(node_id = %self.node_id, offline, "node availability changed");
    }

    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    /// Fail the next `count` key or crypto operations with a retryable
    /// vendor error.
    pub fn inject_failures(&self, count: u32) {
        self.pending_faults.fetch_add(count, Ordering::SeqCst);
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn error_rate(&self) -> f64 {
        self.telemetry.lock().error_rate()
    }

    /// How long an outcome keeps counting toward the error rate.
    pub fn set_error_horizon(&self, horizon: Duration) {
        self.telemetry.lock().horizon = horizon;
    }

    /// Stall every health check on this node by `delay`.
    pub fn set_health_delay(&self, delay: Duration) {
        let ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.health_delay_ms.store(ms, Ordering::SeqCst);
    }

    fn health_delay(&self) -> Duration {
        Duration::from_millis(self.health_delay_ms.load(Ordering::SeqCst))
    }

    /// Query this node's own audit trail.
    pub fn audit_entries(&self, filter: &AuditFilter) -> AuditQueryResult {
        let (entries, total) = self.audit.lock().query(filter);
        AuditQueryResult { entries, total }
    }

    fn unreachable(&self) -> HsmError {
        HsmError::Connection {
            vendor: VENDOR.to_string(),
            reason: format!("node {} at {} is unreachable", self.node_id, self.endpoint),
        }
    }

    fn take_fault(&self, operation: &str) -> Result<()> {
        let armed = self
            .pending_faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if armed {
            return Err(HsmError::vendor_op(
                VENDOR,
                operation,
                format!("device fault on node {}", self.node_id),
                true,
            ));
        }
        Ok(())
    }

    /// Look up and refresh the session behind `conn`.
    fn session(&self, conn: &Connection) -> Result<SessionView> {
        let mut sessions = self.sessions.lock();
        match sessions.get_mut(&conn.session_id) {
            Some(s) if s.last_activity.elapsed() <= s.timeout => {
                s.last_activity = Instant::now();
                return Ok(SessionView {
                    session_id: conn.session_id.clone(),
                    auth_method: s.auth_method,
                    random_source: s.random_source,
                    integrity_checks: s.integrity_checks,
                });
            }
            Some(_) => {
                sessions.remove(&conn.session_id);
                debug!(node_id = %self.node_id, session_id = %conn.session_id, "session expired");
            }
            None => {}
        }
        Err(HsmError::NotConnected {
            connection_id: conn.connection_id.clone(),
        })
    }

    fn record<T>(
        &self,
        session: &SessionView,
        rec: &OpRecord,
        key_id: Option<&str>,
        result: &Result<T>,
        started: Instant,
    ) {
        // Session setup and teardown are not workload.
        if rec.kind != "session" {
            match result {
                Ok(_) => self.telemetry.lock().record(true),
                Err(e) if counts_against_node(e) => self.telemetry.lock().record(false),
                Err(_) => {}
            }
        }

        let mut builder = AuditEntryBuilder::new(
            rec.operation,
            AuditOutcome::of(result),
            started.elapsed(),
            rec.kind,
            session.auth_method.name(),
        )
        .session_id(session.session_id.clone());
        if let Some(k) = key_id {
            builder = builder.key_id(k);
        }
        if let Some(b) = rec.bytes {
            builder = builder.bytes_processed(b as u64);
        }
        if let Err(e) = result {
            builder = builder.additional_data(serde_json::json!({
                "node": self.node_id,
                "error": e.to_string(),
            }));
        }
        match builder.build() {
            Ok(entry) => {
                self.audit.lock().append(entry);
            }
            Err(e) => warn!(node_id = %self.node_id, error = %e, "could not build vendor audit entry"),
        }
    }
}

struct OpRecord {
    operation: &'static str,
    kind: &'static str,
    key_id: Option<String>,
    bytes: Option<usize>,
}

impl OpRecord {
    fn new(operation: &'static str, kind: &'static str) -> Self {
        Self {
            operation,
            kind,
            key_id: None,
            bytes: None,
        }
    }

    fn key(mut self, key_id: &str) -> Self {
        self.key_id = Some(key_id.to_string());
        self
    }

    fn bytes(mut self, bytes: usize) -> Self {
        self.bytes = Some(bytes);
        self
    }
}

fn kind_of(alg: KeyAlgorithm) -> &'static str {
    match alg.key_type() {
        KeyType::Symmetric => "symmetric",
        KeyType::Asymmetric => "asymmetric",
        KeyType::PostQuantum => "post-quantum",
    }
}

/// The set of reachable nodes, by endpoint.
#[derive(Default)]
pub struct SoftHsmFabric {
    nodes: RwLock<HashMap<String, Arc<SoftHsmNode>>>,
}

impl SoftHsmFabric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, node: SoftHsmNode) -> Arc<SoftHsmNode> {
        let node = Arc::new(node);
        self.nodes
            .write()
            .insert(node.endpoint.clone(), Arc::clone(&node));
        node
    }

    /// Add a node without credentials.
    pub fn add_node(
        &self,
        node_id: impl Into<String>,
        endpoint: impl Into<String>,
        keys: Arc<KeyStore>,
    ) -> Arc<SoftHsmNode> {
        self.add(SoftHsmNode::new(node_id, endpoint, keys))
    }

    pub fn node(&self, endpoint: &str) -> Option<Arc<SoftHsmNode>> {
        self.nodes.read().get(endpoint).cloned()
    }
}

/// The vendor contract implemented over a [`SoftHsmFabric`].
pub struct SoftHsmAdapter {
    fabric: Arc<SoftHsmFabric>,
    ctx: Arc<CryptoContext>,
}

impl SoftHsmAdapter {
    pub fn new(fabric: Arc<SoftHsmFabric>, ctx: Arc<CryptoContext>) -> Self {
        Self { fabric, ctx }
    }

    pub fn capabilities() -> Vec<String> {
        KeyAlgorithm::ALL
            .iter()
            .map(|a| a.name().to_string())
            .chain(OPERATIONS.iter().map(|op| op.to_string()))
            .collect()
    }

    /// Resolve the node and session behind a live connection.
    fn begin(&self, conn: &Connection) -> Result<(Arc<SoftHsmNode>, SessionView)> {
        adapter::ensure_connected(conn)?;
        let node = self
            .fabric
            .node(&conn.endpoint)
            .ok_or_else(|| HsmError::NotConnected {
                connection_id: conn.connection_id.clone(),
            })?;
        if node.is_offline() {
            return Err(node.unreachable());
        }
        let session = node.session(conn)?;
        Ok((node, session))
    }

    fn perform<T>(
        &self,
        conn: &Connection,
        rec: OpRecord,
        f: impl FnOnce(&SoftHsmNode, &SessionView) -> Result<T>,
    ) -> Result<T> {
        self.perform_keyed(conn, rec, |_| None, f)
    }

    /// Run one backend operation with telemetry and vendor-side audit.
    /// `key_of` names the key an operation created when the request did not.
    fn perform_keyed<T>(
        &self,
        conn: &Connection,
        rec: OpRecord,
        key_of: impl FnOnce(&T) -> Option<String>,
        f: impl FnOnce(&SoftHsmNode, &SessionView) -> Result<T>,
    ) -> Result<T> {
        let (node, session) = self.begin(conn)?;
        let started = Instant::now();
        let result = node.take_fault(rec.operation).and_then(|_| f(&*node, &session));

        let created = match (&rec.key_id, &result) {
            (None, Ok(v)) => key_of(v),
            _ => None,
        };
        let key_id = rec.key_id.as_deref().or(created.as_deref());
        node.record(&session, &rec, key_id, &result, started);
        if let Err(e) = &result {
            debug!(node_id = %node.node_id, operation = rec.operation, error = %e, "backend operation failed");
        }
        result
    }

    /// Known-answer hash, a read of the key partition and an AEAD round
    /// trip. Any mismatch fails the health check.
    fn self_test(&self, node: &SoftHsmNode, session: &SessionView) -> Result<()> {
        let failed = |what: String| {
            warn!(node_id = %node.node_id, check = %what, "self-test failed");
            HsmError::vendor_op(VENDOR, "health-check", format!("self-test failed on node {}: {}", node.node_id, what), false)
        };

        if hex::encode(crate::hash::sha3_256(b"abc")) != SHA3_256_ABC {
            return Err(failed("hash known answer".into()));
        }

        let (sample, _) = node.keys.list(&KeyFilter {
            include_expired: true,
            limit: Some(SELF_TEST_SAMPLE),
            ..KeyFilter::default()
        });
        if session.integrity_checks {
            if let Some(bad) = sample.iter().find(|m| !m.verify_integrity()) {
                return Err(failed(format!("key {} failed its integrity check", bad.key_id)));
            }
        }

        let key = self.random(session, 32)?;
        let iv = iv_array(&self.ctx.generate_nonce(NONCE_LEN)?)?;
        let plaintext = self_test_block(&node.node_id);
        let sealed = crypto::seal(crypto::AeadAlgorithm::Aes256Gcm, &key, &iv, b"health-check", &plaintext)
            .map_err(|e| failed(format!("seal: {}", e)))?;
        let opened = crypto::open(
            crypto::AeadAlgorithm::Aes256Gcm,
            &key,
            &iv,
            b"health-check",
            &sealed.ciphertext,
            &sealed.tag,
        )
        .map_err(|e| failed(format!("open: {}", e)))?;
        if !constant_time_eq(&opened, &plaintext) {
            return Err(failed("AEAD round trip mismatch".into()));
        }
        Ok(())
    }

    fn random(&self, session: &SessionView, len: usize) -> Result<Zeroizing<Vec<u8>>> {
        Ok(Zeroizing::new(self.ctx.secure_random_from(
            len,
            session.random_source,
            None,
        )?))
    }

    fn new_material(
        &self,
        session: &SessionView,
        alg: KeyAlgorithm,
        key_size: u32,
    ) -> Result<(KeyMaterial, Option<Vec<u8>>)> {
        if let Some(aead) = alg.aead() {
            return Ok((KeyMaterial::Secret(self.random(session, aead.key_len())?), None));
        }
        match alg {
            KeyAlgorithm::HmacSha256 | KeyAlgorithm::HmacSha512 => Ok((
                KeyMaterial::Secret(self.random(session, (key_size / 8) as usize)?),
                None,
            )),
            KeyAlgorithm::Ed25519 => {
                let seed = self.random(session, crypto::ED25519_SEED_LEN)?;
                let public = crypto::ed25519_public_key(&seed)?;
                Ok((KeyMaterial::Secret(seed), Some(public)))
            }
            KeyAlgorithm::EcdsaP256Sha256 => {
                let pkcs8 = crypto::ecdsa_p256_generate()?;
                let public = crypto::ecdsa_p256_public_key(&pkcs8)?;
                Ok((KeyMaterial::Pkcs8(pkcs8), Some(public)))
            }
            KeyAlgorithm::LamportSha3_256 => {
                let secrets = self.random(session, lamport::PRIVATE_KEY_LEN)?;
                let key = LamportPrivateKey::from_bytes(secrets)?;
                let public = key.public_key();
                Ok((KeyMaterial::Lamport(key), Some(public)))
            }
            _ => Err(HsmError::Validation(format!("cannot generate {}", alg.name()))),
        }
    }

    fn imported_material(
        &self,
        alg: KeyAlgorithm,
        material: &ImportMaterial,
    ) -> Result<(KeyMaterial, Option<Vec<u8>>, u32)> {
        let symmetric_len = match (alg.aead(), alg.mac()) {
            (Some(aead), _) => Some(aead.key_len()),
            (None, Some(_)) => None,
            _ => Some(0),
        };
        match (alg, material) {
            (KeyAlgorithm::EcdsaP256Sha256, ImportMaterial::Pkcs8(doc)) => {
                let public = crypto::ecdsa_p256_public_key(doc)
                    .map_err(|_| HsmError::Validation("not a P-256 PKCS#8 key".into()))?;
                Ok((KeyMaterial::Pkcs8(doc.clone()), Some(public), alg.default_key_size()))
            }
            (KeyAlgorithm::EcdsaP256Sha256, _) => Err(HsmError::Validation(
                "ECDSA keys are imported as PKCS#8".into(),
            )),
            (_, ImportMaterial::Pkcs8(_)) => Err(HsmError::Validation(format!(
                "{} keys cannot be imported as PKCS#8",
                alg.name()
            ))),
            (KeyAlgorithm::Ed25519, ImportMaterial::Raw(seed)) => {
                if seed.len() != crypto::ED25519_SEED_LEN {
                    return Err(HsmError::Validation("Ed25519 seeds are 32 bytes".into()));
                }
                let public = crypto::ed25519_public_key(seed)?;
                Ok((KeyMaterial::Secret(seed.clone()), Some(public), alg.default_key_size()))
            }
            (KeyAlgorithm::LamportSha3_256, ImportMaterial::Raw(secrets)) => {
                let key = LamportPrivateKey::from_bytes(secrets.clone())
                    .map_err(|_| HsmError::Validation("wrong Lamport key length".into()))?;
                let public = key.public_key();
                Ok((KeyMaterial::Lamport(key), Some(public), alg.default_key_size()))
            }
            (_, ImportMaterial::Raw(bytes)) => {
                let bits = (bytes.len() * 8) as u32;
                let fits = match symmetric_len {
                    Some(len) => bytes.len() == len,
                    None => alg.accepts_key_size(bits),
                };
                if !fits {
                    return Err(HsmError::Validation(format!(
                        "{} bytes is not a valid {} key",
                        bytes.len(),
                        alg.name()
                    )));
                }
                Ok((KeyMaterial::Secret(bytes.clone()), None, bits))
            }
            (_, ImportMaterial::Passphrase { secret, salt, kdf }) => {
                if alg.key_type() != KeyType::Symmetric {
                    return Err(HsmError::Validation(format!(
                        "{} keys cannot be derived from a passphrase",
                        alg.name()
                    )));
                }
                let len = symmetric_len.unwrap_or((alg.default_key_size() / 8) as usize);
                let params = crate::kdf::KdfParams {
                    output_len: len,
                    ..*kdf
                };
                let derived = self.ctx.derive_key(secret, salt, &params)?;
                Ok((KeyMaterial::Secret(derived.key), None, (len * 8) as u32))
            }
        }
    }

    /// Store a new key under a fresh, unique ID.
    #[allow(clippy::too_many_arguments)]
    fn store_key(
        &self,
        keys: &KeyStore,
        alg: KeyAlgorithm,
        key_size: u32,
        usage: &[KeyUsage],
        exportable: bool,
        expires_at: Option<chrono::DateTime<Utc>>,
        material: KeyMaterial,
        public_key: Option<Vec<u8>>,
    ) -> Result<KeyResult> {
        let mut usage = usage.to_vec();
        usage.sort();
        usage.dedup();

        let mut metadata = KeyMetadata {
            key_id: String::new(),
            vendor: VENDOR.to_string(),
            key_type: alg.key_type(),
            algorithm: alg.name().to_string(),
            key_size,
            usage,
            exportable,
            created_at: Utc::now(),
            expires_at,
            public_key: public_key.as_ref().map(hex::encode),
            integrity_hash: String::new(),
        };
        let mut stored = StoredKey::new(metadata.clone(), material);

        for _ in 0..KEY_ID_ATTEMPTS {
            metadata.key_id = format!(
                "{}:{}:{}",
                VENDOR,
                alg.name().to_ascii_lowercase(),
                Uuid::new_v4().simple()
            );
            metadata.integrity_hash = metadata.compute_integrity_hash()?;
            stored.metadata = metadata.clone();
            match keys.insert_unique(stored) {
                Ok(()) => {
                    return Ok(KeyResult {
                        key_id: metadata.key_id.clone(),
                        public_key,
                        metadata,
                    })
                }
                Err(back) => {
                    warn!(key_id = %metadata.key_id, "key ID collision, regenerating");
                    stored = back;
                }
            }
        }
        Err(HsmError::vendor_op(
            VENDOR,
            "generate-key",
            "could not allocate a unique key ID",
            true,
        ))
    }
}

/// Checks every crypto operation applies to the key it names.
fn authorize(meta: &KeyMetadata, requested: KeyAlgorithm, usage: KeyUsage) -> Result<()> {
    if meta.parsed_algorithm()? != requested {
        return Err(HsmError::Validation(format!(
            "key {} is {}, not {}",
            meta.key_id,
            meta.algorithm,
            requested.name()
        )));
    }
    if meta.is_expired(Utc::now()) {
        return Err(HsmError::Unauthorized(format!("key {} has expired", meta.key_id)));
    }
    if !meta.allows(usage) {
        return Err(HsmError::Unauthorized(format!(
            "key {} does not permit {:?}",
            meta.key_id, usage
        )));
    }
    Ok(())
}

fn decode_public(meta: &KeyMetadata) -> Result<Vec<u8>> {
    let hexed = meta.public_key.as_deref().ok_or_else(|| {
        HsmError::vendor_op(VENDOR, "verify", format!("key {} has no public key", meta.key_id), false)
    })?;
    hex::decode(hexed).map_err(|_| {
        HsmError::vendor_op(VENDOR, "verify", format!("key {} has a corrupt public key", meta.key_id), false)
    })
}

/// Plaintext sealed by the health self-test.
fn self_test_block(node_id: &str) -> Vec<u8> {
    crate::hash::sha3_256(node_id.as_bytes()).to_vec()
}

fn iv_array(iv: &[u8]) -> Result<[u8; NONCE_LEN]> {
    iv.try_into()
        .map_err(|_| HsmError::Validation(format!("IV must be {} bytes", NONCE_LEN)))
}

#[async_trait]
impl VendorAdapter for SoftHsmAdapter {
    fn vendor(&self) -> &str {
        VENDOR
    }

    async fn connect(&self, config: &ConnectionConfig) -> Result<Connection> {
        if config.auth_method == AuthMethod::Certificate && config.validate_certificates {
            let paths = config.cert_paths.as_ref().ok_or_else(|| {
                HsmError::Authentication("certificate authentication requires certificate paths".into())
            })?;
            connection::validate_certificate_credentials(paths)?;
        }

        let node = self.fabric.node(&config.endpoint).ok_or_else(|| HsmError::Connection {
            vendor: VENDOR.to_string(),
            reason: format!("no node at {}", config.endpoint),
        })?;
        if node.is_offline() {
            return Err(node.unreachable());
        }

        if let Some(expected) = &node.credential {
            let presented_ok = match config.auth_method {
                AuthMethod::Password | AuthMethod::Token => config
                    .credentials
                    .as_ref()
                    .map_or(false, |c| constant_time_eq(c.as_bytes(), expected.as_bytes())),
                AuthMethod::Certificate => true,
                AuthMethod::Simulation => false,
            };
            if !presented_ok {
                return Err(HsmError::Authentication(format!(
                    "node {} rejected {} credentials for {}",
                    node.node_id,
                    config.auth_method.name(),
                    config.client_id
                )));
            }
        }

        let now = Utc::now();
        let conn = Connection {
            connection_id: Uuid::new_v4().to_string(),
            vendor_name: VENDOR.to_string(),
            endpoint: config.endpoint.clone(),
            session_id: Uuid::new_v4().simple().to_string(),
            auth_method: config.auth_method,
            status: ConnectionStatus::Connected,
            established_at: now,
            last_activity: now,
        };
        node.sessions.lock().insert(
            conn.session_id.clone(),
            Session {
                auth_method: config.auth_method,
                random_source: config.random_source,
                integrity_checks: config.integrity_checks,
                timeout: config.session_timeout,
                last_activity: Instant::now(),
            },
        );

        let view = SessionView {
            session_id: conn.session_id.clone(),
            auth_method: config.auth_method,
            random_source: config.random_source,
            integrity_checks: config.integrity_checks,
        };
        node.record(
            &view,
            &OpRecord::new("connect", "session"),
            None,
            &Ok::<(), HsmError>(()),
            Instant::now(),
        );
        info!(node_id = %node.node_id, connection_id = %conn.connection_id, "session established");
        Ok(conn)
    }

    async fn disconnect(&self, conn: &Connection) -> Result<()> {
        let Some(node) = self.fabric.node(&conn.endpoint) else {
            return Ok(());
        };
        let removed = node.sessions.lock().remove(&conn.session_id);
        if let Some(session) = removed {
            let view = SessionView {
                session_id: conn.session_id.clone(),
                auth_method: session.auth_method,
                random_source: session.random_source,
                integrity_checks: session.integrity_checks,
            };
            node.record(
                &view,
                &OpRecord::new("disconnect", "session"),
                None,
                &Ok::<(), HsmError>(()),
                Instant::now(),
            );
            debug!(node_id = %node.node_id, connection_id = %conn.connection_id, "session closed");
        }
        Ok(())
    }

    async fn health_check(&self, conn: &Connection) -> Result<HealthStatus> {
        let started = Instant::now();
        let (node, session) = self.begin(conn)?;
        let delay = node.health_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.self_test(&node, &session)?;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        let (error_rate, throughput_ops) = {
            let t = node.telemetry.lock();
            (t.error_rate(), t.throughput())
        };
        Ok(HealthStatus {
            status: classify_health(latency_ms, error_rate),
            capabilities: Self::capabilities(),
            latency_ms,
            throughput_ops,
            error_rate,
            checked_at: Utc::now(),
        })
    }

    async fn generate_key(&self, conn: &Connection, params: &GenerateKeyParams) -> Result<KeyResult> {
        adapter::ensure_connected(conn)?;
        let alg = adapter::validate_generate(params)?;
        let key_size = params.key_size.unwrap_or_else(|| alg.default_key_size());

        self.perform_keyed(
            conn,
            OpRecord::new("generate-key", kind_of(alg)),
            |r: &KeyResult| Some(r.key_id.clone()),
            |node, session| {
                let (material, public_key) = self.new_material(session, alg, key_size)?;
                let result = self.store_key(
                    &node.keys,
                    alg,
                    key_size,
                    &params.usage,
                    params.exportable,
                    params.expires_at,
                    material,
                    public_key,
                )?;
                info!(key_id = %result.key_id, algorithm = alg.name(), "key generated");
                Ok(result)
            },
        )
    }

    async fn import_key(&self, conn: &Connection, params: &ImportKeyParams) -> Result<KeyResult> {
        adapter::ensure_connected(conn)?;
        let alg = adapter::validate_import(params)?;

        self.perform_keyed(
            conn,
            OpRecord::new("import-key", kind_of(alg)),
            |r: &KeyResult| Some(r.key_id.clone()),
            |node, _session| {
                let (material, public_key, key_size) = self.imported_material(alg, &params.material)?;
                if let (KeyMaterial::Lamport(_), Some(public)) = (&material, &public_key) {
                    if node.keys.is_spent(public) {
                        return Err(HsmError::Unauthorized(
                            "one-time key material has already signed".into(),
                        ));
                    }
                }
                let result = self.store_key(
                    &node.keys,
                    alg,
                    key_size,
                    &params.usage,
                    params.exportable,
                    params.expires_at,
                    material,
                    public_key,
                )?;
                info!(key_id = %result.key_id, algorithm = alg.name(), "key imported");
                Ok(result)
            },
        )
    }

    async fn export_key(&self, conn: &Connection, key_id: &str) -> Result<ExportedKey> {
        adapter::ensure_connected(conn)?;
        adapter::validate_key_id(key_id)?;

        self.perform(conn, OpRecord::new("export-key", "key-management").key(key_id), |node, session| {
            node.keys.with_key(key_id, session.integrity_checks, |key| {
                let meta = &key.metadata;
                if !meta.exportable {
                    return Err(HsmError::Unauthorized(format!("key {} is not exportable", key_id)));
                }
                if meta.is_expired(Utc::now()) {
                    return Err(HsmError::Unauthorized(format!("key {} has expired", key_id)));
                }
                if matches!(key.material, KeyMaterial::Lamport(_)) {
                    return Err(HsmError::Unauthorized(format!(
                        "one-time signing key {} cannot be exported",
                        key_id
                    )));
                }
                let public_key = match &meta.public_key {
                    Some(_) => Some(decode_public(meta)?),
                    None => None,
                };
                warn!(key_id, "key material exported");
                Ok(ExportedKey {
                    key_id: key_id.to_string(),
                    algorithm: meta.algorithm.clone(),
                    material: Zeroizing::new(key.material.as_bytes().to_vec()),
                    public_key,
                })
            })
        })
    }

    async fn delete_key(&self, conn: &Connection, key_id: &str) -> Result<OperationResult> {
        adapter::ensure_connected(conn)?;
        adapter::validate_key_id(key_id)?;

        self.perform(conn, OpRecord::new("delete-key", "key-management").key(key_id), |node, _| {
            let existed = node.keys.remove(key_id);
            if existed {
                info!(key_id, "key deleted");
            }
            Ok(OperationResult {
                success: existed,
                key_id: key_id.to_string(),
                message: (!existed).then(|| format!("key {} not found", key_id)),
            })
        })
    }

    async fn encrypt(&self, conn: &Connection, params: &EncryptParams) -> Result<CryptoResult> {
        adapter::ensure_connected(conn)?;
        let alg = adapter::validate_encrypt(params)?;
        let rec = OpRecord::new("encrypt", kind_of(alg))
            .key(&params.key_id)
            .bytes(params.data.len());

        self.perform(conn, rec, |node, session| {
            let iv = match &params.iv {
                Some(iv) => iv_array(iv)?,
                None => iv_array(&self.ctx.generate_nonce(NONCE_LEN)?)?,
            };
            let aad = params.additional_data.as_deref().unwrap_or_default();
            node.keys.with_key(&params.key_id, session.integrity_checks, |key| {
                authorize(&key.metadata, alg, KeyUsage::Encrypt)?;
                let aead = alg
                    .aead()
                    .ok_or_else(|| HsmError::Validation(format!("{} cannot encrypt", alg.name())))?;
                let sealed = crypto::seal(aead, key.material.as_bytes(), &iv, aad, &params.data)?;
                Ok(CryptoResult {
                    key_id: params.key_id.clone(),
                    data: sealed.ciphertext,
                    metadata: CryptoMetadata {
                        algorithm: alg.name().to_string(),
                        iv: Some(iv.to_vec()),
                        tag: Some(sealed.tag.to_vec()),
                    },
                })
            })
        })
    }

    async fn decrypt(&self, conn: &Connection, params: &DecryptParams) -> Result<CryptoResult> {
        adapter::ensure_connected(conn)?;
        let alg = adapter::validate_decrypt(params)?;
        let rec = OpRecord::new("decrypt", kind_of(alg))
            .key(&params.key_id)
            .bytes(params.ciphertext.len());

        self.perform(conn, rec, |node, session| {
            let iv = iv_array(params.iv.as_deref().unwrap_or_default())?;
            let tag = params.tag.as_deref().unwrap_or_default();
            let aad = params.additional_data.as_deref().unwrap_or_default();
            node.keys.with_key(&params.key_id, session.integrity_checks, |key| {
                authorize(&key.metadata, alg, KeyUsage::Decrypt)?;
                let aead = alg
                    .aead()
                    .ok_or_else(|| HsmError::Validation(format!("{} cannot decrypt", alg.name())))?;
                let plaintext = crypto::open(aead, key.material.as_bytes(), &iv, aad, &params.ciphertext, tag)?;
                Ok(CryptoResult {
                    key_id: params.key_id.clone(),
                    data: plaintext.to_vec(),
                    metadata: CryptoMetadata {
                        algorithm: alg.name().to_string(),
                        iv: None,
                        tag: None,
                    },
                })
            })
        })
    }

    async fn sign(&self, conn: &Connection, params: &SignParams) -> Result<SignatureResult> {
        adapter::ensure_connected(conn)?;
        let alg = adapter::validate_sign(params)?;
        let rec = OpRecord::new("sign", kind_of(alg))
            .key(&params.key_id)
            .bytes(params.data.len());

        self.perform(conn, rec, |node, session| {
            node.keys.with_key_mut(&params.key_id, session.integrity_checks, |key| {
                authorize(&key.metadata, alg, KeyUsage::Sign)?;
                let signature = match (&key.material, alg) {
                    (KeyMaterial::Secret(k), KeyAlgorithm::HmacSha256 | KeyAlgorithm::HmacSha512) => {
                        let mac = alg.mac().ok_or(HsmError::InvalidKey)?;
                        crypto::hmac_sign(mac, k, &params.data)
                    }
                    (KeyMaterial::Secret(seed), KeyAlgorithm::Ed25519) => crypto::ed25519_sign(seed, &params.data)?,
                    (KeyMaterial::Pkcs8(doc), KeyAlgorithm::EcdsaP256Sha256) => {
                        crypto::ecdsa_p256_sign(doc, &params.data)?
                    }
                    (KeyMaterial::Lamport(lk), KeyAlgorithm::LamportSha3_256) => {
                        if key.signatures_issued > 0 || !node.keys.mark_spent(&lk.public_key()) {
                            return Err(HsmError::Unauthorized(format!(
                                "one-time key {} has already signed",
                                params.key_id
                            )));
                        }
                        lk.sign(&params.data)
                    }
                    _ => return Err(HsmError::InvalidKey),
                };
                key.signatures_issued += 1;
                Ok(SignatureResult {
                    key_id: params.key_id.clone(),
                    algorithm: alg.name().to_string(),
                    hash_algorithm: alg.inherent_hash().to_string(),
                    signature,
                })
            })
        })
    }

    async fn verify(&self, conn: &Connection, params: &VerifyParams) -> Result<VerificationResult> {
        adapter::ensure_connected(conn)?;
        let alg = adapter::validate_verify(params)?;
        let rec = OpRecord::new("verify", kind_of(alg))
            .key(&params.key_id)
            .bytes(params.data.len());

        self.perform(conn, rec, |node, session| {
            node.keys.with_key(&params.key_id, session.integrity_checks, |key| {
                authorize(&key.metadata, alg, KeyUsage::Verify)?;
                let valid = match alg {
                    KeyAlgorithm::HmacSha256 | KeyAlgorithm::HmacSha512 => {
                        let mac = alg.mac().ok_or(HsmError::InvalidKey)?;
                        crypto::hmac_verify(mac, key.material.as_bytes(), &params.data, &params.signature)
                    }
                    KeyAlgorithm::LamportSha3_256 => {
                        lamport::verify(&decode_public(&key.metadata)?, &params.data, &params.signature)
                    }
                    _ => {
                        let scheme = alg.signature_scheme().ok_or(HsmError::InvalidKey)?;
                        crypto::verify_signature(
                            scheme,
                            &decode_public(&key.metadata)?,
                            &params.data,
                            &params.signature,
                        )
                    }
                };
                Ok(VerificationResult { valid })
            })
        })
    }

    async fn get_key_metadata(&self, conn: &Connection, key_id: &str) -> Result<KeyMetadata> {
        adapter::ensure_connected(conn)?;
        adapter::validate_key_id(key_id)?;
        self.perform(conn, OpRecord::new("get-key-metadata", "key-management").key(key_id), |node, session| {
            node.keys.metadata(key_id, session.integrity_checks)
        })
    }

    async fn list_keys(&self, conn: &Connection, filter: &KeyFilter) -> Result<KeyList> {
        adapter::ensure_connected(conn)?;
        self.perform(conn, OpRecord::new("list-keys", "key-management"), |node, _| {
            let (keys, total) = node.keys.list(filter);
            Ok(KeyList { keys, total })
        })
    }

    async fn get_audit_logs(&self, conn: &Connection, filter: &AuditFilter) -> Result<AuditQueryResult> {
        let (node, _session) = self.begin(conn)?;
        Ok(node.audit_entries(filter))
    }
}
