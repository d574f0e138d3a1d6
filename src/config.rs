//! Configuration schema.
//!
//! One `HsmConfig` describes a deployment: backend, credentials, algorithm
//! allow-lists, performance envelope, monitoring, security flags and cluster
//! topology. Field names serialise in camelCase. Profiles for each
//! environment are built by [`crate::profiles::ConfigFactory`]; fitness for
//! production is judged by [`crate::validate::validate_production_config`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cluster::{ClusterNode, NodeHealth};
use crate::error::{HsmError, Result};
use crate::random::RandomSource;

pub const ENV_MODE: &str = "HSM_MODE";
pub const ENV_ENDPOINT: &str = "HSM_ENDPOINT";
pub const ENV_CLIENT_ID: &str = "HSM_CLIENT_ID";
pub const ENV_CERT_PATH: &str = "HSM_CERT_PATH";
pub const ENV_KEY_PATH: &str = "HSM_KEY_PATH";
pub const ENV_CA_PATH: &str = "HSM_CA_PATH";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Production,
    Development,
    Testing,
}

impl Mode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "production" | "prod" => Some(Self::Production),
            "development" | "dev" => Some(Self::Development),
            "testing" | "test" => Some(Self::Testing),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    Certificate,
    Password,
    Token,
    /// Accepted only by simulators; never valid in production.
    Simulation,
}

impl AuthMethod {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Certificate => "certificate",
            Self::Password => "password",
            Self::Token => "token",
            Self::Simulation => "simulation",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertPaths {
    pub client_cert: PathBuf,
    pub client_key: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ca_cert: Option<PathBuf>,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationConfig {
    pub client_id: String,
    pub auth_method: AuthMethod,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cert_paths: Option<CertPaths>,
    /// Idle session timeout in seconds.
    pub session_timeout: u64,
    /// Password or token for the matching auth methods. Never serialised.
    #[serde(skip_serializing, default)]
    pub credentials: Option<String>,
    #[serde(default = "default_true")]
    pub validate_certificates: bool,
}

impl std::fmt::Debug for AuthenticationConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthenticationConfig")
            .field("client_id", &self.client_id)
            .field("auth_method", &self.auth_method)
            .field("cert_paths", &self.cert_paths)
            .field("session_timeout", &self.session_timeout)
            .field("credentials", &self.credentials.as_ref().map(|_| "<redacted>"))
            .field("validate_certificates", &self.validate_certificates)
            .finish()
    }
}

fn default_true() -> bool {
    true
}

/// Algorithm allow-lists by family.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlgorithmConfig {
    pub symmetric: Vec<String>,
    pub asymmetric: Vec<String>,
    pub post_quantum: Vec<String>,
    pub hashing: Vec<String>,
    pub key_derivation: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceTargets {
    pub symmetric_latency_ms: f64,
    pub asymmetric_latency_ms: f64,
    pub post_quantum_latency_ms: f64,
    pub min_throughput_ops: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachingConfig {
    pub enabled: bool,
    pub ttl_seconds: u64,
    pub max_entries: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffConfig {
    pub strategy: BackoffStrategy,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base_delay_ms: 100,
            max_delay_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceConfig {
    pub max_concurrent_operations: usize,
    pub timeout_ms: u64,
    pub retry_attempts: u32,
    #[serde(default)]
    pub retry_backoff: BackoffConfig,
    pub connection_pool_size: usize,
    pub performance_targets: PerformanceTargets,
    pub caching: CachingConfig,
}

impl PerformanceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertThresholds {
    /// Fraction of failed operations, 0.0 to 1.0.
    pub error_rate: f64,
    pub latency_ms: f64,
    pub utilization_percent: f64,
    pub failure_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditLevel {
    /// Failures only.
    Minimal,
    /// Every operation, without additional data.
    Standard,
    /// Every operation with all context.
    Comprehensive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRotation {
    pub max_size_bytes: u64,
    pub max_files: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    pub audit_level: AuditLevel,
    pub log_rotation: LogRotation,
    pub encrypt_logs: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringConfig {
    pub health_check_interval_ms: u64,
    pub alert_thresholds: AlertThresholds,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum KeyEscrowPolicy {
    Disabled,
    DualControl,
    ThirdParty,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityConfig {
    pub enforce_hardware_rng: bool,
    pub key_escrow_policy: KeyEscrowPolicy,
    pub integrity_checks: bool,
    pub sidechannel_protection: bool,
    pub fips_compliance: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailoverStrategy {
    Priority,
    RoundRobin,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusteringConfig {
    pub enabled: bool,
    pub nodes: Vec<ClusterNode>,
    pub failover_strategy: FailoverStrategy,
    /// Cluster state synchronisation interval in milliseconds.
    #[serde(rename = "syncInterval")]
    pub sync_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HsmConfig {
    pub mode: Mode,
    pub vendor: String,
    pub endpoint: String,
    pub authentication: AuthenticationConfig,
    pub algorithms: AlgorithmConfig,
    pub performance: PerformanceConfig,
    pub monitoring: MonitoringConfig,
    pub security: SecurityConfig,
    pub clustering: ClusteringConfig,
}

impl HsmConfig {
    pub fn from_json_str(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|e| HsmError::Configuration(e.to_string()))
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            HsmError::Configuration(format!("cannot read {}: {}", path.as_ref().display(), e))
        })?;
        Self::from_json_str(&raw)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Apply `HSM_*` environment variables on top of this profile.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|name| std::env::var(name).ok())
    }

    /// Apply overrides from any lookup function.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(mode) = lookup(ENV_MODE) {
            self.mode = Mode::parse(&mode)
                .ok_or_else(|| HsmError::Configuration(format!("unknown mode {:?}", mode)))?;
        }
        if let Some(endpoint) = lookup(ENV_ENDPOINT) {
            self.endpoint = endpoint;
        }
        if let Some(client_id) = lookup(ENV_CLIENT_ID) {
            self.authentication.client_id = client_id;
        }

        let cert = lookup(ENV_CERT_PATH);
        let key = lookup(ENV_KEY_PATH);
        let ca = lookup(ENV_CA_PATH);
        if cert.is_some() || key.is_some() || ca.is_some() {
            let current = self.authentication.cert_paths.take();
            let merged = CertPaths {
                client_cert: cert
                    .map(PathBuf::from)
                    .or_else(|| current.as_ref().map(|c| c.client_cert.clone()))
                    .unwrap_or_default(),
                client_key: key
                    .map(PathBuf::from)
                    .or_else(|| current.as_ref().map(|c| c.client_key.clone()))
                    .unwrap_or_default(),
                ca_cert: ca
                    .map(PathBuf::from)
                    .or_else(|| current.and_then(|c| c.ca_cert)),
            };
            self.authentication.cert_paths = Some(merged);
        }
        Ok(())
    }

    /// The nodes the cluster manager should track. A single node at
    /// `endpoint` when clustering is off.
    pub fn cluster_nodes(&self) -> Vec<ClusterNode> {
        if self.clustering.enabled && !self.clustering.nodes.is_empty() {
            return self.clustering.nodes.clone();
        }
        vec![ClusterNode {
            node_id: "primary".to_string(),
            endpoint: self.endpoint.clone(),
            priority: 100,
            health_status: NodeHealth::Standby,
        }]
    }

    /// Hardware randomness when enforced, hybrid otherwise.
    pub fn random_source(&self) -> RandomSource {
        if self.security.enforce_hardware_rng {
            RandomSource::Hardware
        } else {
            RandomSource::Hybrid
        }
    }

    /// Allow-list entries for a key family.
    pub fn allowed_algorithms(&self, key_type: crate::keys::KeyType) -> &[String] {
        use crate::keys::KeyType;
        match key_type {
            KeyType::Symmetric => &self.algorithms.symmetric,
            KeyType::Asymmetric => &self.algorithms.asymmetric,
            KeyType::PostQuantum => &self.algorithms.post_quantum,
        }
    }
}
