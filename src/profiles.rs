//! Configuration profiles per environment.
//!
//! Every profile has the same shape; they differ in algorithm allow-lists,
//! performance targets, monitoring thresholds, cluster size and security
//! flags. Whether a profile is fit for production is decided by
//! [`crate::validate::validate_production_config`], not by which factory
//! method produced it.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::cluster::ClusterNode;
use crate::config::{
    AlertThresholds, AlgorithmConfig, AuditLevel, AuthMethod, AuthenticationConfig, BackoffConfig,
    BackoffStrategy, CachingConfig, CertPaths, ClusteringConfig, FailoverStrategy, HsmConfig,
    KeyEscrowPolicy, LogRotation, LoggingConfig, Mode, MonitoringConfig, PerformanceConfig,
    PerformanceTargets, SecurityConfig,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ComplianceFramework {
    /// FIPS 140-2 Level 3.
    Fips140Level3,
    CommonCriteria,
    PciDss,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProfileKind {
    Production,
    HighAvailability,
    Development,
    Testing,
    Compliance(ComplianceFramework),
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

/// Builds [`HsmConfig`] profiles for one vendor, endpoint and client.
#[derive(Debug, Clone)]
pub struct ConfigFactory {
    vendor: String,
    endpoint: String,
    client_id: String,
    replicas: Vec<String>,
    cert_dir: PathBuf,
}

impl ConfigFactory {
    pub fn new(vendor: impl Into<String>, endpoint: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            vendor: vendor.into(),
            endpoint: endpoint.into(),
            client_id: client_id.into(),
            replicas: Vec::new(),
            cert_dir: PathBuf::from("/etc/hsmvault/certs"),
        }
    }

    /// Endpoints of the secondary nodes used by the high-availability
    /// profile, best first.
    pub fn replicas(mut self, endpoints: Vec<String>) -> Self {
        self.replicas = endpoints;
        self
    }

    /// Directory holding `client.pem`, `client.key` and `ca.pem`.
    pub fn cert_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cert_dir = dir.into();
        self
    }

    pub fn build(&self, kind: ProfileKind) -> HsmConfig {
        match kind {
            ProfileKind::Production => self.production(),
            ProfileKind::HighAvailability => self.high_availability(),
            ProfileKind::Development => self.development(),
            ProfileKind::Testing => self.testing(),
            ProfileKind::Compliance(framework) => self.compliance(framework),
        }
    }

    fn cert_paths(&self) -> CertPaths {
        CertPaths {
            client_cert: self.cert_dir.join("client.pem"),
            client_key: self.cert_dir.join("client.key"),
            ca_cert: Some(self.cert_dir.join("ca.pem")),
        }
    }

    fn full_algorithms() -> AlgorithmConfig {
        AlgorithmConfig {
            symmetric: names(&["AES-256-GCM", "CHACHA20-POLY1305", "HMAC-SHA256", "HMAC-SHA512"]),
            asymmetric: names(&["ECDSA-P256-SHA256", "ED25519"]),
            post_quantum: names(&["LAMPORT-SHA3-256"]),
            hashing: names(&["SHA-256", "SHA-512", "SHA3-256", "SHA3-512", "SHAKE256"]),
            key_derivation: names(&["Argon2id", "scrypt", "PBKDF2-SHA512"]),
        }
    }

    pub fn production(&self) -> HsmConfig {
        HsmConfig {
            mode: Mode::Production,
            vendor: self.vendor.clone(),
            endpoint: self.endpoint.clone(),
            authentication: AuthenticationConfig {
                client_id: self.client_id.clone(),
                auth_method: AuthMethod::Certificate,
                cert_paths: Some(self.cert_paths()),
                session_timeout: 1800,
                credentials: None,
                validate_certificates: true,
            },
            algorithms: Self::full_algorithms(),
            performance: PerformanceConfig {
                max_concurrent_operations: 1000,
                timeout_ms: 5000,
                retry_attempts: 3,
                retry_backoff: BackoffConfig::default(),
                connection_pool_size: 20,
                performance_targets: PerformanceTargets {
                    symmetric_latency_ms: 1.0,
                    asymmetric_latency_ms: 10.0,
                    post_quantum_latency_ms: 50.0,
                    min_throughput_ops: 10_000.0,
                },
                caching: CachingConfig {
                    enabled: true,
                    ttl_seconds: 300,
                    max_entries: 10_000,
                },
            },
            monitoring: MonitoringConfig {
                health_check_interval_ms: 30_000,
                alert_thresholds: AlertThresholds {
                    error_rate: 0.01,
                    latency_ms: 100.0,
                    utilization_percent: 80.0,
                    failure_count: 3,
                },
                logging: LoggingConfig {
                    audit_level: AuditLevel::Comprehensive,
                    log_rotation: LogRotation {
                        max_size_bytes: 100 * 1024 * 1024,
                        max_files: 10,
                    },
                    encrypt_logs: true,
                },
            },
            security: SecurityConfig {
                enforce_hardware_rng: true,
                key_escrow_policy: KeyEscrowPolicy::DualControl,
                integrity_checks: true,
                sidechannel_protection: true,
                fips_compliance: true,
            },
            clustering: ClusteringConfig {
                enabled: false,
                nodes: Vec::new(),
                failover_strategy: FailoverStrategy::Priority,
                sync_interval_ms: 60_000,
            },
        }
    }

    /// Production with a three-node (or larger) priority cluster.
    pub fn high_availability(&self) -> HsmConfig {
        let mut cfg = self.production();
        let mut endpoints = vec![self.endpoint.clone()];
        if self.replicas.is_empty() {
            endpoints.extend((2..=3).map(|i| format!("{}-{}", self.endpoint, i)));
        } else {
            endpoints.extend(self.replicas.iter().cloned());
        }
        cfg.clustering = ClusteringConfig {
            enabled: true,
            nodes: endpoints
                .into_iter()
                .enumerate()
                .map(|(i, endpoint)| ClusterNode::new(format!("node-{}", i + 1), endpoint, 100 - 10 * i as i32))
                .collect(),
            failover_strategy: FailoverStrategy::Priority,
            sync_interval_ms: 5_000,
        };
        cfg.performance.max_concurrent_operations = 5000;
        cfg.performance.connection_pool_size = 50;
        cfg.monitoring.health_check_interval_ms = 5_000;
        cfg.monitoring.alert_thresholds.failure_count = 2;
        cfg
    }

    pub fn development(&self) -> HsmConfig {
        let mut cfg = self.production();
        cfg.mode = Mode::Development;
        cfg.authentication = AuthenticationConfig {
            client_id: self.client_id.clone(),
            auth_method: AuthMethod::Token,
            cert_paths: None,
            session_timeout: 8 * 3600,
            credentials: None,
            validate_certificates: false,
        };
        cfg.algorithms.symmetric.push("AES-128-GCM".to_string());
        cfg.performance.max_concurrent_operations = 100;
        cfg.performance.timeout_ms = 30_000;
        cfg.performance.connection_pool_size = 5;
        cfg.performance.performance_targets = PerformanceTargets {
            symmetric_latency_ms: 10.0,
            asymmetric_latency_ms: 100.0,
            post_quantum_latency_ms: 500.0,
            min_throughput_ops: 100.0,
        };
        cfg.performance.caching.ttl_seconds = 60;
        cfg.monitoring.health_check_interval_ms = 60_000;
        cfg.monitoring.alert_thresholds = AlertThresholds {
            error_rate: 0.10,
            latency_ms: 1000.0,
            utilization_percent: 95.0,
            failure_count: 5,
        };
        cfg.monitoring.logging.audit_level = AuditLevel::Standard;
        cfg.monitoring.logging.encrypt_logs = false;
        cfg.security = SecurityConfig {
            enforce_hardware_rng: false,
            key_escrow_policy: KeyEscrowPolicy::Disabled,
            integrity_checks: true,
            sidechannel_protection: false,
            fips_compliance: false,
        };
        cfg
    }

    /// Fast timeouts, simulated authentication, everything audited.
    pub fn testing(&self) -> HsmConfig {
        let mut cfg = self.development();
        cfg.mode = Mode::Testing;
        cfg.authentication.auth_method = AuthMethod::Simulation;
        cfg.authentication.session_timeout = 600;
        cfg.performance.max_concurrent_operations = 64;
        cfg.performance.timeout_ms = 1000;
        cfg.performance.retry_attempts = 2;
        cfg.performance.retry_backoff = BackoffConfig {
            strategy: BackoffStrategy::Fixed,
            base_delay_ms: 5,
            max_delay_ms: 5,
        };
        cfg.performance.connection_pool_size = 2;
        cfg.monitoring.health_check_interval_ms = 1_000;
        cfg.monitoring.alert_thresholds.failure_count = 2;
        cfg.monitoring.logging.audit_level = AuditLevel::Comprehensive;
        cfg.clustering.sync_interval_ms = 1_000;
        cfg
    }

    /// Production hardened for a compliance regime.
    pub fn compliance(&self, framework: ComplianceFramework) -> HsmConfig {
        let mut cfg = self.production();
        cfg.monitoring.logging.audit_level = AuditLevel::Comprehensive;
        cfg.monitoring.logging.encrypt_logs = true;
        cfg.security.integrity_checks = true;
        cfg.security.sidechannel_protection = true;
        match framework {
            ComplianceFramework::Fips140Level3 => {
                cfg.algorithms = AlgorithmConfig {
                    symmetric: names(&["AES-256-GCM", "HMAC-SHA256", "HMAC-SHA512"]),
                    asymmetric: names(&["ECDSA-P256-SHA256"]),
                    post_quantum: Vec::new(),
                    hashing: names(&["SHA-256", "SHA-512", "SHA3-256", "SHA3-512"]),
                    key_derivation: names(&["PBKDF2-SHA256", "PBKDF2-SHA512"]),
                };
                cfg.authentication.session_timeout = 900;
                cfg.security.key_escrow_policy = KeyEscrowPolicy::DualControl;
            }
            ComplianceFramework::CommonCriteria => {
                cfg.authentication.session_timeout = 900;
                cfg.security.key_escrow_policy = KeyEscrowPolicy::ThirdParty;
                cfg.monitoring.alert_thresholds.failure_count = 1;
            }
            ComplianceFramework::PciDss => {
                cfg.algorithms.symmetric = names(&["AES-256-GCM", "HMAC-SHA256"]);
                cfg.algorithms.asymmetric = names(&["ECDSA-P256-SHA256"]);
                // Idle sessions end after 15 minutes.
                cfg.authentication.session_timeout = 900;
                cfg.monitoring.logging.log_rotation.max_files = 365;
            }
        }
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn factory() -> ConfigFactory {
        ConfigFactory::new("softhsm", "softhsm://primary", "payments")
    }

    #[test]
    fn test_high_availability_topology() {
        let cfg = factory().high_availability();
        assert!(cfg.clustering.enabled);
        let priorities: Vec<i32> = cfg.clustering.nodes.iter().map(|n| n.priority).collect();
        assert_eq!(priorities, vec![100, 90, 80]);
        assert_eq!(cfg.clustering.nodes[0].endpoint, "softhsm://primary");

        let custom = factory()
            .replicas(vec!["softhsm://b".into(), "softhsm://c".into(), "softhsm://d".into()])
            .high_availability();
        assert_eq!(custom.clustering.nodes.len(), 4);
    }

    #[test]
    fn test_profiles_differ_where_expected() {
        let f = factory();
        assert_eq!(f.build(ProfileKind::Development).mode, Mode::Development);
        assert_eq!(f.build(ProfileKind::Testing).authentication.auth_method, AuthMethod::Simulation);
        assert!(!f.development().security.enforce_hardware_rng);

        let fips = f.compliance(ComplianceFramework::Fips140Level3);
        assert!(!fips.algorithms.symmetric.contains(&"CHACHA20-POLY1305".to_string()));
        assert!(fips.algorithms.post_quantum.is_empty());
        assert_eq!(f.compliance(ComplianceFramework::PciDss).authentication.session_timeout, 900);
    }
}
