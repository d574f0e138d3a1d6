//! Production readiness checks.
//!
//! Hard rules populate `errors` and make the profile invalid. Soft rules are
//! advisory and only populate `warnings`.

use serde::{Deserialize, Serialize};

use crate::config::{AuditLevel, AuthMethod, FailoverStrategy, HsmConfig, Mode};

/// Smallest pool the validator considers adequate.
pub const MIN_POOL_SIZE: usize = 10;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Judge whether `config` may run in production. Pure: reads nothing but
/// the profile value.
pub fn validate_production_config(config: &HsmConfig) -> ValidationReport {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if config.mode != Mode::Production {
        errors.push(format!("mode must be production, found {:?}", config.mode).to_lowercase());
    }
    if !config.security.enforce_hardware_rng {
        errors.push("hardware RNG must be enforced".to_string());
    }
    if !config.security.fips_compliance {
        errors.push("FIPS compliance must be enabled".to_string());
    }
    let auth = &config.authentication;
    if auth.auth_method == AuthMethod::Simulation {
        errors.push("simulation authentication is not allowed in production".to_string());
    }
    if !auth.validate_certificates {
        errors.push("certificate validation must be enabled".to_string());
    }
    if auth.auth_method == AuthMethod::Certificate {
        let complete = auth.cert_paths.as_ref().map_or(false, |p| {
            !p.client_cert.as_os_str().is_empty() && !p.client_key.as_os_str().is_empty()
        });
        if !complete {
            errors.push("certificate authentication requires client certificate and key paths".to_string());
        }
    }

    let perf = &config.performance;
    let targets = &perf.performance_targets;
    if targets.symmetric_latency_ms > 10.0 {
        warnings.push(format!(
            "symmetric latency target {}ms exceeds the recommended 10ms",
            targets.symmetric_latency_ms
        ));
    }
    if targets.asymmetric_latency_ms > 100.0 {
        warnings.push(format!(
            "asymmetric latency target {}ms exceeds the recommended 100ms",
            targets.asymmetric_latency_ms
        ));
    }
    if targets.post_quantum_latency_ms > 500.0 {
        warnings.push(format!(
            "post-quantum latency target {}ms exceeds the recommended 500ms",
            targets.post_quantum_latency_ms
        ));
    }
    if targets.min_throughput_ops < 1000.0 {
        warnings.push(format!(
            "throughput target {} ops/s is below the recommended 1000",
            targets.min_throughput_ops
        ));
    }
    if !(100..=30_000).contains(&perf.timeout_ms) {
        warnings.push(format!("operation timeout {}ms is outside 100..=30000ms", perf.timeout_ms));
    }
    if perf.connection_pool_size < MIN_POOL_SIZE {
        warnings.push(format!(
            "connection pool of {} is below the recommended {}",
            perf.connection_pool_size, MIN_POOL_SIZE
        ));
    }

    let logging = &config.monitoring.logging;
    if logging.audit_level != AuditLevel::Comprehensive {
        warnings.push("audit level should be comprehensive".to_string());
    }
    if !logging.encrypt_logs {
        warnings.push("audit logs should be encrypted".to_string());
    }
    if !config.security.integrity_checks {
        warnings.push("key integrity checks are disabled".to_string());
    }
    if !config.clustering.enabled {
        warnings.push("clustering is disabled; there is no failover target".to_string());
    } else if config.clustering.failover_strategy == FailoverStrategy::RoundRobin {
        warnings.push("round-robin failover ignores node priority".to_string());
    }

    ValidationReport {
        valid: errors.is_empty(),
        errors,
        warnings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiles::ConfigFactory;

    #[test]
    fn test_production_profile_is_valid() {
        let report = validate_production_config(&ConfigFactory::new("softhsm", "softhsm://a", "svc").production());
        assert!(report.valid, "{:?}", report.errors);
        // Single node: advisory only.
        assert!(report.warnings.iter().any(|w| w.contains("clustering")));
    }

    #[test]
    fn test_missing_cert_paths() {
        let mut cfg = ConfigFactory::new("softhsm", "softhsm://a", "svc").production();
        cfg.authentication.cert_paths = None;
        let report = validate_production_config(&cfg);
        assert!(!report.valid);
        assert_eq!(report.errors.len(), 1);
    }
}
