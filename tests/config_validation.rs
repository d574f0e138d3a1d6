//! Profiles and the production gate.

use std::io::Write;

use hsmvault::config::{AuditLevel, AuthMethod, FailoverStrategy, Mode};
use hsmvault::{validate_production_config, ComplianceFramework, ConfigFactory, HsmConfig, ProfileKind};

fn factory() -> ConfigFactory {
    ConfigFactory::new("softhsm", "softhsm://primary", "treasury")
}

#[test]
fn test_production_and_compliance_profiles_pass_the_gate() {
    let f = factory();
    for kind in [
        ProfileKind::Production,
        ProfileKind::HighAvailability,
        ProfileKind::Compliance(ComplianceFramework::Fips140Level3),
        ProfileKind::Compliance(ComplianceFramework::CommonCriteria),
        ProfileKind::Compliance(ComplianceFramework::PciDss),
    ] {
        let report = validate_production_config(&f.build(kind));
        assert!(report.valid, "{:?}: {:?}", kind, report.errors);
    }
    // High availability clears the clustering advisory too.
    let ha = validate_production_config(&f.high_availability());
    assert!(ha.warnings.is_empty(), "{:?}", ha.warnings);
}

#[test]
fn test_non_production_profiles_fail_the_gate() {
    let f = factory();
    for cfg in [f.development(), f.testing()] {
        let report = validate_production_config(&cfg);
        assert!(!report.valid);
        assert!(report.errors.iter().any(|e| e.contains("mode must be production")));
        assert!(report.errors.iter().any(|e| e.contains("hardware RNG")));
    }
}

#[test]
fn test_each_hard_rule_is_a_distinct_error() {
    let mut cfg = factory().production();
    cfg.mode = Mode::Testing;
    cfg.authentication.auth_method = AuthMethod::Simulation;
    cfg.security.enforce_hardware_rng = false;

    let report = validate_production_config(&cfg);
    assert!(!report.valid);
    assert_eq!(report.errors.len(), 3, "{:?}", report.errors);
    assert!(report.errors.iter().any(|e| e.contains("mode")));
    assert!(report.errors.iter().any(|e| e.contains("simulation")));
    assert!(report.errors.iter().any(|e| e.contains("hardware RNG")));

    let mut no_fips = factory().production();
    no_fips.security.fips_compliance = false;
    no_fips.authentication.validate_certificates = false;
    let report = validate_production_config(&no_fips);
    assert_eq!(report.errors.len(), 2, "{:?}", report.errors);
}

#[test]
fn test_soft_rules_only_warn() {
    let mut cfg = factory().production();
    cfg.monitoring.logging.audit_level = AuditLevel::Standard;
    cfg.monitoring.logging.encrypt_logs = false;
    cfg.performance.connection_pool_size = 2;
    cfg.performance.performance_targets.symmetric_latency_ms = 50.0;
    cfg.performance.timeout_ms = 60_000;
    cfg.clustering.enabled = true;
    cfg.clustering.failover_strategy = FailoverStrategy::RoundRobin;

    let report = validate_production_config(&cfg);
    assert!(report.valid, "{:?}", report.errors);
    for needle in ["audit level", "encrypted", "connection pool", "symmetric latency", "timeout", "round-robin"] {
        assert!(
            report.warnings.iter().any(|w| w.contains(needle)),
            "no warning mentioning {:?} in {:?}",
            needle,
            report.warnings
        );
    }
}

#[test]
fn test_profile_survives_a_json_file() {
    let cfg = factory().high_availability();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(cfg.to_json_pretty().unwrap().as_bytes()).unwrap();

    let loaded = HsmConfig::from_json_file(file.path()).unwrap();
    assert_eq!(loaded.clustering, cfg.clustering);
    assert_eq!(loaded.algorithms, cfg.algorithms);
    assert!(validate_production_config(&loaded).valid);

    assert!(HsmConfig::from_json_file(file.path().with_extension("missing")).is_err());
    assert!(HsmConfig::from_json_str("{\"mode\": \"production\"}").is_err());
}

#[test]
fn test_env_overrides_can_break_production_readiness() {
    let mut cfg = factory().production();
    cfg.apply_overrides_from(|k| (k == hsmvault::config::ENV_MODE).then(|| "development".to_string()))
        .unwrap();
    assert!(!validate_production_config(&cfg).valid);
}
