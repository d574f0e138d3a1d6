//! Tamper evidence, sinks and the facade's audit guarantees.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use hsmvault::audit::{decrypt_log_line, AuditEntry, AuditEntryBuilder, AuditOutcome, AuditSink, FileAuditSink};
use hsmvault::config::AuditLevel;
use hsmvault::{AuditFilter, GenerateKeyParams, HsmError, KeyType, KeyUsage, Result};

fn entry() -> AuditEntry {
    AuditEntryBuilder::new("sign", AuditOutcome::Success, Duration::from_millis(3), "asymmetric", "certificate")
        .key_id("softhsm:ed25519:0001")
        .user_id("ops-bot")
        .source_ip("192.0.2.10")
        .session_id("s-1")
        .additional_data(serde_json::json!({"ticket": 77}))
        .build()
        .unwrap()
}

#[test]
fn test_mutating_any_hashed_field_breaks_integrity() {
    let original = entry();
    assert!(original.integrity_verified);
    assert!(original.verify_integrity());

    let mutations: Vec<Box<dyn Fn(&mut AuditEntry)>> = vec![
        Box::new(|e: &mut AuditEntry| e.operation = "verify".into()),
        Box::new(|e: &mut AuditEntry| e.key_id = Some("softhsm:ed25519:0002".into())),
        Box::new(|e: &mut AuditEntry| e.key_id = None),
        Box::new(|e: &mut AuditEntry| e.user_id = Some("root".into())),
        Box::new(|e: &mut AuditEntry| e.source_ip = None),
        Box::new(|e: &mut AuditEntry| e.result = AuditOutcome::Failure),
        Box::new(|e: &mut AuditEntry| e.performance_metrics.duration_micros += 1),
        Box::new(|e: &mut AuditEntry| e.security_context.auth_method = "simulation".into()),
        Box::new(|e: &mut AuditEntry| e.additional_data = Some(serde_json::json!({"ticket": 78}))),
        Box::new(|e: &mut AuditEntry| e.timestamp = e.timestamp + chrono::Duration::seconds(1)),
    ];
    for (i, mutate) in mutations.iter().enumerate() {
        let mut tampered = original.clone();
        mutate(&mut tampered);
        assert!(!tampered.verify_integrity(), "mutation {} went unnoticed", i);
    }
}

#[test]
fn test_file_sink_rotates_and_encrypts() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("audit.log");
    let key = [9u8; 32];
    let mut sink = FileAuditSink::new(&path).unwrap().with_rotation(2048, 2).with_encryption(key);

    let written: Vec<AuditEntry> = (0..20).map(|_| entry()).collect();
    for e in &written {
        sink.append(e).unwrap();
    }
    assert!(path.exists());
    assert!(dir.path().join("audit.log.1").exists());
    assert!(dir.path().join("audit.log.2").exists());
    assert!(!dir.path().join("audit.log.3").exists());

    let current = std::fs::read_to_string(&path).unwrap();
    assert!(!current.contains("ops-bot"));
    let last_line = current.lines().last().unwrap();
    let decoded = decrypt_log_line(&key, last_line).unwrap();
    assert_eq!(&decoded, written.last().unwrap());
    assert!(decoded.verify_integrity());

    assert!(decrypt_log_line(&[8u8; 32], last_line).is_err());
}

struct BrokenSink;

impl AuditSink for BrokenSink {
    fn append(&mut self, _entry: &AuditEntry) -> Result<()> {
        Err(HsmError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk full")))
    }
}

struct SharedSink(Arc<Mutex<Vec<AuditEntry>>>);

impl AuditSink for SharedSink {
    fn append(&mut self, entry: &AuditEntry) -> Result<()> {
        self.0.lock().unwrap().push(entry.clone());
        Ok(())
    }
}

#[tokio::test]
async fn test_sink_failure_is_a_warning_not_a_lost_result() {
    let fx = common::cluster(&[("solo", 100)]);
    let svc = common::started_service(&fx).await;
    let copies = Arc::new(Mutex::new(Vec::new()));
    svc.add_audit_sink(Box::new(BrokenSink));
    svc.add_audit_sink(Box::new(SharedSink(Arc::clone(&copies))));

    let out = svc
        .generate_key(&GenerateKeyParams::new(KeyType::Symmetric, "AES-256-GCM", vec![KeyUsage::Encrypt]))
        .await;
    assert!(out.value.is_ok());
    assert!(out.audit_warning.unwrap().contains("disk full"));
    // The in-memory trail and healthy sinks still got the entry.
    assert_eq!(svc.audit_trail(&AuditFilter::default()).total, 1);
    assert_eq!(copies.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_failures_are_audited_with_context() {
    let fx = common::cluster(&[("solo", 100)]);
    let svc = common::started_service(&fx).await;
    assert_eq!(svc.config().monitoring.logging.audit_level, AuditLevel::Comprehensive);

    let out = svc.export_key("softhsm:aes-256-gcm:missing").await;
    assert!(matches!(out.value, Err(HsmError::KeyNotFound(_))));
    let entry = out.audit.unwrap();
    assert_eq!(entry.result, AuditOutcome::Failure);
    assert_eq!(entry.key_id.as_deref(), Some("softhsm:aes-256-gcm:missing"));
    let data = entry.additional_data.unwrap();
    assert!(data["error"].as_str().unwrap().contains("missing"));
    assert!(svc.verify_audit_trail().is_empty());

    // The backend kept its own record of the attempt.
    let backend = svc
        .get_audit_logs(&AuditFilter {
            operation: Some("export-key".into()),
            ..AuditFilter::default()
        })
        .await
        .into_result()
        .unwrap();
    assert_eq!(backend.total, 1);
    assert_eq!(backend.entries[0].result, AuditOutcome::Failure);
}

#[tokio::test]
async fn test_encrypted_profile_requires_a_log_key() {
    let mut fx = common::cluster(&[("solo", 100)]);
    fx.config.monitoring.logging.encrypt_logs = true;
    let svc = common::started_service(&fx).await;
    let dir = tempfile::tempdir().unwrap();

    assert!(matches!(
        svc.add_file_audit_sink(dir.path().join("a.log"), None),
        Err(HsmError::Configuration(_))
    ));
    svc.add_file_audit_sink(dir.path().join("a.log"), Some([1u8; 32])).unwrap();
    svc.list_keys(&Default::default()).await.into_result().unwrap();

    let line = std::fs::read_to_string(dir.path().join("a.log")).unwrap();
    let decoded = decrypt_log_line(&[1u8; 32], line.lines().next().unwrap()).unwrap();
    assert_eq!(decoded.operation, "list-keys");
}
