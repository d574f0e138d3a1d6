//! Cluster failover, retry and backpressure behaviour.

mod common;

use std::sync::Arc;
use std::time::Duration;

use hsmvault::cluster::{AlertKind, ClusterSettings};
use hsmvault::config::FailoverStrategy;
use hsmvault::{
    ClusterManager, ConnectionConfig, GenerateKeyParams, HsmError, HsmService, KeyType, KeyUsage, NodeHealth,
    ServiceState, VendorAdapter,
};

fn aes_params() -> GenerateKeyParams {
    GenerateKeyParams::new(KeyType::Symmetric, "AES-256-GCM", vec![KeyUsage::Encrypt])
}

/// Drive the active node's rolling error rate over the critical threshold.
async fn make_active_critical(fx: &common::Fixture, svc: &HsmService) -> String {
    let (node_id, conn) = svc.cluster().active().await.unwrap();
    let node = common::node(fx, &node_id);
    node.inject_failures(5);
    for _ in 0..5 {
        assert!(fx.adapter.generate_key(&conn, &aes_params()).await.is_err());
    }
    assert!(node.error_rate() > 0.10);
    node_id
}

fn health_of(svc: &HsmService, node_id: &str) -> NodeHealth {
    svc.cluster_view()
        .nodes
        .iter()
        .find(|n| n.node_id == node_id)
        .map(|n| n.health_status)
        .unwrap()
}

#[tokio::test]
async fn test_critical_active_node_fails_over_by_priority() {
    let fx = common::cluster(&[("n8", 8), ("n10", 10), ("n9", 9)]);
    let svc = common::started_service(&fx).await;
    assert_eq!(svc.cluster_view().active_node.as_deref(), Some("n10"));
    assert_eq!(svc.cluster_view().epoch, 1);

    assert_eq!(make_active_critical(&fx, &svc).await, "n10");
    let alerts = svc.check_health().await.unwrap();
    assert!(alerts
        .iter()
        .any(|a| a.node_id == "n10" && a.kind == AlertKind::ErrorRate));

    let view = svc.cluster_view();
    assert_eq!(view.active_node.as_deref(), Some("n9"));
    assert_eq!(view.epoch, 2);
    assert_eq!(health_of(&svc, "n10"), NodeHealth::Unreachable);
    // Priority 8 stays in reserve while 9 is healthy.
    assert_eq!(health_of(&svc, "n8"), NodeHealth::Standby);

    // Keys live in the shared partition, so service continues.
    assert!(svc.generate_key(&aes_params()).await.is_ok());

    assert_eq!(make_active_critical(&fx, &svc).await, "n9");
    svc.check_health().await.unwrap();
    let view = svc.cluster_view();
    assert_eq!(view.active_node.as_deref(), Some("n8"));
    assert_eq!(view.epoch, 3);
    assert_eq!(health_of(&svc, "n10"), NodeHealth::Unreachable);
}

#[tokio::test]
async fn test_offline_node_fails_over_inside_the_operation() {
    let fx = common::cluster(&[("n10", 10), ("n9", 9), ("n8", 8)]);
    let svc = common::started_service(&fx).await;

    common::node(&fx, "n10").set_offline(true);
    let key = svc.generate_key(&aes_params()).await.into_result().unwrap();
    assert!(fx.nodes[1].keys().contains(&key.key_id));
    assert_eq!(svc.cluster_view().active_node.as_deref(), Some("n9"));

    common::node(&fx, "n9").set_offline(true);
    common::node(&fx, "n8").set_offline(true);
    let out = svc.generate_key(&aes_params()).await;
    assert!(matches!(out.value, Err(HsmError::ClusterExhausted { .. })));
    assert_eq!(svc.cluster().state().await, ServiceState::Failed);

    // Nodes come back; one health pass restores the best of them.
    for n in &fx.nodes {
        n.set_offline(false);
    }
    svc.check_health().await.unwrap();
    assert_eq!(svc.cluster_view().active_node.as_deref(), Some("n10"));
    assert_eq!(svc.cluster().state().await, ServiceState::Connected);
}

#[tokio::test]
async fn test_failover_does_not_spend_retry_attempts() {
    let mut fx = common::cluster(&[("n10", 10), ("n9", 9)]);
    fx.config.performance.retry_attempts = 0;
    let svc = common::started_service(&fx).await;

    common::node(&fx, "n10").set_offline(true);
    let key = svc.generate_key(&aes_params()).await.into_result().unwrap();
    assert!(common::node(&fx, "n9").keys().contains(&key.key_id));
    assert_eq!(svc.cluster_view().active_node.as_deref(), Some("n9"));
}

#[tokio::test]
async fn test_failover_stops_when_every_node_is_down() {
    let mut fx = common::cluster(&[("n10", 10), ("n9", 9)]);
    fx.config.performance.retry_attempts = 0;
    let svc = common::started_service(&fx).await;

    for node in &fx.nodes {
        node.set_offline(true);
    }
    let err = svc.generate_key(&aes_params()).await.into_result().unwrap_err();
    assert!(!matches!(err, HsmError::RetriesExhausted { .. }), "{err:?}");
    assert_eq!(svc.cluster().state().await, ServiceState::Failed);
}

#[tokio::test]
async fn test_demoted_node_recovers_once_errors_age_out() {
    let fx = common::cluster(&[("n10", 10), ("n9", 9)]);
    common::node(&fx, "n10").set_error_horizon(Duration::from_millis(100));
    let svc = common::started_service(&fx).await;

    assert_eq!(make_active_critical(&fx, &svc).await, "n10");
    svc.check_health().await.unwrap();
    assert_eq!(svc.cluster_view().active_node.as_deref(), Some("n9"));
    assert_eq!(health_of(&svc, "n10"), NodeHealth::Unreachable);

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(common::node(&fx, "n10").error_rate(), 0.0);
    svc.check_health().await.unwrap();
    assert_eq!(health_of(&svc, "n10"), NodeHealth::Standby);

    // The recovered node is a failover target again.
    common::node(&fx, "n9").set_offline(true);
    assert!(svc.generate_key(&aes_params()).await.is_ok());
    assert_eq!(svc.cluster_view().active_node.as_deref(), Some("n10"));
}

#[tokio::test]
async fn test_slow_health_check_does_not_block_operations() {
    let fx = common::cluster(&[("n10", 10), ("n9", 9)]);
    let svc = common::started_service(&fx).await;
    common::node(&fx, "n9").set_health_delay(Duration::from_millis(400));

    let pass = {
        let cluster = Arc::clone(svc.cluster());
        tokio::spawn(async move { cluster.check_health().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let served = tokio::time::timeout(Duration::from_millis(200), svc.generate_key(&aes_params())).await;
    assert!(served.expect("operation waited on the health pass").is_ok());

    pass.await.unwrap().unwrap();
    assert_eq!(svc.cluster_view().active_node.as_deref(), Some("n10"));
    assert_eq!(health_of(&svc, "n9"), NodeHealth::Standby);
}

#[tokio::test]
async fn test_round_robin_ignores_priority() {
    let mut fx = common::cluster(&[("a", 100), ("b", 90), ("c", 80)]);
    fx.config.clustering.failover_strategy = FailoverStrategy::RoundRobin;
    let svc = common::started_service(&fx).await;
    assert_eq!(svc.cluster_view().active_node.as_deref(), Some("a"));

    common::node(&fx, "a").set_offline(true);
    svc.generate_key(&aes_params()).await.into_result().unwrap();
    assert_eq!(svc.cluster_view().active_node.as_deref(), Some("b"));

    common::node(&fx, "a").set_offline(false);
    svc.check_health().await.unwrap();
    assert_eq!(health_of(&svc, "a"), NodeHealth::Standby);

    common::node(&fx, "b").set_offline(true);
    svc.generate_key(&aes_params()).await.into_result().unwrap();
    assert_eq!(svc.cluster_view().active_node.as_deref(), Some("c"));
}

#[tokio::test]
async fn test_retryable_vendor_errors_exhaust_with_diagnostics() {
    let fx = common::cluster(&[("solo", 100)]);
    let svc = common::started_service(&fx).await;
    let attempts = svc.cluster().settings().retry.max_attempts;

    common::node(&fx, "solo").inject_failures(attempts + 5);
    let out = svc.generate_key(&aes_params()).await;
    match out.value {
        Err(HsmError::RetriesExhausted {
            vendor,
            operation,
            attempts: made,
            last,
        }) => {
            assert_eq!(vendor, "softhsm");
            assert_eq!(operation, "generate-key");
            assert_eq!(made, attempts);
            assert!(matches!(*last, HsmError::VendorOperation { retryable: true, .. }));
        }
        other => panic!("unexpected {:?}", other.map(|k| k.key_id)),
    }
    assert!(out.audit.is_some());
}

#[tokio::test]
async fn test_transient_fault_is_retried_transparently() {
    let fx = common::cluster(&[("solo", 100)]);
    let svc = common::started_service(&fx).await;
    common::node(&fx, "solo").inject_failures(1);
    assert!(svc.generate_key(&aes_params()).await.is_ok());
}

#[tokio::test]
async fn test_validation_errors_are_not_retried() {
    let fx = common::cluster(&[("solo", 100)]);
    let svc = common::started_service(&fx).await;
    let bad = GenerateKeyParams::new(KeyType::Symmetric, "AES-256-GCM", Vec::new());
    assert!(matches!(
        svc.generate_key(&bad).await.value,
        Err(HsmError::Validation(_))
    ));
    // Rejected before the backend recorded anything.
    let backend = common::node(&fx, "solo").audit_entries(&hsmvault::AuditFilter::default());
    assert!(backend.entries.iter().all(|e| e.operation != "generate-key"));
}

#[tokio::test]
async fn test_lost_session_is_reopened() {
    let fx = common::cluster(&[("solo", 100)]);
    let svc = common::started_service(&fx).await;
    let (_, conn) = svc.cluster().active().await.unwrap();
    fx.adapter.disconnect(&conn).await.unwrap();

    assert!(svc.generate_key(&aes_params()).await.is_ok());
    let (node_id, fresh) = svc.cluster().active().await.unwrap();
    assert_eq!(node_id, "solo");
    assert_ne!(fresh.session_id, conn.session_id);
}

fn manager(fx: &common::Fixture, tweak: impl FnOnce(&mut ClusterSettings)) -> Arc<ClusterManager> {
    let mut settings = ClusterSettings::from_config(&fx.config);
    tweak(&mut settings);
    let base = ConnectionConfig::from_config(&fx.config, &fx.config.endpoint);
    Arc::new(ClusterManager::new(fx.adapter.clone(), base, fx.config.cluster_nodes(), settings).unwrap())
}

#[tokio::test]
async fn test_slow_node_times_out_and_fails_over() {
    let fx = common::cluster(&[("n10", 10), ("n9", 9)]);
    let mgr = manager(&fx, |s| s.op_timeout = Duration::from_millis(30));
    mgr.start().await.unwrap();

    let served_by = mgr
        .execute("slow-op", |_, conn| async move {
            if conn.endpoint.ends_with("n10") {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            Ok(conn.endpoint.clone())
        })
        .await
        .unwrap();
    assert_eq!(served_by, "softhsm://n9");
}

#[tokio::test]
async fn test_backpressure_when_permits_run_out() {
    let fx = common::cluster(&[("solo", 100)]);
    let mgr = manager(&fx, |s| {
        s.max_concurrent = 1;
        s.queue_timeout = Duration::from_millis(20);
        s.op_timeout = Duration::from_secs(5);
    });
    mgr.start().await.unwrap();

    let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();
    let started_tx = parking_lot::Mutex::new(Some(started_tx));
    let holder = {
        let mgr = Arc::clone(&mgr);
        tokio::spawn(async move {
            mgr.execute("hold", move |_, _| {
                if let Some(tx) = started_tx.lock().take() {
                    let _ = tx.send(());
                }
                async {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    Ok(())
                }
            })
            .await
        })
    };
    started_rx.await.unwrap();

    let rejected = mgr.execute("second", |_, _| async { Ok(()) }).await;
    assert!(matches!(rejected, Err(HsmError::Backpressure { limit: 1 })));
    holder.await.unwrap().unwrap();
    assert!(mgr.execute("third", |_, _| async { Ok(()) }).await.is_ok());
}

#[tokio::test]
async fn test_background_monitor_promotes_standby() {
    let mut fx = common::cluster(&[("n10", 10), ("n9", 9)]);
    fx.config.monitoring.health_check_interval_ms = 20;
    let svc = common::started_service(&fx).await;
    let mut views = svc.cluster().subscribe();
    svc.spawn_monitors();

    make_active_critical(&fx, &svc).await;
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if views.borrow_and_update().active_node.as_deref() == Some("n9") {
                break;
            }
            views.changed().await.unwrap();
        }
    })
    .await
    .unwrap();

    svc.shutdown().await;
    assert_eq!(svc.cluster().state().await, ServiceState::Disconnected);
    assert_eq!(svc.cluster_view().active_node, None);
}
