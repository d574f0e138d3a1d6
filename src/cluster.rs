//! Connection and cluster management.
//!
//! A [`ClusterManager`] owns one connection per backend node of a logical
//! service and routes every operation to the single active node. When the
//! active node fails (a connection error, a timeout, or a critical health
//! check) the manager promotes the best standby:
//!
//! - **priority**: the highest-priority standby that connects and reports a
//!   non-critical health status;
//! - **round robin**: the next standby after the failed node in declaration
//!   order.
//!
//! If no candidate survives, the service is `Failed` and operations return
//! [`HsmError::ClusterExhausted`] until a health pass finds a node again.
//!
//! Health checks and view synchronisation run as background tasks stopped
//! by a `CancellationToken`. They only update node health and trigger
//! failover; they never touch in-flight operations.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::adapter::{HealthLevel, HealthStatus, VendorAdapter};
use crate::config::{AlertThresholds, FailoverStrategy, HsmConfig};
use crate::connection::{Connection, ConnectionConfig};
use crate::error::{HsmError, Result};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeHealth {
    Active,
    Standby,
    Unreachable,
}

fn standby() -> NodeHealth {
    NodeHealth::Standby
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterNode {
    pub node_id: String,
    pub endpoint: String,
    /// Higher is preferred.
    pub priority: i32,
    #[serde(default = "standby")]
    pub health_status: NodeHealth,
}

impl ClusterNode {
    pub fn new(node_id: impl Into<String>, endpoint: impl Into<String>, priority: i32) -> Self {
        Self {
            node_id: node_id.into(),
            endpoint: endpoint.into(),
            priority,
            health_status: NodeHealth::Standby,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Disconnected,
    Connecting,
    Connected,
    Degraded,
    Failed,
}

/// The authoritative picture of a cluster, published to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterView {
    pub active_node: Option<String>,
    /// Incremented on every promotion.
    pub epoch: u64,
    pub state: ServiceState,
    pub nodes: Vec<ClusterNode>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AlertKind {
    ErrorRate,
    Latency,
    Utilization,
    ConsecutiveFailures,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub node_id: String,
    pub kind: AlertKind,
    pub observed: f64,
    pub threshold: f64,
}

/// Compare one health result against the configured thresholds.
pub fn evaluate_alerts(
    node_id: &str,
    health: &HealthStatus,
    thresholds: &AlertThresholds,
    utilization_percent: f64,
) -> Vec<Alert> {
    let checks = [
        (AlertKind::ErrorRate, health.error_rate, thresholds.error_rate),
        (AlertKind::Latency, health.latency_ms, thresholds.latency_ms),
        (AlertKind::Utilization, utilization_percent, thresholds.utilization_percent),
    ];
    checks
        .into_iter()
        .filter(|(_, observed, threshold)| observed > threshold)
        .map(|(kind, observed, threshold)| {
            warn!(node_id, ?kind, observed, threshold, "alert threshold breached");
            Alert {
                node_id: node_id.to_string(),
                kind,
                observed,
                threshold,
            }
        })
        .collect()
}

struct HealthTarget {
    idx: usize,
    node_id: String,
    endpoint: String,
    conn: Option<Connection>,
    was_active: bool,
}

struct HealthReading {
    idx: usize,
    node_id: String,
    was_active: bool,
    conn: Option<Connection>,
    /// The health pass opened `conn` itself.
    opened: bool,
    health: Result<HealthStatus>,
}

fn same_session(current: Option<&Connection>, observed: Option<&Connection>) -> bool {
    match (current, observed) {
        (Some(a), Some(b)) => a.session_id == b.session_id,
        (None, None) => true,
        _ => false,
    }
}

/// Mark a node unreachable and hand back its session for disconnecting.
fn detach(inner: &mut Inner, idx: usize) -> Option<Connection> {
    inner.nodes[idx].health_status = NodeHealth::Unreachable;
    if inner.active == Some(idx) {
        inner.active = None;
        inner.last_failed = Some(idx);
    }
    inner.conns[idx].take()
}

/// Standby candidates for promotion, best first.
fn candidate_order(nodes: &[ClusterNode], strategy: FailoverStrategy, after: Option<usize>) -> Vec<usize> {
    let is_standby = |i: &usize| nodes[*i].health_status == NodeHealth::Standby;
    match strategy {
        FailoverStrategy::Priority => {
            let mut order: Vec<usize> = (0..nodes.len()).filter(is_standby).collect();
            // Stable: ties keep declaration order.
            order.sort_by(|a, b| nodes[*b].priority.cmp(&nodes[*a].priority));
            order
        }
        FailoverStrategy::RoundRobin => {
            let start = after.map_or(0, |i| (i + 1) % nodes.len().max(1));
            (start..nodes.len()).chain(0..start).filter(is_standby).collect()
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClusterSettings {
    /// Logical service name used in errors and logs.
    pub service: String,
    pub strategy: FailoverStrategy,
    pub max_concurrent: usize,
    /// Per-attempt operation timeout.
    pub op_timeout: Duration,
    /// Longest wait for a concurrency permit.
    pub queue_timeout: Duration,
    pub retry: RetryPolicy,
    pub health_interval: Duration,
    pub sync_interval: Duration,
    pub thresholds: AlertThresholds,
}

impl ClusterSettings {
    pub fn from_config(config: &HsmConfig) -> Self {
        Self {
            service: format!("{}/{}", config.vendor, config.authentication.client_id),
            strategy: config.clustering.failover_strategy,
            max_concurrent: config.performance.max_concurrent_operations.max(1),
            op_timeout: config.performance.timeout(),
            queue_timeout: config.performance.timeout(),
            retry: RetryPolicy::from_config(&config.performance),
            health_interval: Duration::from_millis(config.monitoring.health_check_interval_ms.max(1)),
            sync_interval: Duration::from_millis(config.clustering.sync_interval_ms.max(1)),
            thresholds: config.monitoring.alert_thresholds.clone(),
        }
    }
}

struct Inner {
    nodes: Vec<ClusterNode>,
    conns: Vec<Option<Connection>>,
    failures: Vec<u32>,
    active: Option<usize>,
    last_failed: Option<usize>,
    state: ServiceState,
    epoch: u64,
}

impl Inner {
    fn view(&self) -> ClusterView {
        ClusterView {
            active_node: self.active.map(|i| self.nodes[i].node_id.clone()),
            epoch: self.epoch,
            state: self.state,
            nodes: self.nodes.clone(),
        }
    }

    fn index_of(&self, node_id: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.node_id == node_id)
    }
}

pub struct ClusterManager {
    adapter: Arc<dyn VendorAdapter>,
    base: ConnectionConfig,
    settings: ClusterSettings,
    inner: Mutex<Inner>,
    node_count: usize,
    permits: Semaphore,
    view_tx: watch::Sender<ClusterView>,
}

impl ClusterManager {
    pub fn new(
        adapter: Arc<dyn VendorAdapter>,
        base: ConnectionConfig,
        nodes: Vec<ClusterNode>,
        settings: ClusterSettings,
    ) -> Result<Self> {
        if nodes.is_empty() {
            return Err(HsmError::Configuration("a cluster needs at least one node".into()));
        }
        for (i, n) in nodes.iter().enumerate() {
            if nodes[..i].iter().any(|m| m.node_id == n.node_id) {
                return Err(HsmError::Configuration(format!("duplicate node ID {}", n.node_id)));
            }
        }
        let nodes: Vec<ClusterNode> = nodes
            .into_iter()
            .map(|n| ClusterNode {
                health_status: NodeHealth::Standby,
                ..n
            })
            .collect();
        let count = nodes.len();
        let inner = Inner {
            nodes,
            conns: vec![None; count],
            failures: vec![0; count],
            active: None,
            last_failed: None,
            state: ServiceState::Disconnected,
            epoch: 0,
        };
        let (view_tx, _) = watch::channel(inner.view());
        Ok(Self {
            adapter,
            base,
            permits: Semaphore::new(settings.max_concurrent),
            settings,
            inner: Mutex::new(inner),
            node_count: count,
            view_tx,
        })
    }

    pub fn from_config(adapter: Arc<dyn VendorAdapter>, config: &HsmConfig) -> Result<Self> {
        let base = ConnectionConfig::from_config(config, &config.endpoint);
        Self::new(adapter, base, config.cluster_nodes(), ClusterSettings::from_config(config))
    }

    pub fn settings(&self) -> &ClusterSettings {
        &self.settings
    }

    pub fn adapter(&self) -> &Arc<dyn VendorAdapter> {
        &self.adapter
    }

    /// Connect every node and elect the first active one.
    pub async fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.state = ServiceState::Connecting;
        for idx in 0..inner.nodes.len() {
            if inner.conns[idx].is_some() {
                continue;
            }
            let endpoint = inner.nodes[idx].endpoint.clone();
            match self.adapter.connect(&self.base.for_endpoint(&endpoint)).await {
                Ok(conn) => inner.conns[idx] = Some(conn),
                Err(e) => {
                    warn!(node_id = %inner.nodes[idx].node_id, error = %e, "node failed to connect");
                    inner.nodes[idx].health_status = NodeHealth::Unreachable;
                }
            }
        }
        let result = self.failover_locked(&mut inner).await.map(|_| ());
        self.publish(&inner);
        result
    }

    /// The active node and its connection.
    pub async fn active(&self) -> Result<(String, Connection)> {
        let inner = self.inner.lock().await;
        inner
            .active
            .and_then(|i| inner.conns[i].clone().map(|c| (inner.nodes[i].node_id.clone(), c)))
            .ok_or_else(|| self.exhausted())
    }

    pub async fn state(&self) -> ServiceState {
        self.inner.lock().await.state
    }

    pub async fn nodes(&self) -> Vec<ClusterNode> {
        self.inner.lock().await.nodes.clone()
    }

    /// Latest published view.
    pub fn view(&self) -> ClusterView {
        self.view_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ClusterView> {
        self.view_tx.subscribe()
    }

    fn exhausted(&self) -> HsmError {
        HsmError::ClusterExhausted {
            service: self.settings.service.clone(),
        }
    }

    fn publish(&self, inner: &Inner) {
        let view = inner.view();
        self.view_tx.send_if_modified(|current| {
            if *current == view {
                false
            } else {
                *current = view;
                true
            }
        });
    }

    /// Run one operation against the active node under the concurrency
    /// ceiling, per-attempt timeout, retry policy and failover. Failover
    /// resubmits without spending a retry attempt.
    pub async fn execute<T, F, Fut>(&self, operation: &str, op: F) -> Result<T>
    where
        F: Fn(Arc<dyn VendorAdapter>, Connection) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _permit = match tokio::time::timeout(self.settings.queue_timeout, self.permits.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(self.exhausted()),
            Err(_) => {
                warn!(operation, limit = self.settings.max_concurrent, "operation rejected by backpressure");
                return Err(HsmError::Backpressure {
                    limit: self.settings.max_concurrent,
                });
            }
        };

        let timeout_ms = u64::try_from(self.settings.op_timeout.as_millis()).unwrap_or(u64::MAX);
        let mut attempt = 0u32;
        let mut failovers = 0usize;
        loop {
            let (node_id, conn) = self.active().await?;
            let outcome = match tokio::time::timeout(self.settings.op_timeout, op(Arc::clone(&self.adapter), conn)).await {
                Ok(result) => result,
                Err(_) => Err(HsmError::Timeout {
                    operation: operation.to_string(),
                    timeout_ms,
                }),
            };
            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            // Node recovery resubmits on the replacement without spending a
            // retry attempt. It is bounded by the size of the cluster.
            if matches!(err, HsmError::NotConnected { .. }) || err.is_node_failure() {
                failovers += 1;
                if failovers > self.node_count {
                    warn!(operation, failovers, error = %err, "node recovery budget spent");
                    return Err(err);
                }
                if matches!(err, HsmError::NotConnected { .. }) {
                    self.reconnect_or_fail_over(&node_id).await?;
                } else {
                    warn!(node_id = %node_id, operation, error = %err, "active node failed");
                    self.fail_over_from(&node_id).await?;
                }
                continue;
            }

            attempt += 1;
            if !self.settings.retry.should_retry(&err) {
                return Err(err);
            }
            if attempt >= self.settings.retry.max_attempts {
                return Err(HsmError::RetriesExhausted {
                    vendor: self.adapter.vendor().to_string(),
                    operation: operation.to_string(),
                    attempts: attempt,
                    last: Box::new(err),
                });
            }
            let delay = self.settings.retry.delay_for(attempt);
            debug!(operation, attempt, delay_ms = delay.as_millis() as u64, "retrying");
            tokio::time::sleep(delay).await;
        }
    }

    /// Mark `node_id` unreachable and promote a replacement, unless another
    /// caller already did.
    async fn fail_over_from(&self, node_id: &str) -> Result<String> {
        let mut inner = self.inner.lock().await;
        match inner.index_of(node_id) {
            Some(idx) if inner.active == Some(idx) => {
                self.demote(&mut inner, idx).await;
                let result = self.failover_locked(&mut inner).await;
                self.publish(&inner);
                result
            }
            _ => inner
                .active
                .map(|i| inner.nodes[i].node_id.clone())
                .ok_or_else(|| self.exhausted()),
        }
    }

    /// The session behind the active connection is gone; open a new one on
    /// the same node, or fail over if the node refuses.
    async fn reconnect_or_fail_over(&self, node_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let Some(idx) = inner.index_of(node_id) else {
            return Err(self.exhausted());
        };
        if inner.active != Some(idx) {
            return Ok(());
        }
        let endpoint = inner.nodes[idx].endpoint.clone();
        match self.adapter.connect(&self.base.for_endpoint(&endpoint)).await {
            Ok(conn) => {
                debug!(node_id, "session re-established");
                inner.conns[idx] = Some(conn);
                Ok(())
            }
            Err(e) => {
                warn!(node_id, error = %e, "reconnect failed");
                self.demote(&mut inner, idx).await;
                let result = self.failover_locked(&mut inner).await.map(|_| ());
                self.publish(&inner);
                result
            }
        }
    }

    async fn demote(&self, inner: &mut Inner, idx: usize) {
        if let Some(conn) = detach(inner, idx) {
            if let Err(e) = self.adapter.disconnect(&conn).await {
                debug!(node_id = %inner.nodes[idx].node_id, error = %e, "disconnect of failed node errored");
            }
        }
    }

    /// Promote the best standby. Caller holds the lock.
    async fn failover_locked(&self, inner: &mut Inner) -> Result<String> {
        for idx in candidate_order(&inner.nodes, self.settings.strategy, inner.last_failed) {
            let node_id = inner.nodes[idx].node_id.clone();
            if inner.conns[idx].is_none() {
                let endpoint = inner.nodes[idx].endpoint.clone();
                match self.adapter.connect(&self.base.for_endpoint(&endpoint)).await {
                    Ok(conn) => inner.conns[idx] = Some(conn),
                    Err(e) => {
                        warn!(node_id = %node_id, error = %e, "failover candidate unreachable");
                        inner.nodes[idx].health_status = NodeHealth::Unreachable;
                        continue;
                    }
                }
            }
            let Some(conn) = inner.conns[idx].clone() else {
                continue;
            };
            let level = match self.adapter.health_check(&conn).await {
                Ok(h) if h.status != HealthLevel::Critical => h.status,
                Ok(_) => {
                    warn!(node_id = %node_id, "failover candidate is critical");
                    self.demote(inner, idx).await;
                    continue;
                }
                Err(e) => {
                    warn!(node_id = %node_id, error = %e, "failover candidate failed health check");
                    self.demote(inner, idx).await;
                    continue;
                }
            };

            inner.nodes[idx].health_status = NodeHealth::Active;
            inner.failures[idx] = 0;
            inner.active = Some(idx);
            inner.epoch += 1;
            inner.state = if level == HealthLevel::Degraded {
                ServiceState::Degraded
            } else {
                ServiceState::Connected
            };
            info!(
                service = %self.settings.service,
                node_id = %node_id,
                priority = inner.nodes[idx].priority,
                epoch = inner.epoch,
                "node promoted to active"
            );
            return Ok(node_id);
        }

        inner.active = None;
        inner.state = ServiceState::Failed;
        error!(service = %self.settings.service, "no healthy node left in cluster");
        Err(self.exhausted())
    }

    fn utilization_percent(&self) -> f64 {
        let max = self.settings.max_concurrent as f64;
        let in_use = self.settings.max_concurrent.saturating_sub(self.permits.available_permits()) as f64;
        in_use / max * 100.0
    }

    /// Health of one node, taken without holding the lock. A non-active
    /// node without a session is connected first.
    async fn observe(&self, target: HealthTarget) -> HealthReading {
        let HealthTarget {
            idx,
            node_id,
            endpoint,
            conn,
            was_active,
        } = target;
        let (conn, opened) = match conn {
            Some(conn) => (Some(conn), false),
            None if was_active => (None, false),
            None => match self.adapter.connect(&self.base.for_endpoint(&endpoint)).await {
                Ok(conn) => (Some(conn), true),
                Err(e) => {
                    debug!(node_id = %node_id, error = %e, "node still unreachable");
                    (None, false)
                }
            },
        };
        let health = match &conn {
            Some(c) => self.adapter.health_check(c).await,
            None => Err(HsmError::NotConnected {
                connection_id: node_id.clone(),
            }),
        };
        if let Err(e) = &health {
            debug!(node_id = %node_id, error = %e, "health check failed");
        }
        HealthReading {
            idx,
            node_id,
            was_active,
            conn,
            opened,
            health,
        }
    }

    /// One health pass over every node. Nodes are checked outside the lock;
    /// the results are applied afterwards, standbys first so failover sees
    /// fresh state, then the active node. A result whose session was
    /// replaced during the pass is discarded.
    pub async fn check_health(&self) -> Result<Vec<Alert>> {
        let targets: Vec<HealthTarget> = {
            let inner = self.inner.lock().await;
            inner
                .nodes
                .iter()
                .enumerate()
                .map(|(idx, n)| HealthTarget {
                    idx,
                    node_id: n.node_id.clone(),
                    endpoint: n.endpoint.clone(),
                    conn: inner.conns[idx].clone(),
                    was_active: inner.active == Some(idx),
                })
                .collect()
        };
        let mut readings = Vec::with_capacity(targets.len());
        for target in targets {
            readings.push(self.observe(target).await);
        }
        let (active_reading, standby_readings): (Vec<HealthReading>, Vec<HealthReading>) =
            readings.into_iter().partition(|r| r.was_active);

        let utilization = self.utilization_percent();
        let mut alerts = Vec::new();
        let mut stale = Vec::new();
        let mut inner = self.inner.lock().await;

        for reading in standby_readings {
            let idx = reading.idx;
            if inner.active == Some(idx) {
                // Promoted during the pass.
                if reading.opened {
                    stale.extend(reading.conn);
                }
                continue;
            }
            let healthy = match &reading.health {
                Ok(h) => {
                    alerts.extend(evaluate_alerts(&reading.node_id, h, &self.settings.thresholds, 0.0));
                    h.status != HealthLevel::Critical
                }
                Err(_) => false,
            };
            if reading.opened {
                match reading.conn {
                    Some(conn) if reading.health.is_ok() && inner.conns[idx].is_none() => inner.conns[idx] = Some(conn),
                    other => stale.extend(other),
                }
            } else if reading.health.is_err() && same_session(inner.conns[idx].as_ref(), reading.conn.as_ref()) {
                stale.extend(inner.conns[idx].take());
            }

            let node_id = reading.node_id;
            if healthy {
                inner.failures[idx] = 0;
                if inner.nodes[idx].health_status == NodeHealth::Unreachable {
                    info!(node_id = %node_id, "node recovered, back to standby");
                    inner.nodes[idx].health_status = NodeHealth::Standby;
                }
            } else {
                inner.failures[idx] += 1;
                if inner.nodes[idx].health_status == NodeHealth::Standby
                    && inner.failures[idx] >= self.settings.thresholds.failure_count.max(1)
                {
                    alerts.push(Alert {
                        node_id: node_id.clone(),
                        kind: AlertKind::ConsecutiveFailures,
                        observed: f64::from(inner.failures[idx]),
                        threshold: f64::from(self.settings.thresholds.failure_count),
                    });
                    warn!(node_id = %node_id, failures = inner.failures[idx], "standby marked unreachable");
                    stale.extend(detach(&mut inner, idx));
                }
            }
        }

        let result = match (active_reading.into_iter().next(), inner.active) {
            (_, None) => self.failover_locked(&mut inner).await.map(|_| ()),
            (Some(reading), Some(idx))
                if reading.idx == idx && same_session(inner.conns[idx].as_ref(), reading.conn.as_ref()) =>
            {
                let node_id = reading.node_id;
                match reading.health {
                    Ok(h) => {
                        alerts.extend(evaluate_alerts(&node_id, &h, &self.settings.thresholds, utilization));
                        match h.status {
                            HealthLevel::Critical => {
                                warn!(node_id = %node_id, error_rate = h.error_rate, latency_ms = h.latency_ms, "active node critical, failing over");
                                stale.extend(detach(&mut inner, idx));
                                self.failover_locked(&mut inner).await.map(|_| ())
                            }
                            HealthLevel::Degraded => {
                                inner.state = ServiceState::Degraded;
                                Ok(())
                            }
                            HealthLevel::Healthy => {
                                inner.state = ServiceState::Connected;
                                Ok(())
                            }
                        }
                    }
                    Err(e) => {
                        warn!(node_id = %node_id, error = %e, "active node health check failed, failing over");
                        stale.extend(detach(&mut inner, idx));
                        self.failover_locked(&mut inner).await.map(|_| ())
                    }
                }
            }
            // The active node changed during the pass; the next pass sees it.
            _ => Ok(()),
        };
        self.publish(&inner);
        drop(inner);

        for conn in stale {
            if let Err(e) = self.adapter.disconnect(&conn).await {
                debug!(endpoint = %conn.endpoint, error = %e, "disconnect of health-check session errored");
            }
        }
        result.map(|_| alerts)
    }

    /// Republish the current view.
    pub async fn sync_view(&self) -> ClusterView {
        let inner = self.inner.lock().await;
        self.publish(&inner);
        inner.view()
    }

    /// Close every session. The service returns to `Disconnected`.
    pub async fn disconnect_all(&self) {
        let mut inner = self.inner.lock().await;
        for idx in 0..inner.nodes.len() {
            if let Some(conn) = inner.conns[idx].take() {
                if let Err(e) = self.adapter.disconnect(&conn).await {
                    debug!(node_id = %inner.nodes[idx].node_id, error = %e, "disconnect errored");
                }
            }
            inner.nodes[idx].health_status = NodeHealth::Standby;
            inner.failures[idx] = 0;
        }
        inner.active = None;
        inner.state = ServiceState::Disconnected;
        self.publish(&inner);
        info!(service = %self.settings.service, "cluster disconnected");
    }

    /// Start the health-check and view-sync loops.
    pub fn spawn_monitors(self: &Arc<Self>, token: CancellationToken) -> Vec<JoinHandle<()>> {
        let health = {
            let manager = Arc::clone(self);
            let token = token.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(manager.settings.health_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {
                            if let Err(e) = manager.check_health().await {
                                error!(error = %e, "health pass failed");
                            }
                        }
                    }
                }
                debug!("health monitor stopped");
            })
        };
        let sync = {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(manager.settings.sync_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {
                            manager.sync_view().await;
                        }
                    }
                }
                debug!("cluster sync stopped");
            })
        };
        vec![health, sync]
    }
}
