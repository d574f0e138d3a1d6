//! Shared fixtures: a software cluster and a service on top of it.

#![allow(dead_code)]

use std::sync::Arc;

use hsmvault::keys::KeyStore;
use hsmvault::soft_hsm::VENDOR;
use hsmvault::{ClusterNode, ConfigFactory, CryptoContext, HsmConfig, HsmService, SoftHsmAdapter, SoftHsmFabric, SoftHsmNode};

pub struct Fixture {
    pub fabric: Arc<SoftHsmFabric>,
    pub adapter: Arc<SoftHsmAdapter>,
    pub nodes: Vec<Arc<SoftHsmNode>>,
    pub config: HsmConfig,
}

/// Nodes `(id, priority)` sharing one key partition, under the testing profile.
pub fn cluster(spec: &[(&str, i32)]) -> Fixture {
    let fabric = Arc::new(SoftHsmFabric::new());
    let keys = Arc::new(KeyStore::new());
    let nodes: Vec<Arc<SoftHsmNode>> = spec
        .iter()
        .map(|(id, _)| fabric.add_node(*id, format!("softhsm://{}", id), Arc::clone(&keys)))
        .collect();
    let adapter = Arc::new(SoftHsmAdapter::new(Arc::clone(&fabric), Arc::new(CryptoContext::new())));

    let mut config = ConfigFactory::new(VENDOR, format!("softhsm://{}", spec[0].0), "integration").testing();
    if spec.len() > 1 {
        config.clustering.enabled = true;
        config.clustering.nodes = spec
            .iter()
            .map(|(id, p)| ClusterNode::new(*id, format!("softhsm://{}", id), *p))
            .collect();
    }
    Fixture {
        fabric,
        adapter,
        nodes,
        config,
    }
}

pub async fn started_service(fx: &Fixture) -> HsmService {
    let svc = HsmService::new(fx.config.clone(), fx.adapter.clone()).unwrap();
    svc.start().await.unwrap();
    svc
}

pub fn node<'a>(fx: &'a Fixture, id: &str) -> &'a Arc<SoftHsmNode> {
    fx.nodes.iter().find(|n| n.node_id() == id).unwrap()
}
