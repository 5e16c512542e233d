use crate::{errors::ControllerError, keys::ObjectKey};

use async_trait::async_trait;
use k8s_openapi::api::{apps::v1::Deployment, core::v1::Node};
use kube::Resource;
use kube_runtime::{
    events::{Event, EventType, Recorder},
    reflector::{ObjectRef, Store},
};
use p47_network_apis::Network;
use std::sync::Arc;

/// Brings the cluster in line with the object identified by a work queue key.
///
/// Implementations must be idempotent, the same key is reconciled again after
/// every change and after every failure.
#[async_trait]
pub(crate) trait Reconciler: Send + Sync + 'static {
    async fn reconcile(&self, key: &ObjectKey) -> Result<(), ControllerError>;
}

/// Reconciles [`Network`] objects.
///
/// There is no provisioning logic yet, a network is only looked up in the
/// informer cache and acknowledged with a `Synced` event.
pub(crate) struct NetworkReconciler {
    networks: Store<Network>,
    nodes: Store<Node>,
    deployments: Store<Deployment>,
    recorder: Option<Recorder>,
}

impl NetworkReconciler {
    pub fn new(
        networks: Store<Network>,
        nodes: Store<Node>,
        deployments: Store<Deployment>,
        recorder: Option<Recorder>,
    ) -> Self {
        Self {
            networks,
            nodes,
            deployments,
            recorder,
        }
    }

    fn summary(&self, network: &Network) -> String {
        format!(
            "network {} (cidr {}, gateway {}) with {} nodes and {} deployments in cache",
            network.versioned_id(),
            network.spec.cidr,
            network.spec.gateway,
            self.nodes.state().len(),
            self.deployments.state().len(),
        )
    }

    fn lookup(&self, key: &ObjectKey) -> Option<Arc<Network>> {
        let obj_ref = match &key.namespace {
            Some(namespace) => ObjectRef::new(&key.name).within(namespace),
            None => ObjectRef::new(&key.name),
        };
        self.networks.get(&obj_ref)
    }

    fn synced_event(network: &Network) -> Event {
        Event {
            type_: EventType::Normal,
            reason: "Synced".to_string(),
            note: Some(format!(
                "Network synced (cidr {}, gateway {})",
                network.spec.cidr, network.spec.gateway
            )),
            action: "Reconcile".to_string(),
            secondary: None,
        }
    }

    async fn publish_synced(&self, recorder: &Recorder, network: &Network) {
        let event = Self::synced_event(network);
        if let Err(e) = recorder.publish(&event, &network.object_ref(&())).await {
            warn!("failed to publish event for network {}: {}", network.id(), e);
        }
    }
}

#[async_trait]
impl Reconciler for NetworkReconciler {
    async fn reconcile(&self, key: &ObjectKey) -> Result<(), ControllerError> {
        match self.lookup(key) {
            None => info!("network {} no longer exists", key),
            Some(network) => {
                info!("syncing {}", self.summary(&network));
                if let Some(recorder) = &self.recorder {
                    self.publish_synced(recorder, &network).await;
                }
            }
        }
        Ok(())
    }
}
