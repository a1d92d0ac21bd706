use std::sync::Arc;
use tracing::trace;

use super::{RoutingCandidates, RoutingInfo, RoutingPolicy};
use crate::cluster::{PeerRecord, TopologySnapshot};
use crate::routing::locator::ReplicaList;

/// Sends requests to a replica of the partition they touch.
///
/// For statements with a keyspace and a routing key, the natural replicas the
/// child considers local come first, followed by the child's own order with
/// those replicas left out. Other statements, and keyspaces whose replicas are
/// unknown, are routed by the child alone.
#[derive(Debug)]
pub struct TokenAwarePolicy {
    child: Arc<dyn RoutingPolicy>,
}

impl TokenAwarePolicy {
    /// Wraps the child policy.
    pub fn new(child: Arc<dyn RoutingPolicy>) -> Self {
        TokenAwarePolicy { child }
    }

    fn local_replicas(
        &self,
        request: &RoutingInfo<'_>,
        topology: &TopologySnapshot,
    ) -> Option<ReplicaList> {
        let keyspace = request.keyspace?;
        let routing_key = request.routing_key?;

        let token = topology.partitioner().token(routing_key);
        let replicas = topology.replicas(keyspace, &token);
        trace!(keyspace, %token, ?replicas, "Token-aware routing");
        if replicas.is_empty() {
            return None;
        }

        Some(
            replicas
                .into_iter()
                .filter(|endpoint| {
                    topology
                        .peer(endpoint)
                        .is_some_and(|peer| peer.is_up() && self.child.is_local(peer))
                })
                .collect(),
        )
    }
}

impl RoutingPolicy for TokenAwarePolicy {
    fn active_endpoints(
        &self,
        request: &RoutingInfo<'_>,
        topology: &TopologySnapshot,
    ) -> RoutingCandidates {
        let child_plan = self.child.active_endpoints(request, topology);
        match self.local_replicas(request, topology) {
            Some(local) => {
                let yielded = local.clone();
                Box::new(
                    local
                        .into_iter()
                        .chain(child_plan.filter(move |endpoint| !yielded.contains(endpoint))),
                )
            }
            None => child_plan,
        }
    }

    fn is_local(&self, peer: &PeerRecord) -> bool {
        self.child.is_local(peer)
    }

    fn add_endpoint(&self, peer: &PeerRecord) {
        self.child.add_endpoint(peer);
    }

    fn remove_endpoint(&self, peer: &PeerRecord) {
        self.child.remove_endpoint(peer);
    }

    fn name(&self) -> String {
        format!("TokenAwarePolicy({})", self.child.name())
    }
}
