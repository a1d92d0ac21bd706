use dashmap::DashMap;
use itertools::Itertools;
use std::net::IpAddr;

use super::round_robin::RoundRobinPolicy;
use super::{RoutingCandidates, RoutingInfo, RoutingPolicy};
use crate::cluster::{PeerRecord, TopologySnapshot};

/// Round robin inside each datacenter; endpoints of the local datacenter come
/// first, those of the remote datacenters after them.
///
/// Endpoints with no known datacenter are never routed to.
#[derive(Debug)]
pub struct DcAwareRoundRobinPolicy {
    local_dc: String,
    per_dc: DashMap<String, RoundRobinPolicy>,
}

impl DcAwareRoundRobinPolicy {
    /// Creates a policy preferring `local_dc`.
    pub fn new(local_dc: impl Into<String>) -> Self {
        let local_dc = local_dc.into();
        let per_dc = DashMap::new();
        per_dc.insert(local_dc.clone(), RoundRobinPolicy::new());
        DcAwareRoundRobinPolicy { local_dc, per_dc }
    }

    /// The preferred datacenter.
    pub fn local_dc(&self) -> &str {
        &self.local_dc
    }

    fn rotation_of(&self, datacenter: &str) -> Vec<IpAddr> {
        self.per_dc
            .get(datacenter)
            .map(|policy| policy.rotation().collect())
            .unwrap_or_default()
    }
}

impl RoutingPolicy for DcAwareRoundRobinPolicy {
    fn active_endpoints(
        &self,
        _request: &RoutingInfo<'_>,
        _topology: &TopologySnapshot,
    ) -> RoutingCandidates {
        let remote_dcs: Vec<String> = self
            .per_dc
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|dc| *dc != self.local_dc)
            .sorted()
            .collect();

        let mut endpoints = self.rotation_of(&self.local_dc);
        for dc in remote_dcs {
            endpoints.extend(self.rotation_of(&dc));
        }
        Box::new(endpoints.into_iter())
    }

    fn is_local(&self, peer: &PeerRecord) -> bool {
        peer.datacenter.as_deref() == Some(self.local_dc.as_str())
    }

    fn add_endpoint(&self, peer: &PeerRecord) {
        if let Some(dc) = &peer.datacenter {
            self.per_dc.entry(dc.clone()).or_default().add(peer.address);
        }
    }

    fn remove_endpoint(&self, peer: &PeerRecord) {
        // The datacenter of a peer may have changed since it was added.
        for policy in self.per_dc.iter() {
            policy.remove(&peer.address);
        }
    }

    fn name(&self) -> String {
        "DcAwareRoundRobinPolicy".to_string()
    }
}
