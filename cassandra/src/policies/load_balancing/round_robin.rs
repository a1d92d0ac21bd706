use arc_swap::ArcSwap;
use rand::Rng;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::trace;

use super::{RoutingCandidates, RoutingInfo, RoutingPolicy};
use crate::cluster::{PeerRecord, TopologySnapshot};

/// Rotates over all known endpoints, starting one further with every request.
///
/// The endpoint list is copy-on-write, so a plan keeps the list it started with
/// even if endpoints are added or removed meanwhile.
#[derive(Debug)]
pub struct RoundRobinPolicy {
    endpoints: ArcSwap<Vec<IpAddr>>,
    counter: AtomicUsize,
}

impl RoundRobinPolicy {
    /// Creates a policy with no endpoints.
    pub fn new() -> Self {
        Self::with_endpoints(Vec::new())
    }

    /// Creates a policy routing to the given endpoints.
    pub fn with_endpoints(endpoints: Vec<IpAddr>) -> Self {
        RoundRobinPolicy {
            endpoints: ArcSwap::from_pointee(endpoints),
            // Spread the starting points of policies created at the same time.
            counter: AtomicUsize::new(rand::rng().random_range(0..997)),
        }
    }

    /// Endpoints currently routed to.
    pub fn endpoints(&self) -> Arc<Vec<IpAddr>> {
        self.endpoints.load_full()
    }

    pub(crate) fn rotation(&self) -> RoutingCandidates {
        let endpoints = self.endpoints.load_full();
        let len = endpoints.len();
        let start = self.counter.fetch_add(1, Ordering::Relaxed);
        Box::new((0..len).map(move |offset| endpoints[(start.wrapping_add(offset)) % len]))
    }

    pub(crate) fn add(&self, endpoint: IpAddr) {
        self.endpoints.rcu(|current| {
            if current.contains(&endpoint) {
                Arc::clone(current)
            } else {
                let mut next = Vec::clone(current);
                next.push(endpoint);
                Arc::new(next)
            }
        });
    }

    pub(crate) fn remove(&self, endpoint: &IpAddr) {
        self.endpoints.rcu(|current| {
            if current.contains(endpoint) {
                Arc::new(current.iter().filter(|e| *e != endpoint).copied().collect())
            } else {
                Arc::clone(current)
            }
        });
    }
}

impl Default for RoundRobinPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingPolicy for RoundRobinPolicy {
    fn active_endpoints(
        &self,
        _request: &RoutingInfo<'_>,
        _topology: &TopologySnapshot,
    ) -> RoutingCandidates {
        self.rotation()
    }

    fn is_local(&self, _peer: &PeerRecord) -> bool {
        true
    }

    fn add_endpoint(&self, peer: &PeerRecord) {
        trace!(address = %peer.address, "Round robin: adding endpoint");
        self.add(peer.address);
    }

    fn remove_endpoint(&self, peer: &PeerRecord) {
        trace!(address = %peer.address, "Round robin: removing endpoint");
        self.remove(&peer.address);
    }

    fn name(&self) -> String {
        "RoundRobinPolicy".to_string()
    }
}
