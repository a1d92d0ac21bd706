//! Routing policies\
//! A [Session](crate::client::session::Session) asks its cluster's `RoutingPolicy` for the
//! endpoints to try for every request, best candidates first.

use cassandra_cql::frame::types;
use std::net::IpAddr;

use crate::cluster::{PeerRecord, TopologySnapshot};

mod dc_aware;
mod round_robin;
mod token_aware;

pub use dc_aware::DcAwareRoundRobinPolicy;
pub use round_robin::RoundRobinPolicy;
pub use token_aware::TokenAwarePolicy;

/// Represents info about a statement that can be used by routing policies.
#[derive(Default, Clone, Debug)]
pub struct RoutingInfo<'a> {
    /// Consistency the statement is executed with.
    pub consistency: types::Consistency,

    /// Keyspace and serialized partition key; the basis of token-aware routing.
    pub keyspace: Option<&'a str>,
    pub routing_key: Option<&'a [u8]>,
}

/// Endpoints to try for one request, in order of preference.
///
/// Consumed once; every endpoint appears at most once.
pub type RoutingCandidates = Box<dyn Iterator<Item = IpAddr> + Send + Sync>;

/// Policy that decides which endpoints to contact for each request.
///
/// The cluster keeps the policy's endpoint set in sync with the topology: nodes
/// that join or come up are added, nodes that leave or go down are removed.
/// Policies are composed explicitly, e.g. a [`TokenAwarePolicy`] wrapping a
/// [`DcAwareRoundRobinPolicy`].
pub trait RoutingPolicy: Send + Sync + std::fmt::Debug {
    /// Returns the endpoints to try for the request.
    fn active_endpoints(
        &self,
        request: &RoutingInfo<'_>,
        topology: &TopologySnapshot,
    ) -> RoutingCandidates;

    /// Whether the endpoint belongs to the part of the cluster preferred by this policy.
    fn is_local(&self, peer: &PeerRecord) -> bool;

    /// Makes the endpoint eligible for routing.
    fn add_endpoint(&self, peer: &PeerRecord);

    /// Stops routing to the endpoint.
    fn remove_endpoint(&self, peer: &PeerRecord);

    /// Returns the name of the routing policy.
    fn name(&self) -> String;
}
