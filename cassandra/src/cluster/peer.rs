use std::net::IpAddr;
use uuid::Uuid;

use crate::routing::Token;

/// What the driver knows about one node of the cluster.
///
/// Records are immutable; a status change replaces the record as a whole,
/// and a node leaving the cluster removes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    /// Address the node listens on for client connections.
    pub address: IpAddr,
    /// Datacenter of the node, as reported by the cluster.
    pub datacenter: Option<String>,
    /// Rack of the node within its datacenter.
    pub rack: Option<String>,
    pub host_id: Option<Uuid>,
    pub schema_version: Option<Uuid>,
    /// Server version, e.g. "2.0.9".
    pub release_version: Option<String>,
    /// Tokens owned by the node. Empty for nodes that are still joining.
    pub tokens: Vec<Token>,
    /// Whether the node is considered reachable.
    pub up: bool,
}

impl PeerRecord {
    /// A record of a reachable node with no further information.
    pub fn new(address: IpAddr) -> Self {
        PeerRecord {
            address,
            datacenter: None,
            rack: None,
            host_id: None,
            schema_version: None,
            release_version: None,
            tokens: Vec::new(),
            up: true,
        }
    }

    /// Returns a copy of the record with the given status.
    pub fn with_status(&self, up: bool) -> Self {
        PeerRecord {
            up,
            ..self.clone()
        }
    }

    /// Whether the node is considered reachable.
    pub fn is_up(&self) -> bool {
        self.up
    }

    /// Rack the node is indexed under; nodes without one share the empty rack.
    pub(crate) fn rack_key(&self) -> &str {
        self.rack.as_deref().unwrap_or_default()
    }
}
