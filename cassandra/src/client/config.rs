//! Configuration of a [`Cluster`](crate::cluster::Cluster).

use cassandra_cql::frame::server_event_type::EventType;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::cluster::EventListener;
use crate::errors::ConfigError;
use crate::network::ConnectionConfig;
use crate::policies::load_balancing::{RoundRobinPolicy, RoutingPolicy};
use crate::policies::retry::{ErrorCodeAwareRetryPolicy, MaxRetriesPolicy, RetryPolicy};

/// Port of the native protocol.
pub const DEFAULT_PORT: u16 = 9042;

/// Configuration options for [`Cluster`](crate::cluster::Cluster).
///
/// The configuration is fixed once the cluster is connected. Start from
/// [`ClusterConfig::new`] and override the public fields as needed.
#[derive(Clone)]
#[non_exhaustive]
pub struct ClusterConfig {
    /// Nodes contacted first. They are tried in order when the control
    /// connection is established or re-established.
    pub seeds: Vec<IpAddr>,

    /// Port every node listens on.
    pub port: u16,

    /// Options of every connection the driver opens. The keyspace and the
    /// event sender are set by the driver per connection.
    pub connection: ConnectionConfig,

    /// A request with no response after this long fails with a timeout.
    /// Also bounds [`Session::execute_blocking`](crate::client::session::Session::execute_blocking).
    pub request_deadline: Duration,

    /// How often pending requests are checked against the deadline.
    pub sweep_interval: Duration,

    /// Chooses the endpoints a request is sent to.
    pub routing_policy: Arc<dyn RoutingPolicy>,

    /// Decides whether a failed request is tried again.
    pub retry_policy: Arc<dyn RetryPolicy>,

    /// Events the control connection registers for.
    pub event_types: Vec<EventType>,

    /// Listeners added before the cluster is discovered, so they see the initial joins.
    pub listeners: Vec<Arc<dyn EventListener>>,
}

impl ClusterConfig {
    /// Creates a configuration with default options and the given seeds.
    ///
    /// Every seed must be an IP address, and there must be at least one.
    pub fn new<S: AsRef<str>>(seeds: impl IntoIterator<Item = S>) -> Result<Self, ConfigError> {
        let seeds = seeds
            .into_iter()
            .map(|seed| {
                let seed = seed.as_ref().trim();
                seed.parse::<IpAddr>()
                    .map_err(|_| ConfigError::BadSeed(seed.to_owned()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        if seeds.is_empty() {
            return Err(ConfigError::EmptySeedList);
        }
        Ok(ClusterConfig {
            seeds,
            ..Default::default()
        })
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            seeds: Vec::new(),
            port: DEFAULT_PORT,
            connection: ConnectionConfig::default(),
            request_deadline: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(10),
            routing_policy: Arc::new(RoundRobinPolicy::new()),
            retry_policy: Arc::new(MaxRetriesPolicy::new(Arc::new(ErrorCodeAwareRetryPolicy))),
            event_types: vec![
                EventType::TopologyChange,
                EventType::StatusChange,
                EventType::SchemaChange,
            ],
            listeners: Vec::new(),
        }
    }
}

impl std::fmt::Debug for ClusterConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterConfig")
            .field("seeds", &self.seeds)
            .field("port", &self.port)
            .field("connection", &self.connection)
            .field("request_deadline", &self.request_deadline)
            .field("sweep_interval", &self.sweep_interval)
            .field("routing_policy", &self.routing_policy.name())
            .field("retry_policy", &self.retry_policy)
            .field("event_types", &self.event_types)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}
